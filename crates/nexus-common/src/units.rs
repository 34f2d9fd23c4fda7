//! Byte quantities: parsing, formatting and serde support.
//!
//! All units are binary (`1KB == 1024B`), matching the sizes printed by
//! [`succinct_bytes`].

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::{GB, KB, MAX_MEMORY, MB, TB};
use crate::error::NexusError;

const UNITS: [(&str, u64); 5] = [("TB", TB), ("GB", GB), ("MB", MB), ("KB", KB), ("B", 1)];

/// Formats a byte count with two decimals in the largest fitting unit.
///
/// # Example
///
/// ```rust
/// use nexus_common::units::succinct_bytes;
///
/// assert_eq!(succinct_bytes(512), "512B");
/// assert_eq!(succinct_bytes(1536), "1.50KB");
/// ```
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn succinct_bytes(bytes: u64) -> String {
    if bytes >= MAX_MEMORY {
        return "UNLIMITED".to_string();
    }
    if bytes < KB {
        return format!("{bytes}B");
    }
    for (suffix, unit) in UNITS {
        if bytes >= unit {
            return format!("{:.2}{suffix}", bytes as f64 / unit as f64);
        }
    }
    unreachable!("bytes >= KB always matches a unit")
}

/// A byte quantity that can be written as an integer or a string like `"512MB"`.
///
/// [`ByteSize::UNLIMITED`] is written as `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// The unlimited sentinel.
    pub const UNLIMITED: Self = Self(MAX_MEMORY);

    /// Creates a byte size from a raw byte count.
    #[inline]
    #[must_use]
    pub const fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Creates a byte size from kibibytes.
    #[inline]
    #[must_use]
    pub const fn kb(n: u64) -> Self {
        Self(n * KB)
    }

    /// Creates a byte size from mebibytes.
    #[inline]
    #[must_use]
    pub const fn mb(n: u64) -> Self {
        Self(n * MB)
    }

    /// Creates a byte size from gibibytes.
    #[inline]
    #[must_use]
    pub const fn gb(n: u64) -> Self {
        Self(n * GB)
    }

    /// Returns the raw byte count.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true for the unlimited sentinel.
    #[inline]
    #[must_use]
    pub const fn is_unlimited(self) -> bool {
        self.0 >= MAX_MEMORY
    }
}

impl From<u64> for ByteSize {
    fn from(bytes: u64) -> Self {
        Self(bytes)
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&succinct_bytes(self.0))
    }
}

impl FromStr for ByteSize {
    type Err = NexusError;

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.eq_ignore_ascii_case("unlimited") || input.eq_ignore_ascii_case("max") {
            return Ok(Self::UNLIMITED);
        }

        let split = input
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(input.len());
        let (number, unit) = input.split_at(split);
        if number.is_empty() {
            return Err(NexusError::invalid_byte_size(s, "missing number"));
        }

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KB,
            "M" | "MB" | "MIB" => MB,
            "G" | "GB" | "GIB" => GB,
            "T" | "TB" | "TIB" => TB,
            other => {
                return Err(NexusError::invalid_byte_size(
                    s,
                    format!("unknown unit '{other}'"),
                ))
            }
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .filter(|bytes| *bytes <= MAX_MEMORY)
                .map(Self)
                .ok_or_else(|| NexusError::invalid_byte_size(s, "value too large"));
        }

        let fractional: f64 = number
            .parse()
            .map_err(|_| NexusError::invalid_byte_size(s, "malformed number"))?;
        let bytes = fractional * multiplier as f64;
        if !bytes.is_finite() || bytes > MAX_MEMORY as f64 {
            return Err(NexusError::invalid_byte_size(s, "value too large"));
        }
        Ok(Self(bytes as u64))
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_unlimited() {
            serializer.serialize_str("unlimited")
        } else {
            serializer.serialize_u64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a byte count or a size string such as \"512MB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v.min(MAX_MEMORY)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom("byte size must not be negative"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succinct_bytes() {
        assert_eq!(succinct_bytes(0), "0B");
        assert_eq!(succinct_bytes(1023), "1023B");
        assert_eq!(succinct_bytes(1024), "1.00KB");
        assert_eq!(succinct_bytes(3 * MB + MB / 2), "3.50MB");
        assert_eq!(succinct_bytes(2 * GB), "2.00GB");
        assert_eq!(succinct_bytes(MAX_MEMORY), "UNLIMITED");
    }

    #[test]
    fn test_parse_plain_and_units() {
        assert_eq!("512".parse::<ByteSize>().unwrap(), ByteSize::new(512));
        assert_eq!("512B".parse::<ByteSize>().unwrap(), ByteSize::new(512));
        assert_eq!("4KB".parse::<ByteSize>().unwrap(), ByteSize::kb(4));
        assert_eq!("4 kib".parse::<ByteSize>().unwrap(), ByteSize::kb(4));
        assert_eq!("128M".parse::<ByteSize>().unwrap(), ByteSize::mb(128));
        assert_eq!("1.5GB".parse::<ByteSize>().unwrap(), ByteSize::new(GB + GB / 2));
        assert_eq!("unlimited".parse::<ByteSize>().unwrap(), ByteSize::UNLIMITED);
    }

    #[test]
    fn test_parse_errors() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("MB".parse::<ByteSize>().is_err());
        assert!("12XB".parse::<ByteSize>().is_err());
        assert!("1.2.3MB".parse::<ByteSize>().is_err());
        assert!("99999999999TB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn test_serde_json() {
        let size: ByteSize = serde_json::from_str("\"256MB\"").unwrap();
        assert_eq!(size, ByteSize::mb(256));

        let size: ByteSize = serde_json::from_str("4096").unwrap();
        assert_eq!(size, ByteSize::kb(4));

        assert!(serde_json::from_str::<ByteSize>("-1").is_err());

        assert_eq!(serde_json::to_string(&ByteSize::kb(1)).unwrap(), "1024");
        assert_eq!(
            serde_json::to_string(&ByteSize::UNLIMITED).unwrap(),
            "\"unlimited\""
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteSize::mb(64).to_string(), "64.00MB");
        assert!(ByteSize::UNLIMITED.is_unlimited());
        assert!(!ByteSize::gb(1).is_unlimited());
    }
}
