//! Process-wide memory manager instance.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::MemoryManager;
use crate::config::MemoryManagerOptions;
use crate::error::{MemoryError, MemoryResult};

static INSTANCE: Mutex<Option<Arc<MemoryManager>>> = parking_lot::const_mutex(None);

impl MemoryManager {
    /// Installs the process-wide manager.
    ///
    /// Fails with [`MemoryError::AlreadyInitialized`] if one is set.
    pub fn initialize(options: MemoryManagerOptions) -> MemoryResult<Arc<Self>> {
        let mut instance = INSTANCE.lock();
        if let Some(existing) = instance.as_ref() {
            return Err(MemoryError::AlreadyInitialized {
                existing: existing.dump(false),
            });
        }
        let manager = Arc::new(Self::new(options)?);
        *instance = Some(Arc::clone(&manager));
        info!(capacity = manager.capacity(), "initialized process memory manager");
        Ok(manager)
    }

    /// Returns the process-wide manager.
    pub fn get_instance() -> MemoryResult<Arc<Self>> {
        INSTANCE.lock().clone().ok_or(MemoryError::NotInitialized)
    }

    /// Returns the process-wide manager, creating it from `options` if unset.
    ///
    /// `options` are ignored when a manager already exists. Prefer
    /// [`initialize`](Self::initialize) followed by
    /// [`get_instance`](Self::get_instance).
    pub fn deprecated_get_instance(options: MemoryManagerOptions) -> MemoryResult<Arc<Self>> {
        let mut instance = INSTANCE.lock();
        if let Some(existing) = instance.as_ref() {
            return Ok(Arc::clone(existing));
        }
        let manager = Arc::new(Self::new(options)?);
        *instance = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// Replaces the process-wide manager with one built from `options`.
    ///
    /// For tests only. The previous manager is torn down once its last
    /// handle goes away.
    pub fn testing_set_instance(options: MemoryManagerOptions) -> MemoryResult<Arc<Self>> {
        let manager = Arc::new(Self::new(options)?);
        let previous = INSTANCE.lock().replace(Arc::clone(&manager));
        if previous.is_some() {
            warn!("replaced process memory manager");
        }
        drop(previous);
        Ok(manager)
    }

    /// Clears the process-wide manager and hands back the previous one.
    ///
    /// For tests only.
    pub fn testing_reset_instance() -> Option<Arc<Self>> {
        INSTANCE.lock().take()
    }
}

/// Installs the process-wide manager. See [`MemoryManager::initialize`].
pub fn initialize_memory_manager(options: MemoryManagerOptions) -> MemoryResult<Arc<MemoryManager>> {
    MemoryManager::initialize(options)
}

/// Returns the process-wide manager. See [`MemoryManager::get_instance`].
pub fn memory_manager() -> MemoryResult<Arc<MemoryManager>> {
    MemoryManager::get_instance()
}
