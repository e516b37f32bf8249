//! The host service seam: a process-wide accounting hook a hosting
//! environment may install once to observe every cache's approximate size and
//! teardown.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use uuid::Uuid;

/// Installed by the host to aggregate memory accounting across all cache
/// instances in the process.
pub trait MemoryCacheManager: Send + Sync + 'static {
    /// Reports a cache's current approximate size in bytes. Called from the
    /// cache's statistics loop.
    fn update_cache_size(&self, size_bytes: u64, cache_id: Uuid);

    /// The cache identified by `cache_id` has been disposed.
    fn release_cache(&self, cache_id: Uuid);
}

static MANAGER: OnceCell<Arc<dyn MemoryCacheManager>> = OnceCell::new();

/// Installs the process-wide memory cache manager. Set-once: installing a
/// second manager is a programming error.
///
/// # Panics
///
/// Panics when a manager has already been installed.
pub fn set_memory_cache_manager(manager: Arc<dyn MemoryCacheManager>) {
    if MANAGER.set(manager).is_err() {
        panic!("the process-wide memory cache manager is already set");
    }
}

pub(crate) fn memory_cache_manager() -> Option<&'static Arc<dyn MemoryCacheManager>> {
    MANAGER.get()
}
