//! Shared liveness handle between a volume and its in-flight tasks

use crate::storage::BlockStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Binds a volume's block store to a liveness flag
///
/// Every task issued for a volume holds an `Arc` to the same dependency. The
/// store stays alive until the last task releases it, and the flag tells a
/// finished task whether its volume still exists to receive the result.
pub struct StreamingDependency {
    store: Arc<dyn BlockStore>,
    valid: AtomicBool,
}

impl StreamingDependency {
    pub fn new(store: Arc<dyn BlockStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            valid: AtomicBool::new(true),
        })
    }

    pub fn store(&self) -> &dyn BlockStore {
        self.store.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the owning volume as gone
    ///
    /// Returns `true` for the call that actually flipped the flag.
    pub fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for StreamingDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingDependency")
            .field("store", &"<BlockStore>")
            .field("valid", &self.is_valid())
            .finish()
    }
}
