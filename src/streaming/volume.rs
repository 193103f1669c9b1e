//! Volume-side entry point for block streaming

use crate::core::types::Result;
use crate::storage::{BlockAddress, BlockStore, InstanceBlockPayload};
use crate::streaming::dependency::StreamingDependency;
use crate::streaming::load_task::LoadBlockTask;
use crate::streaming::save_task::{SaveBlockTask, SharedVoxels};
use std::sync::Arc;

/// Streaming state owned by one voxel volume
///
/// Creates the tasks the external scheduler runs, and tears the store down
/// in order when the volume goes away: pending writes are flushed, then the
/// dependency is invalidated so late results are discarded.
pub struct VolumeStreaming {
    dependency: Arc<StreamingDependency>,
    block_size: u32,
}

impl VolumeStreaming {
    pub fn new(store: Arc<dyn BlockStore>, block_size: u32) -> Self {
        log::info!(
            "Volume streaming started (block size {}, instances {}, full dump {})",
            block_size,
            store.supports_instances(),
            store.supports_full_dump()
        );
        Self {
            dependency: StreamingDependency::new(store),
            block_size,
        }
    }

    pub fn dependency(&self) -> &Arc<StreamingDependency> {
        &self.dependency
    }

    pub fn store(&self) -> &dyn BlockStore {
        self.dependency.store()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn submit_save(&self, address: BlockAddress, voxels: SharedVoxels) -> Box<SaveBlockTask> {
        Box::new(SaveBlockTask::voxels(
            address,
            self.block_size,
            voxels,
            self.dependency.clone(),
        ))
    }

    pub fn submit_save_instances(
        &self,
        address: BlockAddress,
        instances: Option<InstanceBlockPayload>,
    ) -> Box<SaveBlockTask> {
        Box::new(SaveBlockTask::instances(
            address,
            self.block_size,
            instances,
            self.dependency.clone(),
        ))
    }

    /// Create a task loading one block
    ///
    /// # Arguments
    /// * `address` - Block to load
    /// * `request_instances` - Also load instance placements when supported
    pub fn submit_load(&self, address: BlockAddress, request_instances: bool) -> Box<LoadBlockTask> {
        Box::new(
            LoadBlockTask::new(address, self.block_size, self.dependency.clone())
                .with_instances(request_instances),
        )
    }

    /// Flush pending writes, then mark the volume as gone
    ///
    /// The dependency is invalidated even when the flush fails.
    pub fn shutdown(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.dependency.is_valid() {
            return Ok(());
        }
        let flushed = self.dependency.store().flush();
        self.dependency.invalidate();
        log::info!(
            "Volume streaming stopped ({} tasks still hold the store)",
            Arc::strong_count(&self.dependency) - 1
        );
        flushed
    }
}

impl Drop for VolumeStreaming {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::error!("Failed to flush block store on volume teardown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        ChannelDepth, PersistentBlockStore, StoreConfig, VoxelBlockPayload, VoxelChannel,
    };
    use crate::streaming::task::{OutputKind, StreamingTask};
    use parking_lot::RwLock;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<PersistentBlockStore> {
        Arc::new(PersistentBlockStore::open(&StoreConfig::new(dir.path().join("volume.sqlite"))).unwrap())
    }

    fn voxels(fill: u64) -> VoxelBlockPayload {
        VoxelBlockPayload::cube(16).with_channel(VoxelChannel::uniform(0, ChannelDepth::Bits8, fill))
    }

    #[test]
    fn test_save_then_load_through_tasks() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeStreaming::new(open(&dir), 16);
        let addr = BlockAddress::new(2, -1, 0, 0);

        let mut save = volume.submit_save(addr, Arc::new(RwLock::new(voxels(1))));
        save.run();
        let mut saved = Vec::new();
        save.apply_result(&mut |o| saved.push(o.kind));
        assert_eq!(saved, vec![OutputKind::Saved]);

        let mut load = volume.submit_load(addr, false);
        load.run();
        let mut loaded = None;
        load.apply_result(&mut |o| loaded = o.data.voxels);
        assert_eq!(loaded, Some(voxels(1)));
    }

    #[test]
    fn test_shutdown_flushes_and_invalidates() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let volume = VolumeStreaming::new(store.clone(), 16);
        let addr = BlockAddress::new(4, 0, 0, 1);

        let mut save = volume.submit_save(addr, Arc::new(RwLock::new(voxels(2))));
        save.run();
        assert_eq!(store.pending_writes(), 1);

        let dependency = volume.dependency().clone();
        volume.shutdown().unwrap();
        assert!(!dependency.is_valid());
        assert_eq!(store.pending_writes(), 0);

        let mut called = false;
        save.apply_result(&mut |_| called = true);
        assert!(!called);
    }

    #[test]
    fn test_drop_tears_down() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let dependency = {
            let volume = VolumeStreaming::new(store.clone(), 16);
            volume
                .store()
                .save(BlockAddress::new(0, 0, 0, 0), voxels(3))
                .unwrap();
            volume.dependency().clone()
        };
        assert!(!dependency.is_valid());
        assert_eq!(store.pending_writes(), 0);
    }

    #[test]
    fn test_instance_save_reverts() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let volume = VolumeStreaming::new(store.clone(), 16);
        let addr = BlockAddress::new(1, 0, 1, 0);

        let mut save = volume.submit_save_instances(addr, None);
        save.run();
        store.flush().unwrap();

        assert_eq!(store.load_instances(addr).unwrap(), None);
        assert!(store.has_instance_row(addr).unwrap());
    }
}
