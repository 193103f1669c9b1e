//! Task saving one voxel or instance block

use crate::core::error::Error;
use crate::core::types::UVec3;
use crate::storage::{BlockAddress, InstanceBlockPayload, VoxelBlockPayload};
use crate::streaming::dependency::StreamingDependency;
use crate::streaming::task::{deliver, BlockData, BlockDataOutput, CancelToken, OutputKind, StreamingTask};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Voxel buffer shared between a volume and the tasks saving it
pub type SharedVoxels = Arc<RwLock<VoxelBlockPayload>>;

static LIVE_SAVE_TASKS: AtomicUsize = AtomicUsize::new(0);

enum SaveData {
    Voxels(SharedVoxels),
    /// `None` reverts the block to "not authored"
    Instances(Option<InstanceBlockPayload>),
}

/// Saves a block through the volume's store
pub struct SaveBlockTask {
    address: BlockAddress,
    block_size: u32,
    /// Moved out when the task runs
    data: Option<SaveData>,
    dependency: Arc<StreamingDependency>,
    cancel: CancelToken,
    error: Option<Error>,
    ran: bool,
}

impl SaveBlockTask {
    /// Save voxel data
    ///
    /// The buffer is only read-locked long enough to copy it when the task
    /// runs; the volume may keep using it in the meantime.
    pub fn voxels(
        address: BlockAddress,
        block_size: u32,
        voxels: SharedVoxels,
        dependency: Arc<StreamingDependency>,
    ) -> Self {
        Self::new(address, block_size, SaveData::Voxels(voxels), dependency)
    }

    /// Save instance placements, or revert them with `None`
    pub fn instances(
        address: BlockAddress,
        block_size: u32,
        instances: Option<InstanceBlockPayload>,
        dependency: Arc<StreamingDependency>,
    ) -> Self {
        Self::new(address, block_size, SaveData::Instances(instances), dependency)
    }

    fn new(address: BlockAddress, block_size: u32, data: SaveData, dependency: Arc<StreamingDependency>) -> Self {
        LIVE_SAVE_TASKS.fetch_add(1, Ordering::Relaxed);
        Self {
            address,
            block_size,
            data: Some(data),
            dependency,
            cancel: CancelToken::new(),
            error: None,
            ran: false,
        }
    }

    /// Token to cancel this task before it runs
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn address(&self) -> BlockAddress {
        self.address
    }

    pub fn has_run(&self) -> bool {
        self.ran
    }

    /// Number of save tasks currently alive
    pub fn debug_running_count() -> usize {
        LIVE_SAVE_TASKS.load(Ordering::Relaxed)
    }
}

impl StreamingTask for SaveBlockTask {
    fn run(&mut self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(data) = self.data.take() else {
            return;
        };
        let store = self.dependency.store();

        let result = match data {
            SaveData::Voxels(shared) => {
                let snapshot = shared.read().clone();
                drop(shared);

                if snapshot.size != UVec3::splat(self.block_size) {
                    log::debug!(
                        "Saving block {} with size {} (expected {})",
                        self.address, snapshot.size, self.block_size
                    );
                }
                store.save(self.address, snapshot)
            }
            SaveData::Instances(instances) => {
                if store.supports_instances() {
                    log::trace!(
                        "Saving instance block {} ({})",
                        self.address,
                        match &instances {
                            Some(p) => format!("{} instances", p.instance_count()),
                            None => "reverted".to_string(),
                        }
                    );
                    store.save_instances(self.address, instances)
                } else {
                    log::debug!("Store has no instance support, skipping save of {}", self.address);
                    Ok(())
                }
            }
        };

        if let Err(e) = result {
            log::error!("Failed to save block {}: {}", self.address, e);
            self.error = Some(e);
        }
        self.ran = true;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn apply_result(mut self: Box<Self>, callback: &mut dyn FnMut(BlockDataOutput)) {
        let (kind, error) = if self.ran {
            (OutputKind::Saved, self.error.take())
        } else {
            (OutputKind::Dropped, Some(Error::Cancelled))
        };
        let output = BlockDataOutput {
            address: self.address,
            block_size: self.block_size,
            kind,
            data: BlockData::default(),
            error,
        };
        deliver(&self.dependency, output, callback);
    }
}

impl Drop for SaveBlockTask {
    fn drop(&mut self) {
        LIVE_SAVE_TASKS.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        BlockStore, ChannelData, ChannelDepth, PersistentBlockStore, StoreConfig, VoxelChannel,
    };
    use rayon::prelude::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<PersistentBlockStore>, Arc<StreamingDependency>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            PersistentBlockStore::open(&StoreConfig::new(dir.path().join("volume.sqlite"))).unwrap(),
        );
        let dependency = StreamingDependency::new(store.clone());
        (dir, store, dependency)
    }

    fn shared(fill: u64) -> SharedVoxels {
        Arc::new(RwLock::new(
            VoxelBlockPayload::cube(16).with_channel(VoxelChannel::uniform(0, ChannelDepth::Bits8, fill)),
        ))
    }

    fn collect(task: Box<dyn StreamingTask>) -> Vec<BlockDataOutput> {
        let mut outputs = Vec::new();
        task.apply_result(&mut |o| outputs.push(o));
        outputs
    }

    #[test]
    fn test_save_voxels_reports_saved() {
        let (_dir, store, dep) = setup();
        let addr = BlockAddress::new(2, -1, 0, 0);
        let mut task = Box::new(SaveBlockTask::voxels(addr, 16, shared(4), dep));

        task.run();
        assert!(task.has_run());

        let outputs = collect(task);
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].kind, OutputKind::Saved);
        assert!(outputs[0].error.is_none());
        assert_eq!(store.load(addr).unwrap(), Some(shared(4).read().clone()));
    }

    #[test]
    fn test_snapshot_taken_at_run_time() {
        let (_dir, store, dep) = setup();
        let addr = BlockAddress::new(0, 0, 0, 0);
        let voxels = shared(1);
        let mut task = SaveBlockTask::voxels(addr, 16, voxels.clone(), dep);

        *voxels.write() = shared(2).read().clone();
        task.run();
        *voxels.write() = shared(3).read().clone();

        assert_eq!(store.load(addr).unwrap(), Some(shared(2).read().clone()));
        assert_eq!(Arc::strong_count(&voxels), 1);
    }

    #[test]
    fn test_save_instances() {
        let (_dir, store, dep) = setup();
        let addr = BlockAddress::new(1, 1, 1, 1);
        let mut task = SaveBlockTask::instances(addr, 16, Some(InstanceBlockPayload::cleared()), dep);
        task.run();

        assert_eq!(store.load_instances(addr).unwrap(), Some(InstanceBlockPayload::cleared()));
    }

    #[test]
    fn test_cancelled_task_is_dropped() {
        let (_dir, store, dep) = setup();
        let addr = BlockAddress::new(5, 5, 5, 0);
        let mut task = Box::new(SaveBlockTask::voxels(addr, 16, shared(1), dep));

        task.cancel_token().cancel();
        assert!(task.is_cancelled());
        task.run();
        assert!(!task.has_run());

        let outputs = collect(task);
        assert_eq!(outputs[0].kind, OutputKind::Dropped);
        assert!(matches!(outputs[0].error, Some(Error::Cancelled)));
        assert_eq!(store.load(addr).unwrap(), None);
    }

    #[test]
    fn test_result_discarded_after_teardown() {
        let (_dir, store, dep) = setup();
        let addr = BlockAddress::new(3, 0, 0, 0);
        let mut task = Box::new(SaveBlockTask::voxels(addr, 16, shared(7), dep.clone()));

        task.run();
        dep.invalidate();

        let outputs = collect(task);
        assert!(outputs.is_empty());
        // The write itself still happened
        assert!(store.load(addr).unwrap().is_some());
    }

    #[test]
    fn test_last_committed_save_wins() {
        let (_dir, store, dep) = setup();
        let addr = BlockAddress::new(8, 8, 8, 0);
        let mut first = SaveBlockTask::voxels(addr, 16, shared(1), dep.clone());
        let mut second = SaveBlockTask::voxels(addr, 16, shared(2), dep);

        second.run();
        first.run();
        store.flush().unwrap();

        assert_eq!(store.load(addr).unwrap(), Some(shared(1).read().clone()));
    }

    /// Forwards to a persistent store, recording the order saves reach it
    struct OrderedStore {
        inner: PersistentBlockStore,
        order: parking_lot::Mutex<Vec<u64>>,
    }

    impl BlockStore for OrderedStore {
        fn load(&self, address: BlockAddress) -> crate::core::types::Result<Option<VoxelBlockPayload>> {
            self.inner.load(address)
        }

        fn save(&self, address: BlockAddress, payload: VoxelBlockPayload) -> crate::core::types::Result<()> {
            let mut order = self.order.lock();
            if let Some(ChannelData::Uniform(fill)) = payload.channel(0).map(|c| &c.data) {
                order.push(*fill);
            }
            self.inner.save(address, payload)
        }

        fn flush(&self) -> crate::core::types::Result<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn test_concurrent_saves_last_put_persists() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(OrderedStore {
            inner: PersistentBlockStore::open(&StoreConfig::new(dir.path().join("volume.sqlite"))).unwrap(),
            order: parking_lot::Mutex::new(Vec::new()),
        });
        let dep = StreamingDependency::new(store.clone());
        let addr = BlockAddress::new(2, -1, 0, 0);

        let mut tasks: Vec<_> = (0..16)
            .map(|fill| SaveBlockTask::voxels(addr, 16, shared(fill), dep.clone()))
            .collect();
        tasks.par_iter_mut().for_each(|task| task.run());
        assert!(tasks.iter().all(|task| task.has_run()));

        store.flush().unwrap();
        let last = *store.order.lock().last().unwrap();
        assert_eq!(store.order.lock().len(), 16);
        assert_eq!(store.load(addr).unwrap(), Some(shared(last).read().clone()));

        let reopened = PersistentBlockStore::open(&StoreConfig::new(dir.path().join("volume.sqlite"))).unwrap();
        assert_eq!(reopened.load(addr).unwrap(), Some(shared(last).read().clone()));
    }

    #[test]
    fn test_live_counter_tracks_tasks() {
        let (_dir, _store, dep) = setup();
        let task = SaveBlockTask::instances(BlockAddress::new(0, 0, 0, 0), 16, None, dep);
        assert!(SaveBlockTask::debug_running_count() >= 1);
        drop(task);
    }
}
