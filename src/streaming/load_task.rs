//! Task loading one block from the store

use crate::core::error::Error;
use crate::storage::BlockAddress;
use crate::streaming::dependency::StreamingDependency;
use crate::streaming::task::{deliver, BlockData, BlockDataOutput, CancelToken, OutputKind, StreamingTask};
use std::sync::Arc;

/// Loads a block's voxels, and optionally its instances
pub struct LoadBlockTask {
    address: BlockAddress,
    block_size: u32,
    request_instances: bool,
    priority: i32,
    dependency: Arc<StreamingDependency>,
    cancel: CancelToken,
    data: BlockData,
    error: Option<Error>,
    ran: bool,
}

impl LoadBlockTask {
    pub fn new(address: BlockAddress, block_size: u32, dependency: Arc<StreamingDependency>) -> Self {
        Self {
            address,
            block_size,
            request_instances: false,
            priority: 0,
            dependency,
            cancel: CancelToken::new(),
            data: BlockData::default(),
            error: None,
            ran: false,
        }
    }

    /// Also load instance placements if the store supports them
    pub fn with_instances(mut self, request_instances: bool) -> Self {
        self.request_instances = request_instances;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn address(&self) -> BlockAddress {
        self.address
    }

    pub fn has_run(&self) -> bool {
        self.ran
    }
}

impl StreamingTask for LoadBlockTask {
    fn run(&mut self) {
        if self.cancel.is_cancelled() || self.ran {
            return;
        }
        let store = self.dependency.store();

        match store.load(self.address) {
            Ok(voxels) => {
                log::trace!(
                    "Loaded block {} at voxel {} ({})",
                    self.address,
                    match self.address.origin_in_voxels(self.block_size) {
                        Some(origin) => origin.to_string(),
                        None => "out of range".to_string(),
                    },
                    if voxels.is_some() { "found" } else { "not found" }
                );
                self.data.voxels = voxels;
            }
            Err(e) => {
                log::error!("Failed to load block {}: {}", self.address, e);
                self.error = Some(e);
            }
        }

        if self.request_instances && self.error.is_none() && store.supports_instances() {
            match store.load_instances(self.address) {
                Ok(instances) => self.data.instances = instances,
                Err(e) => {
                    log::error!("Failed to load instances of block {}: {}", self.address, e);
                    self.error = Some(e);
                }
            }
        }

        self.ran = true;
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn apply_result(self: Box<Self>, callback: &mut dyn FnMut(BlockDataOutput)) {
        let task = *self;
        let (kind, error) = if task.ran {
            (OutputKind::Loaded, task.error)
        } else {
            (OutputKind::Dropped, Some(Error::Cancelled))
        };
        let output = BlockDataOutput {
            address: task.address,
            block_size: task.block_size,
            kind,
            data: task.data,
            error,
        };
        deliver(&task.dependency, output, callback);
    }
}
