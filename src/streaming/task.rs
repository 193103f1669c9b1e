//! Contract for asynchronous block tasks
//!
//! A task goes through two phases. `run` executes on a worker thread and does
//! the store I/O. `apply_result` executes later on the thread that owns the
//! volume, checks that the volume still exists and hands the outcome to the
//! caller's callback. The scheduler that moves tasks between threads lives
//! outside this crate.

use crate::core::error::Error;
use crate::storage::{BlockAddress, InstanceBlockPayload, VoxelBlockPayload};
use crate::streaming::dependency::StreamingDependency;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What happened to a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputKind {
    Loaded,
    Saved,
    /// The task never ran
    Dropped,
}

/// Data carried back by a task
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockData {
    /// `None` after a load means the block was not found
    pub voxels: Option<VoxelBlockPayload>,
    pub instances: Option<InstanceBlockPayload>,
}

/// Outcome delivered to the volume's callback
#[derive(Debug)]
pub struct BlockDataOutput {
    pub address: BlockAddress,
    pub block_size: u32,
    pub kind: OutputKind,
    pub data: BlockData,
    /// Store failure, or `Cancelled` for a dropped task
    pub error: Option<Error>,
}

impl BlockDataOutput {
    pub fn lod(&self) -> u8 {
        self.address.lod
    }

    pub fn is_dropped(&self) -> bool {
        self.kind == OutputKind::Dropped
    }
}

/// A one-shot unit of block work
pub trait StreamingTask: Send {
    /// Do the store work; called at most once, off the owning thread
    fn run(&mut self);

    /// Scheduling hint, higher runs first; never affects correctness
    fn priority(&self) -> i32 {
        0
    }

    fn is_cancelled(&self) -> bool;

    /// Deliver the outcome on the owning thread
    ///
    /// Nothing is delivered if the volume was torn down meanwhile.
    fn apply_result(self: Box<Self>, callback: &mut dyn FnMut(BlockDataOutput));
}

/// Shared flag letting the caller cancel a task that has not started yet
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Hand `output` to `callback` unless the volume is gone
pub(crate) fn deliver(
    dependency: &StreamingDependency,
    output: BlockDataOutput,
    callback: &mut dyn FnMut(BlockDataOutput),
) -> bool {
    if !dependency.is_valid() {
        log::debug!(
            "Block {} result came back after its volume was removed, discarding",
            output.address
        );
        return false;
    }
    callback(output);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let held_by_task = token.clone();
        assert!(!held_by_task.is_cancelled());
        token.cancel();
        assert!(held_by_task.is_cancelled());
    }

    #[test]
    fn test_output_lod() {
        let output = BlockDataOutput {
            address: BlockAddress::new(0, 0, 0, 3),
            block_size: 16,
            kind: OutputKind::Dropped,
            data: BlockData::default(),
            error: None,
        };
        assert_eq!(output.lod(), 3);
        assert!(output.is_dropped());
    }
}
