//! Asynchronous block streaming on top of a [`BlockStore`](crate::storage::BlockStore)
//!
//! Tasks are created by a [`VolumeStreaming`], run by an external scheduler
//! on worker threads, and applied back on the volume's owning thread.

pub mod dependency;
pub mod task;
pub mod save_task;
pub mod load_task;
pub mod volume;

pub use dependency::StreamingDependency;
pub use task::{BlockData, BlockDataOutput, CancelToken, OutputKind, StreamingTask};
pub use save_task::{SaveBlockTask, SharedVoxels};
pub use load_task::LoadBlockTask;
pub use volume::VolumeStreaming;
