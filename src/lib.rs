//! Rktri block store - persistent storage for chunked voxel volumes

pub mod core;
pub mod storage;
pub mod streaming;
