//! Core type aliases and re-exports

pub use glam::{I64Vec3, IVec3, UVec3};

/// Standard Result type for the block store
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;
