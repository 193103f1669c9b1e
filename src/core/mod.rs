//! Core types shared by the storage and streaming layers

pub mod types;
pub mod error;
pub mod logging;

pub use types::*;
pub use error::Error;
