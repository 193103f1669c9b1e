//! Persistent block storage
//!
//! - Address: block coordinate plus LOD
//! - Codec: versioned, optionally LZ4-compressed blobs
//! - Pool: one SQLite connection per active thread
//! - Cache: bounded write-back staging of saves
//! - Store: the `BlockStore` contract and its SQLite implementation

pub mod address;
pub mod payload;
pub mod codec;
pub mod connection;
pub mod pool;
pub mod cache;
pub mod store;
pub mod sqlite;
pub mod config;

pub use address::BlockAddress;
pub use payload::{
    ChannelData, ChannelDepth, InstanceBlockPayload, InstanceLayer, InstanceTransform,
    VoxelBlockPayload, VoxelChannel, ALL_CHANNELS_MASK, MAX_CHANNELS,
};
pub use codec::{BlockCodec, BlobHeader, Compression, FORMAT_VERSION};
pub use connection::{BlockWrite, Connection, InstanceRow};
pub use pool::{ConnectionPool, PooledConnection};
pub use cache::{CacheEntry, CachedPayload, PayloadKind, WriteBack, WriteBackCache, DEFAULT_CACHE_CAPACITY};
pub use store::{BlockStore, InstanceSave, StoreMeta, StoredBlock, VoxelSave};
pub use sqlite::PersistentBlockStore;
pub use config::StoreConfig;
