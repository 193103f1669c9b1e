//! Block store interface
//!
//! Any backend that can persist voxel blocks implements [`BlockStore`].
//! Optional capabilities are advertised through query methods; callers check
//! them before using the matching operation, which otherwise fails with
//! [`Error::Unsupported`].

use crate::core::error::Error;
use crate::core::types::Result;
use crate::storage::address::BlockAddress;
use crate::storage::payload::{InstanceBlockPayload, VoxelBlockPayload, ALL_CHANNELS_MASK};

/// Persisted description of a volume's layout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreMeta {
    pub version: u32,
    /// Block edge length as a power of two
    pub block_size_po2: u8,
    pub lod_count: u8,
    /// Bit mask of voxel channels the volume uses
    pub channel_mask: u8,
}

impl Default for StoreMeta {
    fn default() -> Self {
        Self {
            version: 1,
            block_size_po2: 4,
            lod_count: 1,
            channel_mask: ALL_CHANNELS_MASK,
        }
    }
}

impl StoreMeta {
    pub fn block_size(&self) -> u32 {
        1 << self.block_size_po2
    }
}

/// A voxel block save request
#[derive(Clone, Debug)]
pub struct VoxelSave {
    pub address: BlockAddress,
    pub payload: VoxelBlockPayload,
}

/// An instance block save request
///
/// `payload: None` reverts the block to "not authored".
#[derive(Clone, Debug)]
pub struct InstanceSave {
    pub address: BlockAddress,
    pub payload: Option<InstanceBlockPayload>,
}

/// Everything persisted for one address, as returned by a full dump
#[derive(Clone, Debug, PartialEq)]
pub struct StoredBlock {
    pub address: BlockAddress,
    pub voxels: Option<VoxelBlockPayload>,
    pub instances: Option<InstanceBlockPayload>,
}

/// Storage backend for voxel and instance blocks
///
/// All methods may be called concurrently from several threads.
pub trait BlockStore: Send + Sync {
    /// Load one voxel block, `None` when nothing is stored there
    fn load(&self, address: BlockAddress) -> Result<Option<VoxelBlockPayload>>;

    /// Save one voxel block; the last save for an address wins
    fn save(&self, address: BlockAddress, payload: VoxelBlockPayload) -> Result<()>;

    /// Load several blocks
    ///
    /// # Arguments
    /// * `addresses` - Blocks to load
    ///
    /// # Returns
    /// One entry per address, in the same order, `None` where nothing is stored
    fn load_batch(&self, addresses: &[BlockAddress]) -> Result<Vec<Option<VoxelBlockPayload>>> {
        addresses.iter().map(|&address| self.load(address)).collect()
    }

    fn save_batch(&self, saves: Vec<VoxelSave>) -> Result<()> {
        for save in saves {
            self.save(save.address, save.payload)?;
        }
        Ok(())
    }

    fn supports_instances(&self) -> bool {
        false
    }

    /// Load instance placements, `None` when the block defers to generation
    fn load_instances(&self, _address: BlockAddress) -> Result<Option<InstanceBlockPayload>> {
        Err(Error::Unsupported("instance blocks"))
    }

    fn save_instances(
        &self,
        _address: BlockAddress,
        _payload: Option<InstanceBlockPayload>,
    ) -> Result<()> {
        Err(Error::Unsupported("instance blocks"))
    }

    fn save_instances_batch(&self, saves: Vec<InstanceSave>) -> Result<()> {
        for save in saves {
            self.save_instances(save.address, save.payload)?;
        }
        Ok(())
    }

    fn supports_full_dump(&self) -> bool {
        false
    }

    /// Dump every persisted block
    fn load_all(&self) -> Result<Vec<StoredBlock>> {
        Err(Error::Unsupported("full dump"))
    }

    /// Mask of voxel channels this store persists
    fn used_channels_mask(&self) -> u8 {
        ALL_CHANNELS_MASK
    }

    /// Force deferred writes to durable storage
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
