//! Block payloads: voxel channel data and instance placements
//!
//! Both payload kinds are opaque to the store. They only need to survive
//! an encode/decode round trip through [`BlockCodec`](super::codec::BlockCodec).

use crate::core::types::UVec3;
use rkyv::{Archive, Deserialize, Serialize};

/// Number of channels a voxel block can carry
pub const MAX_CHANNELS: usize = 8;

/// Mask with every channel bit set
pub const ALL_CHANNELS_MASK: u8 = 0xff;

/// Bit depth of a voxel channel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Archive, Deserialize, Serialize)]
pub enum ChannelDepth {
    Bits8,
    Bits16,
    Bits32,
    Bits64,
}

impl ChannelDepth {
    /// Size of one voxel value in bytes
    pub fn bytes(self) -> usize {
        match self {
            ChannelDepth::Bits8 => 1,
            ChannelDepth::Bits16 => 2,
            ChannelDepth::Bits32 => 4,
            ChannelDepth::Bits64 => 8,
        }
    }
}

/// Storage of one channel's values
#[derive(Clone, Debug, PartialEq, Eq, Archive, Deserialize, Serialize)]
pub enum ChannelData {
    /// Every voxel holds the same value
    Uniform(u64),
    /// One value per voxel, ZXY order, little-endian
    Dense(Vec<u8>),
}

/// A single present channel of a voxel block
#[derive(Clone, Debug, PartialEq, Eq, Archive, Deserialize, Serialize)]
pub struct VoxelChannel {
    /// Channel slot, `0..MAX_CHANNELS`
    pub index: u8,
    pub depth: ChannelDepth,
    pub data: ChannelData,
}

impl VoxelChannel {
    pub fn uniform(index: u8, depth: ChannelDepth, value: u64) -> Self {
        Self { index, depth, data: ChannelData::Uniform(value) }
    }

    pub fn dense(index: u8, depth: ChannelDepth, bytes: Vec<u8>) -> Self {
        Self { index, depth, data: ChannelData::Dense(bytes) }
    }
}

/// Voxel grid data for one block
///
/// Only channels that are present are stored. Channels are kept sorted by
/// index so two payloads with the same content compare equal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoxelBlockPayload {
    /// Block dimensions in voxels
    pub size: UVec3,
    channels: Vec<VoxelChannel>,
}

impl VoxelBlockPayload {
    /// Create a payload with no channels
    pub fn new(size: UVec3) -> Self {
        Self { size, channels: Vec::new() }
    }

    /// Create a cubic payload with no channels
    pub fn cube(block_size: u32) -> Self {
        Self::new(UVec3::splat(block_size))
    }

    /// Builder-style variant of [`set_channel`](Self::set_channel)
    pub fn with_channel(mut self, channel: VoxelChannel) -> Self {
        self.set_channel(channel);
        self
    }

    /// Insert or replace a channel
    pub fn set_channel(&mut self, channel: VoxelChannel) {
        debug_assert!((channel.index as usize) < MAX_CHANNELS);
        match self.channels.binary_search_by_key(&channel.index, |c| c.index) {
            Ok(i) => self.channels[i] = channel,
            Err(i) => self.channels.insert(i, channel),
        }
    }

    /// Remove a channel, returning it if it was present
    pub fn remove_channel(&mut self, index: u8) -> Option<VoxelChannel> {
        let i = self.channels.binary_search_by_key(&index, |c| c.index).ok()?;
        Some(self.channels.remove(i))
    }

    pub fn channel(&self, index: u8) -> Option<&VoxelChannel> {
        self.channels
            .binary_search_by_key(&index, |c| c.index)
            .ok()
            .map(|i| &self.channels[i])
    }

    pub fn channels(&self) -> &[VoxelChannel] {
        &self.channels
    }

    /// Bit mask of present channels
    pub fn channel_mask(&self) -> u8 {
        self.channels.iter().fold(0u8, |mask, c| mask | (1 << c.index))
    }

    /// Number of voxels in the block
    pub fn voxel_count(&self) -> usize {
        self.size.x as usize * self.size.y as usize * self.size.z as usize
    }

    /// Rebuild from decoded parts, channels already validated and sorted
    pub(crate) fn from_parts(size: UVec3, channels: Vec<VoxelChannel>) -> Self {
        Self { size, channels }
    }
}

/// Placement of one object instance, relative to the block origin
#[derive(Clone, Copy, Debug, PartialEq, Archive, Deserialize, Serialize)]
pub struct InstanceTransform {
    pub position: [f32; 3],
    /// Rotation quaternion (x, y, z, w)
    pub rotation: [f32; 4],
    pub scale: f32,
}

impl InstanceTransform {
    pub fn at(position: [f32; 3]) -> Self {
        Self { position, rotation: [0.0, 0.0, 0.0, 1.0], scale: 1.0 }
    }
}

/// All instances of one layer (one kind of object) within a block
#[derive(Clone, Debug, PartialEq, Archive, Deserialize, Serialize)]
pub struct InstanceLayer {
    pub id: u16,
    pub scale_min: f32,
    pub scale_max: f32,
    pub instances: Vec<InstanceTransform>,
}

/// Instance placements for one block
///
/// Stores wrap this in an `Option`: `None` defers to procedural generation,
/// while an empty `layers` list means everything was explicitly removed.
#[derive(Clone, Debug, Default, PartialEq, Archive, Deserialize, Serialize)]
pub struct InstanceBlockPayload {
    pub layers: Vec<InstanceLayer>,
}

impl InstanceBlockPayload {
    /// Payload for a block whose instances were all removed
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.instances.is_empty())
    }

    pub fn instance_count(&self) -> usize {
        self.layers.iter().map(|l| l.instances.len()).sum()
    }
}
