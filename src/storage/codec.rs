//! Block blob encoding
//!
//! Every blob starts with a fixed header:
//!
//! ```text
//! [version: u8][flags: u8][length: u32 LE][body: length bytes]
//! ```
//!
//! The body is an rkyv archive of the payload, LZ4-compressed (size
//! prepended) when the `FLAG_LZ4` bit is set. The header carries everything
//! the decoder needs, so blobs written with either compression setting can be
//! read back by any codec.

use crate::core::error::Error;
use crate::core::types::{Result, UVec3};
use crate::storage::payload::{
    ChannelData, InstanceBlockPayload, VoxelBlockPayload, VoxelChannel, MAX_CHANNELS,
};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// Current blob format version
pub const FORMAT_VERSION: u8 = 1;

/// Size of the blob header in bytes
pub const HEADER_SIZE: usize = 6;

/// Body is LZ4-compressed with its decompressed size prepended
pub const FLAG_LZ4: u8 = 1 << 0;

/// Upper bound on a decompressed body, guards against corrupt size prefixes
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Compression applied to blob bodies when encoding
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, SerdeSerialize, SerdeDeserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lz4,
}

/// Parsed blob header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobHeader {
    pub version: u8,
    pub flags: u8,
    pub length: u32,
}

impl BlobHeader {
    /// Parse and validate the header of `data`
    ///
    /// Checks the version tag and that exactly `length` body bytes follow.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = data
            .get(..HEADER_SIZE)
            .ok_or_else(|| Error::corrupt(format!("blob too short for header: {} bytes", data.len())))?;

        let version = header[0];
        let flags = header[1];
        let length = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);

        if version != FORMAT_VERSION {
            return Err(Error::corrupt(format!("unknown format version {}", version)));
        }
        if flags & !FLAG_LZ4 != 0 {
            return Err(Error::corrupt(format!("unknown flags {:#04x}", flags)));
        }
        let body_len = data.len() - HEADER_SIZE;
        if body_len != length as usize {
            return Err(Error::corrupt(format!(
                "length mismatch: header says {}, found {}",
                length, body_len
            )));
        }

        Ok(Self { version, flags, length })
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_LZ4 != 0
    }
}

/// Archived form of a voxel block
#[derive(Archive, Deserialize, Serialize)]
struct VoxelBlockData {
    size: [u32; 3],
    channels: Vec<VoxelChannel>,
}

/// Stateless encoder/decoder for block blobs
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockCodec {
    compression: Compression,
}

impl BlockCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Encode a voxel block into a blob
    pub fn encode_voxels(&self, payload: &VoxelBlockPayload) -> Result<Vec<u8>> {
        let data = VoxelBlockData {
            size: payload.size.to_array(),
            channels: payload.channels().to_vec(),
        };
        let body = rkyv::to_bytes::<rkyv::rancor::Error>(&data)
            .map_err(|e| Error::corrupt(format!("voxel serialization failed: {}", e)))?;
        Ok(self.wrap(&body))
    }

    /// Decode a voxel block blob
    ///
    /// # Arguments
    /// * `data` - Complete blob, header included
    ///
    /// # Returns
    /// The payload, or `CorruptPayload` if the header, body or channel
    /// layout fails validation
    pub fn decode_voxels(data: &[u8]) -> Result<VoxelBlockPayload> {
        let body = unwrap_body(data)?;
        let decoded = rkyv::from_bytes::<VoxelBlockData, rkyv::rancor::Error>(&body)
            .map_err(|e| Error::corrupt(format!("voxel body invalid: {}", e)))?;

        let size = UVec3::from_array(decoded.size);
        validate_channels(size, &decoded.channels)?;
        Ok(VoxelBlockPayload::from_parts(size, decoded.channels))
    }

    /// Encode an instance block into a blob
    pub fn encode_instances(&self, payload: &InstanceBlockPayload) -> Result<Vec<u8>> {
        let body = rkyv::to_bytes::<rkyv::rancor::Error>(payload)
            .map_err(|e| Error::corrupt(format!("instance serialization failed: {}", e)))?;
        Ok(self.wrap(&body))
    }

    /// Decode an instance block blob
    pub fn decode_instances(data: &[u8]) -> Result<InstanceBlockPayload> {
        let body = unwrap_body(data)?;
        rkyv::from_bytes::<InstanceBlockPayload, rkyv::rancor::Error>(&body)
            .map_err(|e| Error::corrupt(format!("instance body invalid: {}", e)))
    }

    /// Prefix a serialized body with the header, compressing it if configured
    fn wrap(&self, body: &[u8]) -> Vec<u8> {
        let (flags, body) = match self.compression {
            Compression::None => (0, body.to_vec()),
            Compression::Lz4 => (FLAG_LZ4, lz4_flex::compress_prepend_size(body)),
        };

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.push(FORMAT_VERSION);
        out.push(flags);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}

/// Validate the header and return the (decompressed) body, aligned for rkyv
fn unwrap_body(data: &[u8]) -> Result<AlignedVec> {
    let header = BlobHeader::parse(data)?;
    let body = &data[HEADER_SIZE..];

    let mut aligned: AlignedVec = AlignedVec::new();
    if header.is_compressed() {
        let prefix = body
            .get(..4)
            .ok_or_else(|| Error::corrupt("compressed body missing size prefix"))?;
        let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if declared > MAX_BODY_SIZE {
            return Err(Error::corrupt(format!("decompressed size {} exceeds limit", declared)));
        }
        let decompressed = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| Error::corrupt(format!("LZ4 decompression failed: {}", e)))?;
        aligned.extend_from_slice(&decompressed);
    } else {
        aligned.extend_from_slice(body);
    }
    Ok(aligned)
}

fn validate_channels(size: UVec3, channels: &[VoxelChannel]) -> Result<()> {
    let voxel_count = (size.x as usize)
        .checked_mul(size.y as usize)
        .and_then(|n| n.checked_mul(size.z as usize))
        .ok_or_else(|| Error::corrupt("block size overflows"))?;

    let mut previous: Option<u8> = None;
    for channel in channels {
        if channel.index as usize >= MAX_CHANNELS {
            return Err(Error::corrupt(format!("channel index {} out of range", channel.index)));
        }
        if previous.is_some_and(|p| p >= channel.index) {
            return Err(Error::corrupt("channels not in ascending order"));
        }
        previous = Some(channel.index);

        if let ChannelData::Dense(bytes) = &channel.data {
            let expected = voxel_count
                .checked_mul(channel.depth.bytes())
                .ok_or_else(|| Error::corrupt("channel size overflows"))?;
            if bytes.len() != expected {
                return Err(Error::corrupt(format!(
                    "channel {} has {} bytes, expected {}",
                    channel.index,
                    bytes.len(),
                    expected
                )));
            }
        }
    }
    Ok(())
}
