//! Block addressing: grid coordinate plus level of detail

use crate::core::types::{I64Vec3, IVec3};
use std::cmp::Ordering;

/// Address of a block within a volume
///
/// Coordinates are expressed in blocks at the given LOD, so the same
/// coordinate at two LODs names two different regions of space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockAddress {
    pub coord: IVec3,
    pub lod: u8,
}

impl BlockAddress {
    /// Create a new block address
    pub fn new(x: i32, y: i32, z: i32, lod: u8) -> Self {
        Self {
            coord: IVec3::new(x, y, z),
            lod,
        }
    }

    /// Create from an existing coordinate
    pub fn from_coord(coord: IVec3, lod: u8) -> Self {
        Self { coord, lod }
    }

    /// Position of the block's minimum corner in LOD0 voxels
    ///
    /// # Arguments
    /// * `block_size` - Block edge length in voxels at this LOD
    ///
    /// # Returns
    /// The corner position, or `None` when it does not fit in 64 bits
    pub fn origin_in_voxels(&self, block_size: u32) -> Option<I64Vec3> {
        let scale = 2i64
            .checked_pow(self.lod as u32)?
            .checked_mul(block_size as i64)?;
        let c = self.coord.as_i64vec3();
        Some(I64Vec3::new(
            c.x.checked_mul(scale)?,
            c.y.checked_mul(scale)?,
            c.z.checked_mul(scale)?,
        ))
    }
}

impl Ord for BlockAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lod
            .cmp(&other.lod)
            .then(self.coord.x.cmp(&other.coord.x))
            .then(self.coord.y.cmp(&other.coord.y))
            .then(self.coord.z.cmp(&other.coord.z))
    }
}

impl PartialOrd for BlockAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for BlockAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {}) lod {}", self.coord.x, self.coord.y, self.coord.z, self.lod)
    }
}
