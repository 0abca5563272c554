//! Block coordinates and block states.
//!
//! A [`BlockPos`] addresses one cell of the voxel lattice. A [`BlockState`] is
//! the numeric id of whatever occupies that cell; the world stores only
//! non-air cells, so any position that was never written reads as
//! [`BlockState::AIR`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::item::ItemStack;

// ---------------------------------------------------------------------------
// BlockPos
// ---------------------------------------------------------------------------

/// Absolute block coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    /// Construct a position from its three coordinates.
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// The position shifted by the given deltas.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if a coordinate leaves the `i32` range. Use
    /// [`checked_offset`](Self::checked_offset) for untrusted coordinates.
    pub const fn offset(self, dx: i32, dy: i32, dz: i32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.z + dz)
    }

    /// The position shifted by the given deltas, or `None` if any coordinate
    /// would leave the `i32` range.
    pub const fn checked_offset(self, dx: i32, dy: i32, dz: i32) -> Option<Self> {
        match (
            self.x.checked_add(dx),
            self.y.checked_add(dy),
            self.z.checked_add(dz),
        ) {
            (Some(x), Some(y), Some(z)) => Some(Self::new(x, y, z)),
            _ => None,
        }
    }

    /// The block directly above.
    pub const fn up(self) -> Self {
        self.offset(0, 1, 0)
    }

    /// The block directly below.
    pub const fn down(self) -> Self {
        self.offset(0, -1, 0)
    }

    /// The six face-adjacent neighbours, in a fixed order
    /// (down, up, north, south, west, east).
    pub fn neighbors(self) -> [BlockPos; 6] {
        [
            self.down(),
            self.up(),
            self.offset(0, 0, -1),
            self.offset(0, 0, 1),
            self.offset(-1, 0, 0),
            self.offset(1, 0, 0),
        ]
    }

    /// The chunk column containing this position.
    pub fn chunk(self) -> ChunkPos {
        ChunkPos {
            x: self.x.div_euclid(ChunkPos::SIZE),
            z: self.z.div_euclid(ChunkPos::SIZE),
        }
    }

    /// Squared euclidean distance to `other`.
    pub fn distance_squared(self, other: BlockPos) -> i64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dy = i64::from(self.y) - i64::from(other.y);
        let dz = i64::from(self.z) - i64::from(other.z);
        dx * dx + dy * dy + dz * dz
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// ---------------------------------------------------------------------------
// ChunkPos
// ---------------------------------------------------------------------------

/// A 16x16 column of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    /// Width of a chunk column along x and z.
    pub const SIZE: i32 = 16;
}

// ---------------------------------------------------------------------------
// BlockState
// ---------------------------------------------------------------------------

/// Numeric block id.
///
/// Serialized as a bare integer so that mutation payloads stay compact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockState(pub u16);

impl BlockState {
    pub const AIR: BlockState = BlockState(0);
    pub const STONE: BlockState = BlockState(1);
    pub const GRASS: BlockState = BlockState(2);
    pub const DIRT: BlockState = BlockState(3);
    pub const SAND: BlockState = BlockState(12);
    pub const GRAVEL: BlockState = BlockState(13);
    pub const TNT: BlockState = BlockState(46);
    pub const TORCH: BlockState = BlockState(50);
    pub const BEDROCK: BlockState = BlockState(7);

    /// Whether this is the empty block.
    pub fn is_air(self) -> bool {
        self == Self::AIR
    }

    /// Whether this block falls when unsupported.
    pub fn has_gravity(self) -> bool {
        matches!(self, Self::SAND | Self::GRAVEL)
    }

    /// Whether players can break this block at all.
    pub fn is_breakable(self) -> bool {
        self != Self::BEDROCK && !self.is_air()
    }

    /// Registry name, or `"unknown"` for ids outside the built-in set.
    pub fn name(self) -> &'static str {
        match self {
            Self::AIR => "air",
            Self::STONE => "stone",
            Self::GRASS => "grass",
            Self::DIRT => "dirt",
            Self::SAND => "sand",
            Self::GRAVEL => "gravel",
            Self::TNT => "tnt",
            Self::TORCH => "torch",
            Self::BEDROCK => "bedrock",
            _ => "unknown",
        }
    }

    /// Inverse of [`name`](Self::name) for the built-in set.
    pub fn from_name(name: &str) -> Option<BlockState> {
        [
            Self::AIR,
            Self::STONE,
            Self::GRASS,
            Self::DIRT,
            Self::SAND,
            Self::GRAVEL,
            Self::TNT,
            Self::TORCH,
            Self::BEDROCK,
        ]
        .into_iter()
        .find(|b| b.name() == name)
    }

    /// The item dropped when this block is broken.
    ///
    /// Stone drops cobblestone and grass drops dirt; air and bedrock drop
    /// nothing.
    pub fn drop_item(self) -> Option<ItemStack> {
        let item = match self {
            Self::AIR | Self::BEDROCK => return None,
            Self::STONE => "cobblestone",
            Self::GRASS => "dirt",
            other => other.name(),
        };
        Some(ItemStack::new(item, 1))
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name(), self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
