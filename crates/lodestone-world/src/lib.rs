//! Lodestone World -- block, entity and inventory state for the simulation host.
//!
//! This crate is the *world-state collaborator* of the tracking engine. It
//! defines what a world change looks like ([`Mutation`](mutation::Mutation))
//! and the [`WorldState`](world::WorldState) contract the engine uses to read
//! pre-states and apply accepted mutations, plus [`VoxelWorld`](world::VoxelWorld),
//! a sparse in-memory implementation.
//!
//! # Quick Start
//!
//! ```
//! use lodestone_world::prelude::*;
//!
//! let mut world = VoxelWorld::new(WorldConfig::default());
//! let pos = BlockPos::new(0, 64, 0);
//!
//! world.apply(&Mutation::set_block(pos, BlockState::STONE)).unwrap();
//! assert_eq!(world.block(pos), BlockState::STONE);
//! ```

#![deny(unsafe_code)]

pub mod block;
pub mod entity;
pub mod item;
pub mod mutation;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced when applying a mutation to the world.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorldError {
    /// A block write fell outside the buildable height range.
    #[error("block {pos} is outside the world height range {min_y}..={max_y}")]
    OutOfBounds {
        pos: block::BlockPos,
        min_y: i32,
        max_y: i32,
    },

    /// The mutation targets an entity that no longer exists.
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// The post-state payload does not decode for this mutation kind.
    #[error("malformed post-state for '{kind}': {details}")]
    MalformedState { kind: String, details: String },

    /// This world does not know how to apply the kind/target combination.
    #[error("mutation kind '{kind}' is not supported on {target}")]
    UnsupportedMutation { kind: String, target: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::block::{BlockPos, BlockState, ChunkPos};
    pub use crate::entity::EntityId;
    pub use crate::item::ItemStack;
    pub use crate::mutation::{EntitySpec, Mutation, MutationKind, MutationTarget};
    pub use crate::world::{EntityRecord, VoxelWorld, WorldConfig, WorldState};
    pub use crate::WorldError;
}
