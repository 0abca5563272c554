//! The live world: the state that committed mutations are applied to.
//!
//! [`WorldState`] is the contract the tracking engine relies on: it can *read*
//! the current state of a [`MutationTarget`] (to capture pre-states) and
//! *apply* a [`Mutation`] once it has been accepted. [`VoxelWorld`] is the
//! in-memory implementation used by the tick host and the tests.
//!
//! Direct setters on [`VoxelWorld`] (`set_block`, `spawn`) bypass tracking and
//! exist for initial setup and tests only. During simulation every change
//! flows through the tracking engine.

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use crate::block::{BlockPos, BlockState};
use crate::entity::{EntityAllocator, EntityId};
use crate::item::ItemStack;
use crate::mutation::{EntitySpec, Mutation, MutationKind, MutationTarget};
use crate::WorldError;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Static world parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Lowest buildable y (inclusive).
    pub min_y: i32,
    /// Highest buildable y (inclusive).
    pub max_y: i32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            min_y: 0,
            max_y: 255,
        }
    }
}

// ---------------------------------------------------------------------------
// WorldState
// ---------------------------------------------------------------------------

/// The world-state collaborator of the tracking engine.
///
/// `apply` is only ever called for accepted mutations, in commit order. An
/// `Err` from `apply` means the world could not honour a mutation that
/// observers were already told about; the engine treats it as fatal.
pub trait WorldState: Send {
    /// Current state of `target`, or `None` when the target does not exist
    /// (e.g. a despawned entity).
    fn read(&self, target: &MutationTarget) -> Option<serde_json::Value>;

    /// Apply an accepted mutation.
    fn apply(&mut self, mutation: &Mutation) -> Result<(), WorldError>;

    /// Block at `pos`; unset cells are air.
    fn block(&self, pos: BlockPos) -> BlockState;

    /// Whether `pos` lies inside the buildable volume.
    fn in_bounds(&self, pos: BlockPos) -> bool;

    /// Content digest of the whole world, for determinism checks.
    fn state_hash(&self) -> String;

    /// Concrete-type access for hosts that know which world they built.
    fn as_any(&self) -> &dyn Any;
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// A live entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub entity_type: String,
    pub position: BlockPos,
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// VoxelWorld
// ---------------------------------------------------------------------------

/// Sparse in-memory voxel world with entities and inventories.
///
/// Only non-air blocks are stored. All maps are ordered so that iteration and
/// the state hash are deterministic.
#[derive(Debug, Clone, Default)]
pub struct VoxelWorld {
    config: WorldConfig,
    blocks: BTreeMap<BlockPos, BlockState>,
    entities: BTreeMap<EntityId, EntityRecord>,
    allocator: EntityAllocator,
    slots: BTreeMap<(EntityId, u16), ItemStack>,
    custom: BTreeMap<String, serde_json::Value>,
}

impl VoxelWorld {
    pub fn new(config: WorldConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    // -- setup (untracked) --------------------------------------------------

    /// Write a block directly. Setup and tests only.
    pub fn set_block(&mut self, pos: BlockPos, state: BlockState) {
        if state.is_air() {
            self.blocks.remove(&pos);
        } else {
            self.blocks.insert(pos, state);
        }
    }

    /// Fill the inclusive box between `from` and `to`. Setup and tests only.
    pub fn fill(&mut self, from: BlockPos, to: BlockPos, state: BlockState) {
        for x in from.x.min(to.x)..=from.x.max(to.x) {
            for y in from.y.min(to.y)..=from.y.max(to.y) {
                for z in from.z.min(to.z)..=from.z.max(to.z) {
                    self.set_block(BlockPos::new(x, y, z), state);
                }
            }
        }
    }

    /// Spawn an entity directly. Setup and tests only.
    pub fn spawn(&mut self, entity_type: &str, position: BlockPos, data: serde_json::Value) -> EntityId {
        let id = self.allocator.allocate();
        self.entities.insert(
            id,
            EntityRecord {
                id,
                entity_type: entity_type.to_owned(),
                position,
                data,
            },
        );
        id
    }

    // -- queries ------------------------------------------------------------

    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    /// Entities standing at `pos`, in id order.
    pub fn entities_at(&self, pos: BlockPos) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values().filter(move |e| e.position == pos)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of non-air blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// All non-air blocks in position order.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockPos, BlockState)> + '_ {
        self.blocks.iter().map(|(pos, state)| (*pos, *state))
    }

    pub fn slot(&self, owner: EntityId, slot: u16) -> Option<&ItemStack> {
        self.slots.get(&(owner, slot))
    }

    /// BLAKE3 hex digest of the full world state.
    ///
    /// Equal worlds hash equal regardless of the order in which they were
    /// built.
    fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.config.min_y.to_le_bytes());
        hasher.update(&self.config.max_y.to_le_bytes());
        for (pos, state) in &self.blocks {
            hasher.update(&pos.x.to_le_bytes());
            hasher.update(&pos.y.to_le_bytes());
            hasher.update(&pos.z.to_le_bytes());
            hasher.update(&state.0.to_le_bytes());
        }
        for (id, record) in &self.entities {
            hasher.update(&id.to_raw().to_le_bytes());
            hasher.update(record.entity_type.as_bytes());
            hasher.update(&record.position.x.to_le_bytes());
            hasher.update(&record.position.y.to_le_bytes());
            hasher.update(&record.position.z.to_le_bytes());
            hasher.update(record.data.to_string().as_bytes());
        }
        for ((owner, slot), stack) in &self.slots {
            hasher.update(&owner.to_raw().to_le_bytes());
            hasher.update(&slot.to_le_bytes());
            hasher.update(stack.item.as_bytes());
            hasher.update(&[stack.count]);
        }
        for (name, value) in &self.custom {
            hasher.update(name.as_bytes());
            hasher.update(value.to_string().as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    // -- apply helpers ------------------------------------------------------

    fn apply_block_set(&mut self, mutation: &Mutation, pos: BlockPos) -> Result<(), WorldError> {
        if !self.in_bounds(pos) {
            return Err(WorldError::OutOfBounds {
                pos,
                min_y: self.config.min_y,
                max_y: self.config.max_y,
            });
        }
        let state = mutation.after_block().ok_or_else(|| malformed(mutation))?;
        self.set_block(pos, state);
        Ok(())
    }

    fn apply_spawn(&mut self, mutation: &Mutation, pos: BlockPos) -> Result<(), WorldError> {
        let spec: EntitySpec = mutation.after_entity().ok_or_else(|| malformed(mutation))?;
        let id = self.spawn(&spec.entity_type, pos, spec.data);
        trace!(entity = %id, kind = %mutation.kind, "entity spawned");
        Ok(())
    }

    fn apply_remove(&mut self, id: EntityId) -> Result<(), WorldError> {
        if !self.allocator.deallocate(id) {
            return Err(WorldError::StaleEntity { entity: id });
        }
        self.entities.remove(&id);
        self.slots.retain(|(owner, _), _| *owner != id);
        Ok(())
    }

    fn apply_move(&mut self, mutation: &Mutation, id: EntityId) -> Result<(), WorldError> {
        let to: BlockPos =
            serde_json::from_value(mutation.after.clone()).map_err(|_| malformed(mutation))?;
        let record = self
            .entities
            .get_mut(&id)
            .ok_or(WorldError::StaleEntity { entity: id })?;
        record.position = to;
        Ok(())
    }

    fn apply_slot(&mut self, mutation: &Mutation, owner: EntityId, slot: u16) -> Result<(), WorldError> {
        if !self.allocator.is_alive(owner) {
            return Err(WorldError::StaleEntity { entity: owner });
        }
        if mutation.after.is_null() {
            self.slots.remove(&(owner, slot));
            return Ok(());
        }
        let stack: ItemStack =
            serde_json::from_value(mutation.after.clone()).map_err(|_| malformed(mutation))?;
        if stack.count > ItemStack::MAX_COUNT {
            return Err(malformed(mutation));
        }
        if stack.is_empty() {
            self.slots.remove(&(owner, slot));
        } else {
            self.slots.insert((owner, slot), stack);
        }
        Ok(())
    }
}

fn malformed(mutation: &Mutation) -> WorldError {
    WorldError::MalformedState {
        kind: mutation.kind.to_string(),
        details: mutation.after.to_string(),
    }
}

impl WorldState for VoxelWorld {
    fn read(&self, target: &MutationTarget) -> Option<serde_json::Value> {
        match target {
            MutationTarget::Block(pos) => Some(json!(self.block(*pos).0)),
            MutationTarget::Entity(id) => self.entities.get(id).map(|e| {
                json!({
                    "entity_type": e.entity_type,
                    "position": { "x": e.position.x, "y": e.position.y, "z": e.position.z },
                    "data": e.data,
                })
            }),
            MutationTarget::Position(pos) => Some(json!(self
                .entities_at(*pos)
                .map(|e| e.id.to_raw())
                .collect::<Vec<_>>())),
            MutationTarget::Slot { owner, slot } => {
                if !self.allocator.is_alive(*owner) {
                    return None;
                }
                Some(match self.slots.get(&(*owner, *slot)) {
                    Some(stack) => json!({ "item": stack.item, "count": stack.count }),
                    None => serde_json::Value::Null,
                })
            }
            MutationTarget::Custom(name) => self.custom.get(name).cloned(),
        }
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<(), WorldError> {
        let kind = &mutation.kind;
        match &mutation.target {
            MutationTarget::Block(pos) if *kind == MutationKind::BLOCK_SET => {
                self.apply_block_set(mutation, *pos)
            }
            MutationTarget::Position(pos)
                if *kind == MutationKind::ENTITY_SPAWN || *kind == MutationKind::ITEM_DROP =>
            {
                self.apply_spawn(mutation, *pos)
            }
            MutationTarget::Entity(id) if *kind == MutationKind::ENTITY_REMOVE => {
                self.apply_remove(*id)
            }
            MutationTarget::Entity(id) if *kind == MutationKind::ENTITY_MOVE => {
                self.apply_move(mutation, *id)
            }
            MutationTarget::Slot { owner, slot } if *kind == MutationKind::INVENTORY_SLOT => {
                self.apply_slot(mutation, *owner, *slot)
            }
            MutationTarget::Custom(name) => {
                self.custom.insert(name.clone(), mutation.after.clone());
                Ok(())
            }
            target => Err(WorldError::UnsupportedMutation {
                kind: kind.to_string(),
                target: target.to_string(),
            }),
        }
    }

    fn block(&self, pos: BlockPos) -> BlockState {
        self.blocks.get(&pos).copied().unwrap_or(BlockState::AIR)
    }

    fn in_bounds(&self, pos: BlockPos) -> bool {
        pos.y >= self.config.min_y && pos.y <= self.config.max_y
    }

    fn state_hash(&self) -> String {
        self.digest()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
