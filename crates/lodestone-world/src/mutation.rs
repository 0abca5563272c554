//! Mutation descriptors: what a world change *would* do.
//!
//! A [`Mutation`] names a [`MutationKind`], the [`MutationTarget`] it touches,
//! and the target's state before and after the change. States are stored as
//! [`serde_json::Value`] so that the set of mutation kinds stays open: a host
//! can introduce a new kind without touching this crate, as long as its
//! [`WorldState`](crate::world::WorldState) implementation knows how to apply
//! it.
//!
//! # Example
//!
//! ```
//! use lodestone_world::prelude::*;
//!
//! let m = Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::AIR);
//! assert_eq!(m.kind, MutationKind::BLOCK_SET);
//! assert_eq!(m.after_block(), Some(BlockState::AIR));
//! assert!(m.before.is_null());
//! ```

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::block::{BlockPos, BlockState};
use crate::entity::EntityId;
use crate::item::ItemStack;

// ---------------------------------------------------------------------------
// MutationKind
// ---------------------------------------------------------------------------

/// Tag selecting how a mutation is applied and which effect pipeline runs
/// for it.
///
/// Well-known kinds are provided as constants; hosts may create more with
/// [`MutationKind::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationKind(Cow<'static, str>);

impl MutationKind {
    /// Replace the block at a position.
    pub const BLOCK_SET: MutationKind = MutationKind(Cow::Borrowed("block.set"));
    /// Spawn an entity at a position.
    pub const ENTITY_SPAWN: MutationKind = MutationKind(Cow::Borrowed("entity.spawn"));
    /// Remove a live entity.
    pub const ENTITY_REMOVE: MutationKind = MutationKind(Cow::Borrowed("entity.remove"));
    /// Move a live entity to a new position.
    pub const ENTITY_MOVE: MutationKind = MutationKind(Cow::Borrowed("entity.move"));
    /// Spawn an item entity at a position.
    pub const ITEM_DROP: MutationKind = MutationKind(Cow::Borrowed("item.drop"));
    /// Replace the contents of an inventory slot.
    pub const INVENTORY_SLOT: MutationKind = MutationKind(Cow::Borrowed("inventory.slot"));

    /// A host-defined kind.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// MutationTarget
// ---------------------------------------------------------------------------

/// The piece of world state a mutation touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationTarget {
    /// One block cell.
    Block(BlockPos),
    /// A live entity.
    Entity(EntityId),
    /// A spawn site. Reading it yields the entities currently standing there.
    Position(BlockPos),
    /// One slot of an entity's inventory.
    Slot { owner: EntityId, slot: u16 },
    /// Host-defined state addressed by name.
    Custom(String),
}

impl fmt::Display for MutationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block(pos) => write!(f, "block{pos}"),
            Self::Entity(id) => write!(f, "entity {id}"),
            Self::Position(pos) => write!(f, "site{pos}"),
            Self::Slot { owner, slot } => write!(f, "slot {slot} of {owner}"),
            Self::Custom(name) => write!(f, "custom:{name}"),
        }
    }
}

// ---------------------------------------------------------------------------
// EntitySpec
// ---------------------------------------------------------------------------

/// Post-state payload of spawn-like mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    /// Broad entity category (`"item"`, `"zombie"`, `"falling_block"`).
    pub entity_type: String,
    /// Free-form entity data.
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// A proposed change to world state.
///
/// `before` is `Null` until the tracking engine captures the target's
/// projected state at proposal time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub target: MutationTarget,
    #[serde(default)]
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

impl Mutation {
    /// A mutation of an arbitrary kind.
    pub fn new(kind: MutationKind, target: MutationTarget, after: serde_json::Value) -> Self {
        Self {
            kind,
            target,
            before: serde_json::Value::Null,
            after,
        }
    }

    pub fn set_block(pos: BlockPos, state: BlockState) -> Self {
        Self::new(
            MutationKind::BLOCK_SET,
            MutationTarget::Block(pos),
            json!(state.0),
        )
    }

    pub fn drop_item(pos: BlockPos, stack: ItemStack) -> Self {
        Self::new(
            MutationKind::ITEM_DROP,
            MutationTarget::Position(pos),
            json!({
                "entity_type": "item",
                "data": { "item": stack.item, "count": stack.count },
            }),
        )
    }

    pub fn spawn_entity(pos: BlockPos, entity_type: &str, data: serde_json::Value) -> Self {
        Self::new(
            MutationKind::ENTITY_SPAWN,
            MutationTarget::Position(pos),
            json!({ "entity_type": entity_type, "data": data }),
        )
    }

    pub fn remove_entity(id: EntityId) -> Self {
        Self::new(
            MutationKind::ENTITY_REMOVE,
            MutationTarget::Entity(id),
            serde_json::Value::Null,
        )
    }

    pub fn move_entity(id: EntityId, to: BlockPos) -> Self {
        Self::new(
            MutationKind::ENTITY_MOVE,
            MutationTarget::Entity(id),
            json!({ "x": to.x, "y": to.y, "z": to.z }),
        )
    }

    /// Set (or clear, with `None`) an inventory slot.
    pub fn set_slot(owner: EntityId, slot: u16, stack: Option<ItemStack>) -> Self {
        let after = match stack {
            Some(stack) => json!({ "item": stack.item, "count": stack.count }),
            None => serde_json::Value::Null,
        };
        Self::new(
            MutationKind::INVENTORY_SLOT,
            MutationTarget::Slot { owner, slot },
            after,
        )
    }

    /// The block position this mutation targets, if it targets a block.
    pub fn block_pos(&self) -> Option<BlockPos> {
        match self.target {
            MutationTarget::Block(pos) => Some(pos),
            _ => None,
        }
    }

    /// Post-state decoded as a block, for `block.set` mutations.
    pub fn after_block(&self) -> Option<BlockState> {
        serde_json::from_value(self.after.clone()).ok()
    }

    /// Pre-state decoded as a block, once captured.
    pub fn before_block(&self) -> Option<BlockState> {
        serde_json::from_value(self.before.clone()).ok()
    }

    /// Post-state decoded as a spawn payload.
    pub fn after_entity(&self) -> Option<EntitySpec> {
        serde_json::from_value(self.after.clone()).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_kind_equals_builtin_with_same_name() {
        assert_eq!(MutationKind::new("block.set"), MutationKind::BLOCK_SET);
        assert_ne!(MutationKind::new("weather.set"), MutationKind::BLOCK_SET);
    }

    #[test]
    fn drop_item_payload_decodes_as_entity_spec() {
        let m = Mutation::drop_item(BlockPos::new(1, 2, 3), ItemStack::new("dirt", 2));
        let spec = m.after_entity().unwrap();
        assert_eq!(spec.entity_type, "item");
        assert_eq!(spec.data["item"], "dirt");
        assert_eq!(spec.data["count"], 2);
    }

    #[test]
    fn non_block_payload_is_not_a_block() {
        let m = Mutation::move_entity(EntityId::new(0, 0), BlockPos::new(0, 0, 0));
        assert_eq!(m.after_block(), None);
        assert_eq!(m.block_pos(), None);
    }

    #[test]
    fn target_display_is_readable() {
        let t = MutationTarget::Slot {
            owner: EntityId::new(2, 1),
            slot: 4,
        };
        assert_eq!(t.to_string(), "slot 4 of 2v1");
    }
}
