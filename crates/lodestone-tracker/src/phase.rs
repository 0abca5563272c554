//! The phase catalog.
//!
//! A [`PhaseState`] names the kind of top-level operation that is executing:
//! ticking a block, handling a block-break packet, running a command,
//! generating terrain. The set is closed and fixed at compile time; each kind
//! knows its display name, whether it is a player interaction, whether its
//! mutations are announced to observers, and which typed [`PhaseExtras`] a
//! context for it must carry.
//!
//! Effect pipelines are keyed by mutation kind, not by phase kind: the same
//! `block.set` pipeline runs whether the block was broken by a player or by an
//! explosion. Effects that care can inspect the phase through their scope.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use lodestone_world::block::{BlockPos, ChunkPos};

use crate::cause::Cause;

// ---------------------------------------------------------------------------
// Phase kinds
// ---------------------------------------------------------------------------

/// Scheduled world simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TickPhase {
    /// A scheduled block update.
    Block,
    /// A random block tick (grass spread, crop growth).
    RandomBlock,
    Entity,
    BlockEntity,
    /// A block reacting to a change next to it.
    NeighborNotification,
    Weather,
}

/// Handling of one inbound player packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketPhase {
    BreakBlock,
    PlaceBlock,
    UseItem,
    InteractEntity,
    AttackEntity,
    DropItem,
    InventoryClick,
    Chat,
}

/// Server-driven operations that are neither ticks nor packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeneralPhase {
    Command,
    Explosion,
    /// Follow-up block changes queued by an earlier phase (falling blocks,
    /// chained explosions).
    BlockCascade,
    /// Replaying a snapshot. Restores are never announced.
    Restoring,
    Startup,
}

/// World generation. Never announced to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationPhase {
    Terrain,
    Populate,
    ChunkLoad,
    Spawn,
}

/// Work done on behalf of a plugin outside of any other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginPhase {
    Listener,
    ScheduledTask,
}

/// The kind of operation a phase-stack entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseState {
    Tick(TickPhase),
    Packet(PacketPhase),
    General(GeneralPhase),
    Generation(GenerationPhase),
    Plugin(PluginPhase),
}

impl PhaseState {
    /// Stable dotted name, e.g. `"packet.break_block"`.
    pub fn name(self) -> &'static str {
        match self {
            PhaseState::Tick(t) => match t {
                TickPhase::Block => "tick.block",
                TickPhase::RandomBlock => "tick.random_block",
                TickPhase::Entity => "tick.entity",
                TickPhase::BlockEntity => "tick.block_entity",
                TickPhase::NeighborNotification => "tick.neighbor_notification",
                TickPhase::Weather => "tick.weather",
            },
            PhaseState::Packet(p) => match p {
                PacketPhase::BreakBlock => "packet.break_block",
                PacketPhase::PlaceBlock => "packet.place_block",
                PacketPhase::UseItem => "packet.use_item",
                PacketPhase::InteractEntity => "packet.interact_entity",
                PacketPhase::AttackEntity => "packet.attack_entity",
                PacketPhase::DropItem => "packet.drop_item",
                PacketPhase::InventoryClick => "packet.inventory_click",
                PacketPhase::Chat => "packet.chat",
            },
            PhaseState::General(g) => match g {
                GeneralPhase::Command => "general.command",
                GeneralPhase::Explosion => "general.explosion",
                GeneralPhase::BlockCascade => "general.block_cascade",
                GeneralPhase::Restoring => "general.restoring",
                GeneralPhase::Startup => "general.startup",
            },
            PhaseState::Generation(g) => match g {
                GenerationPhase::Terrain => "generation.terrain",
                GenerationPhase::Populate => "generation.populate",
                GenerationPhase::ChunkLoad => "generation.chunk_load",
                GenerationPhase::Spawn => "generation.spawn",
            },
            PhaseState::Plugin(p) => match p {
                PluginPhase::Listener => "plugin.listener",
                PluginPhase::ScheduledTask => "plugin.scheduled_task",
            },
        }
    }

    /// Whether a player directly initiated this phase (used for permission
    /// checks by observers).
    pub fn is_player_interaction(self) -> bool {
        matches!(self, PhaseState::Packet(_))
    }

    /// Whether accepted mutations of this phase are posted to the observer.
    /// Unannounced phases can still be aborted by effects, never vetoed.
    pub fn emits_events(self) -> bool {
        !matches!(
            self,
            PhaseState::Generation(_) | PhaseState::General(GeneralPhase::Restoring)
        )
    }

    /// Extras a context for this phase must carry.
    pub fn required_extras(self) -> &'static [ExtraKey] {
        match self {
            PhaseState::Packet(_) => &[ExtraKey::Player],
            PhaseState::General(GeneralPhase::Command) => &[ExtraKey::Command],
            PhaseState::General(GeneralPhase::Explosion) => &[ExtraKey::Explosion],
            PhaseState::Tick(TickPhase::NeighborNotification) => &[ExtraKey::Notifier],
            PhaseState::Generation(_) => &[ExtraKey::Chunk],
            _ => &[],
        }
    }

    /// Every phase kind, in catalog order.
    pub fn all() -> Vec<PhaseState> {
        use GeneralPhase as G;
        use GenerationPhase as Gen;
        use PacketPhase as P;
        use TickPhase as T;

        let mut all = Vec::with_capacity(25);
        all.extend(
            [
                T::Block,
                T::RandomBlock,
                T::Entity,
                T::BlockEntity,
                T::NeighborNotification,
                T::Weather,
            ]
            .map(PhaseState::Tick),
        );
        all.extend(
            [
                P::BreakBlock,
                P::PlaceBlock,
                P::UseItem,
                P::InteractEntity,
                P::AttackEntity,
                P::DropItem,
                P::InventoryClick,
                P::Chat,
            ]
            .map(PhaseState::Packet),
        );
        all.extend(
            [G::Command, G::Explosion, G::BlockCascade, G::Restoring, G::Startup]
                .map(PhaseState::General),
        );
        all.extend(
            [Gen::Terrain, Gen::Populate, Gen::ChunkLoad, Gen::Spawn].map(PhaseState::Generation),
        );
        all.extend([PluginPhase::Listener, PluginPhase::ScheduledTask].map(PhaseState::Plugin));
        all
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Extras
// ---------------------------------------------------------------------------

/// Names of the typed fields in [`PhaseExtras`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtraKey {
    Player,
    Command,
    Explosion,
    Notifier,
    Chunk,
}

impl fmt::Display for ExtraKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExtraKey::Player => "player",
            ExtraKey::Command => "command",
            ExtraKey::Explosion => "explosion",
            ExtraKey::Notifier => "notifier",
            ExtraKey::Chunk => "chunk",
        })
    }
}

/// Parameters of an explosion phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explosion {
    pub origin: BlockPos,
    pub radius: u8,
    /// `false` for explosions that damage entities but leave terrain intact.
    pub breaks_blocks: bool,
}

/// Per-phase data beyond the source cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseExtras {
    /// The player who initiated the operation.
    pub player: Option<Cause>,
    /// The command line being executed.
    pub command: Option<String>,
    pub explosion: Option<Explosion>,
    /// The block whose change triggered a neighbour notification.
    pub notifier: Option<BlockPos>,
    /// The chunk being generated or loaded.
    pub chunk: Option<ChunkPos>,
    /// Host-defined values.
    pub custom: BTreeMap<String, serde_json::Value>,
}

impl PhaseExtras {
    pub fn has(&self, key: ExtraKey) -> bool {
        match key {
            ExtraKey::Player => self.player.is_some(),
            ExtraKey::Command => self.command.is_some(),
            ExtraKey::Explosion => self.explosion.is_some(),
            ExtraKey::Notifier => self.notifier.is_some(),
            ExtraKey::Chunk => self.chunk.is_some(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
