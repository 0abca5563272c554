//! Standard gameplay rules.
//!
//! Most rules are [`Effect`]s on the `block.set` pipeline: they guard,
//! extend, or cancel block changes while a phase completes. Random block
//! ticks are the exception; they start their own phase and live in
//! [`random_tick`].
//!
//! | Effect              | Does                                                    |
//! |---------------------|---------------------------------------------------------|
//! | `bounds_guard`      | aborts block writes outside the build height            |
//! | `unbreakable_guard` | aborts player breaks of unbreakable blocks              |
//! | `block_drops`       | breaking a block drops its item                         |
//! | `tnt_chain`         | TNT destroyed by an explosion destroys its surroundings |
//! | `gravity`           | sand and gravel fall into the air below them            |
//!
//! Pipelines run in that order, so a guard rejects a change before any
//! follow-up is proposed for it.

use rand::Rng;
use tracing::trace;

use lodestone_tracker::cause::Cause;
use lodestone_tracker::commit::{CompletionReport, EffectScope};
use lodestone_tracker::context::PhaseContextBuilder;
use lodestone_tracker::effect::{Effect, EffectResult, PipelineRegistry};
use lodestone_tracker::phase::{GeneralPhase, PacketPhase, PhaseState, TickPhase};
use lodestone_tracker::tracking::TrackingContext;
use lodestone_tracker::TrackerError;
use lodestone_world::block::{BlockPos, BlockState};
use lodestone_world::mutation::{Mutation, MutationKind};

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

/// Register every standard rule.
pub fn install_standard_rules(registry: &mut PipelineRegistry) {
    registry
        .register(MutationKind::BLOCK_SET, BoundsGuard)
        .register(MutationKind::BLOCK_SET, UnbreakableGuard)
        .register(MutationKind::BLOCK_SET, BlockDrops)
        .register(MutationKind::BLOCK_SET, TntChain::default())
        .register(MutationKind::BLOCK_SET, Gravity);
}

/// A fresh registry with the standard rules.
pub fn standard_rules() -> PipelineRegistry {
    let mut registry = PipelineRegistry::new();
    install_standard_rules(&mut registry);
    registry
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Position, pre-state and post-state of the block change being processed.
fn block_change(scope: &EffectScope<'_>) -> Option<(BlockPos, BlockState, BlockState)> {
    let mutation = scope.mutation();
    let pos = mutation.block_pos()?;
    let before = mutation.before_block().unwrap_or(BlockState::AIR);
    let after = mutation.after_block()?;
    Some((pos, before, after))
}

/// Whether the transaction being processed is part of a falling block's
/// move rather than a break.
fn is_falling_move(scope: &EffectScope<'_>) -> bool {
    scope
        .log()
        .get(scope.transaction())
        .and_then(|t| t.cause().most_recent())
        .is_some_and(|c| matches!(c, Cause::Block { state, .. } if state.has_gravity()))
}

/// Propose `mutations` under `cause`. Any failure aborts the parent so that a
/// half-proposed cascade is never committed.
fn propose_all(scope: &mut EffectScope<'_>, cause: Cause, mutations: Vec<Mutation>) -> EffectResult {
    let outcome = scope.with_cause(cause, |scope| {
        mutations
            .into_iter()
            .try_for_each(|m| scope.propose(m).map(|_| ()))
    });
    match outcome {
        Ok(Ok(())) => EffectResult::Continue,
        _ => EffectResult::Abort,
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Rejects block writes outside the world's build height.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoundsGuard;

impl Effect for BoundsGuard {
    fn name(&self) -> &str {
        "bounds_guard"
    }

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult {
        match scope.mutation().block_pos() {
            Some(pos) if !scope.world().in_bounds(pos) => EffectResult::Abort,
            _ => EffectResult::Continue,
        }
    }
}

/// Rejects players breaking blocks that cannot be broken.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnbreakableGuard;

impl Effect for UnbreakableGuard {
    fn name(&self) -> &str {
        "unbreakable_guard"
    }

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult {
        if !scope.phase().is_player_interaction() {
            return EffectResult::Continue;
        }
        match block_change(scope) {
            Some((_, before, after)) if after.is_air() && !before.is_air() && !before.is_breakable() => {
                EffectResult::Abort
            }
            _ => EffectResult::Continue,
        }
    }
}

// ---------------------------------------------------------------------------
// Drops
// ---------------------------------------------------------------------------

/// Broken blocks drop their item where they stood.
///
/// Only player breaks and explosions drop items; blocks moved by gravity do
/// not.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockDrops;

impl Effect for BlockDrops {
    fn name(&self) -> &str {
        "block_drops"
    }

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult {
        let breaking = matches!(
            scope.phase(),
            PhaseState::Packet(PacketPhase::BreakBlock) | PhaseState::General(GeneralPhase::Explosion)
        );
        if !breaking || is_falling_move(scope) {
            return EffectResult::Continue;
        }
        let Some((pos, before, after)) = block_change(scope) else {
            return EffectResult::Continue;
        };
        let Some(stack) = before.drop_item().filter(|_| after.is_air()) else {
            return EffectResult::Continue;
        };
        match scope.propose(Mutation::drop_item(pos, stack)) {
            Ok(_) => EffectResult::Continue,
            Err(_) => EffectResult::Abort,
        }
    }
}

// ---------------------------------------------------------------------------
// TNT
// ---------------------------------------------------------------------------

/// TNT destroyed by an explosion breaks every breakable block within
/// `radius` of it. TNT caught in that blast chains further.
#[derive(Debug, Clone, Copy)]
pub struct TntChain {
    pub radius: i32,
}

impl Default for TntChain {
    fn default() -> Self {
        Self { radius: 1 }
    }
}

impl Effect for TntChain {
    fn name(&self) -> &str {
        "tnt_chain"
    }

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult {
        if scope.phase() != PhaseState::General(GeneralPhase::Explosion) {
            return EffectResult::Continue;
        }
        let Some((pos, before, after)) = block_change(scope) else {
            return EffectResult::Continue;
        };
        if before != BlockState::TNT || !after.is_air() {
            return EffectResult::Continue;
        }

        let r = self.radius;
        let mut blast = Vec::new();
        for dx in -r..=r {
            for dy in -r..=r {
                for dz in -r..=r {
                    let Some(target) = pos.checked_offset(dx, dy, dz) else {
                        continue;
                    };
                    if target == pos || pos.distance_squared(target) > i64::from(r * r) {
                        continue;
                    }
                    if scope.world().in_bounds(target) && scope.projected_block(target).is_breakable() {
                        blast.push(Mutation::set_block(target, BlockState::AIR));
                    }
                }
            }
        }
        trace!(at = %pos, blocks = blast.len(), "tnt chained");
        propose_all(scope, Cause::Block { pos, state: before }, blast)
    }
}

// ---------------------------------------------------------------------------
// Gravity
// ---------------------------------------------------------------------------

/// Sand and gravel fall until they land on something.
///
/// Two triggers:
///
/// - a gravity block written above air drops to the first supported cell;
/// - a cell becoming air lets the column of gravity blocks resting on it
///   settle down into the gap.
///
/// Moves are proposed under a [`Cause::Block`] naming the falling block.
/// World generation never triggers gravity.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gravity;

impl Gravity {
    /// Lowest air cell reachable by falling straight down from `from`.
    fn landing(scope: &EffectScope<'_>, from: BlockPos) -> BlockPos {
        let mut base = from;
        while let Some(next) = base.checked_offset(0, -1, 0) {
            if !scope.world().in_bounds(next) || !scope.projected_block(next).is_air() {
                break;
            }
            base = next;
        }
        base
    }

    fn drop_block(scope: &mut EffectScope<'_>, pos: BlockPos, state: BlockState) -> EffectResult {
        let Some(below) = pos.checked_offset(0, -1, 0) else {
            return EffectResult::Continue;
        };
        if !scope.world().in_bounds(below) || !scope.projected_block(below).is_air() {
            return EffectResult::Continue;
        }
        let land = Self::landing(scope, below);
        // Land first so the cell left behind sees the block already below it.
        propose_all(
            scope,
            Cause::Block { pos, state },
            vec![
                Mutation::set_block(land, state),
                Mutation::set_block(pos, BlockState::AIR),
            ],
        )
    }

    fn settle_column(scope: &mut EffectScope<'_>, gap: BlockPos) -> EffectResult {
        let mut column = Vec::new();
        let mut cursor = gap.checked_offset(0, 1, 0);
        while let Some(at) = cursor.filter(|&at| scope.world().in_bounds(at)) {
            let state = scope.projected_block(at);
            if !state.has_gravity() {
                break;
            }
            column.push((at, state));
            cursor = at.checked_offset(0, 1, 0);
        }
        let Some(&(bottom, bottom_state)) = column.first() else {
            return EffectResult::Continue;
        };

        let base = Self::landing(scope, gap);
        let top_filled = base.y + column.len() as i32 - 1;
        let mut moves: Vec<Mutation> = column
            .iter()
            .enumerate()
            .map(|(i, (_, state))| Mutation::set_block(base.offset(0, i as i32, 0), *state))
            .collect();
        // Clear top-down so no cleared cell sees a gravity block above it.
        moves.extend(
            column
                .iter()
                .rev()
                .filter(|(from, _)| from.y > top_filled)
                .map(|(from, _)| Mutation::set_block(*from, BlockState::AIR)),
        );
        propose_all(
            scope,
            Cause::Block {
                pos: bottom,
                state: bottom_state,
            },
            moves,
        )
    }
}

impl Effect for Gravity {
    fn name(&self) -> &str {
        "gravity"
    }

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult {
        if matches!(scope.phase(), PhaseState::Generation(_)) {
            return EffectResult::Continue;
        }
        let Some((pos, _, after)) = block_change(scope) else {
            return EffectResult::Continue;
        };
        if after.is_air() {
            Self::settle_column(scope, pos)
        } else if after.has_gravity() {
            Self::drop_block(scope, pos, after)
        } else {
            EffectResult::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// Random block ticks
// ---------------------------------------------------------------------------

/// Run one random tick at `pos`.
///
/// Grass with a block on top decays to dirt. Otherwise it tries to spread to
/// one random cell in the 3x5x3 box around it (one up, three down); the cell
/// turns to grass if it is dirt with air above. Returns `None` when nothing
/// was proposed, in which case no phase was entered.
pub fn random_tick<R: Rng + ?Sized>(
    tc: &mut TrackingContext,
    rng: &mut R,
    pos: BlockPos,
) -> Result<Option<CompletionReport>, TrackerError> {
    let state = tc.projected_block(pos);
    if state != BlockState::GRASS {
        return Ok(None);
    }

    let covered = pos
        .checked_offset(0, 1, 0)
        .is_some_and(|above| !tc.projected_block(above).is_air());
    let change = if covered {
        Mutation::set_block(pos, BlockState::DIRT)
    } else {
        let target = pos.checked_offset(
            rng.gen_range(-1..=1),
            rng.gen_range(-3..=1),
            rng.gen_range(-1..=1),
        );
        let Some((target, above)) = target.and_then(|t| Some((t, t.checked_offset(0, 1, 0)?))) else {
            return Ok(None);
        };
        if tc.projected_block(target) != BlockState::DIRT || !tc.projected_block(above).is_air() {
            return Ok(None);
        }
        Mutation::set_block(target, BlockState::GRASS)
    };

    let mut phase = tc.enter(
        PhaseState::Tick(TickPhase::RandomBlock),
        PhaseContextBuilder::new(Cause::Block { pos, state }),
    )?;
    phase.propose(change)?;
    phase.finish().map(Some)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
