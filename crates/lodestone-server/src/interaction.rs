//! Player actions, explosions and server commands.
//!
//! Each entry point enters its own phase, proposes the initial mutations and
//! completes the phase before returning. Follow-up changes (drops, falling
//! blocks, chained TNT) come from the effects installed by
//! [`rules`](crate::rules).
//!
//! # Example
//!
//! ```
//! use lodestone_server::prelude::*;
//!
//! let mut world = VoxelWorld::default();
//! world.set_block(BlockPos::new(0, 64, 0), BlockState::STONE);
//! let mut tc = TrackingContext::builder(world).pipelines(standard_rules()).build();
//!
//! let alex = Cause::player(EntityId::new(0, 0), "alex");
//! let report = break_block(&mut tc, &alex, BlockPos::new(0, 64, 0)).unwrap();
//! // The block and its cobblestone drop.
//! assert_eq!(report.applied.len(), 2);
//! ```

use tracing::debug;

use lodestone_tracker::cause::Cause;
use lodestone_tracker::commit::CompletionReport;
use lodestone_tracker::context::PhaseContextBuilder;
use lodestone_tracker::phase::{Explosion, GeneralPhase, PacketPhase, PhaseState};
use lodestone_tracker::tracking::TrackingContext;
use lodestone_tracker::TrackerError;
use lodestone_world::block::{BlockPos, BlockState};
use lodestone_world::mutation::Mutation;

use crate::config::BlockRegion;
use crate::TickError;

/// Largest region `fill` accepts.
pub const MAX_FILL_VOLUME: u64 = 32_768;

// ---------------------------------------------------------------------------
// Player actions
// ---------------------------------------------------------------------------

/// `player` breaks the block at `pos`.
pub fn break_block(
    tc: &mut TrackingContext,
    player: &Cause,
    pos: BlockPos,
) -> Result<CompletionReport, TrackerError> {
    let mut phase = tc.enter(
        PhaseState::Packet(PacketPhase::BreakBlock),
        PhaseContextBuilder::new(player.clone()).player(player.clone()),
    )?;
    phase.propose(Mutation::set_block(pos, BlockState::AIR))?;
    phase.finish()
}

/// `player` places `state` at `pos`.
pub fn place_block(
    tc: &mut TrackingContext,
    player: &Cause,
    pos: BlockPos,
    state: BlockState,
) -> Result<CompletionReport, TrackerError> {
    let mut phase = tc.enter(
        PhaseState::Packet(PacketPhase::PlaceBlock),
        PhaseContextBuilder::new(player.clone()).player(player.clone()),
    )?;
    phase.propose(Mutation::set_block(pos, state))?;
    phase.finish()
}

// ---------------------------------------------------------------------------
// Explosions
// ---------------------------------------------------------------------------

/// Blow up every breakable block within `radius` of `origin`.
///
/// Blocks are proposed in x, y, z order. TNT caught in the blast chains
/// through [`TntChain`](crate::rules::TntChain) while the phase completes.
pub fn explode(
    tc: &mut TrackingContext,
    source: Cause,
    origin: BlockPos,
    radius: u8,
) -> Result<CompletionReport, TrackerError> {
    let explosion = Explosion {
        origin,
        radius,
        breaks_blocks: true,
    };
    let mut phase = tc.enter(
        PhaseState::General(GeneralPhase::Explosion),
        PhaseContextBuilder::new(source).explosion(explosion),
    )?;

    let r = i32::from(radius);
    let mut blast = Vec::new();
    for dx in -r..=r {
        for dy in -r..=r {
            for dz in -r..=r {
                let Some(pos) = origin.checked_offset(dx, dy, dz) else {
                    continue;
                };
                if origin.distance_squared(pos) > i64::from(r * r) {
                    continue;
                }
                if phase.world().in_bounds(pos) && phase.projected_block(pos).is_breakable() {
                    blast.push(pos);
                }
            }
        }
    }
    debug!(origin = %origin, radius, blocks = blast.len(), "explosion");
    for pos in blast {
        phase.propose(Mutation::set_block(pos, BlockState::AIR))?;
    }
    phase.finish()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// A parsed server command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `setblock <x> <y> <z> <block>`
    SetBlock { pos: BlockPos, state: BlockState },
    /// `fill <x1> <y1> <z1> <x2> <y2> <z2> <block>`
    Fill { region: BlockRegion, state: BlockState },
    /// `summon <type> <x> <y> <z>`
    Summon { entity_type: String, pos: BlockPos },
    /// `explode <x> <y> <z> <radius>`
    Explode { origin: BlockPos, radius: u8 },
}

impl Command {
    /// Parse a command line. A leading `/` is ignored.
    pub fn parse(line: &str) -> Result<Command, TickError> {
        let mut words = line.trim().trim_start_matches('/').split_whitespace();
        let name = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let bad = |details: String| TickError::BadArguments {
            command: name.to_owned(),
            details,
        };
        let expect = |count: usize, usage: &str| {
            if args.len() == count {
                Ok(())
            } else {
                Err(bad(format!("expected {usage}, got {} argument(s)", args.len())))
            }
        };
        let int = |word: &str| {
            word.parse::<i32>()
                .map_err(|_| bad(format!("'{word}' is not an integer")))
        };
        let pos = |at: usize| -> Result<BlockPos, TickError> {
            Ok(BlockPos::new(int(args[at])?, int(args[at + 1])?, int(args[at + 2])?))
        };
        let block = |word: &str| {
            BlockState::from_name(word)
                .or_else(|| word.parse::<u16>().ok().map(BlockState))
                .ok_or_else(|| bad(format!("unknown block '{word}'")))
        };

        match name {
            "setblock" => {
                expect(4, "<x> <y> <z> <block>")?;
                Ok(Command::SetBlock {
                    pos: pos(0)?,
                    state: block(args[3])?,
                })
            }
            "fill" => {
                expect(7, "<x1> <y1> <z1> <x2> <y2> <z2> <block>")?;
                let region = BlockRegion::new(pos(0)?, pos(3)?);
                if region.volume() > MAX_FILL_VOLUME {
                    return Err(bad(format!(
                        "region of {} blocks exceeds the limit of {MAX_FILL_VOLUME}",
                        region.volume()
                    )));
                }
                Ok(Command::Fill {
                    region,
                    state: block(args[6])?,
                })
            }
            "summon" => {
                expect(4, "<type> <x> <y> <z>")?;
                Ok(Command::Summon {
                    entity_type: args[0].to_owned(),
                    pos: pos(1)?,
                })
            }
            "explode" => {
                expect(4, "<x> <y> <z> <radius>")?;
                let radius = args[3]
                    .parse::<u8>()
                    .map_err(|_| bad(format!("'{}' is not a radius", args[3])))?;
                Ok(Command::Explode {
                    origin: pos(0)?,
                    radius,
                })
            }
            other => Err(TickError::UnknownCommand {
                name: other.to_owned(),
            }),
        }
    }

    fn mutations(&self) -> Vec<Mutation> {
        match self {
            Command::SetBlock { pos, state } => vec![Mutation::set_block(*pos, *state)],
            Command::Fill { region, state } => {
                let mut out = Vec::new();
                for x in region.min.x..=region.max.x {
                    for y in region.min.y..=region.max.y {
                        for z in region.min.z..=region.max.z {
                            out.push(Mutation::set_block(BlockPos::new(x, y, z), *state));
                        }
                    }
                }
                out
            }
            Command::Summon { entity_type, pos } => {
                vec![Mutation::spawn_entity(*pos, entity_type, serde_json::json!({}))]
            }
            Command::Explode { .. } => Vec::new(),
        }
    }
}

/// Parse and run `line` on behalf of `sender`.
///
/// The command runs in a `general.command` phase, with a
/// [`Cause::Command`] on top of the sender. `explode` enters a nested
/// explosion phase, so it returns two reports, the explosion first; every
/// other command returns one.
///
/// Parse errors are returned before any phase is entered.
pub fn run_command(
    tc: &mut TrackingContext,
    sender: Cause,
    line: &str,
) -> Result<Vec<CompletionReport>, TickError> {
    let command = Command::parse(line)?;
    let mut reports = Vec::with_capacity(2);

    let mut phase = tc.enter(
        PhaseState::General(GeneralPhase::Command),
        PhaseContextBuilder::new(sender.clone()).command(line.trim()),
    )?;
    {
        let mut frame = phase.push_frame()?;
        frame.push_cause(Cause::Command(line.trim().to_owned()))?;
        if let Command::Explode { origin, radius } = command {
            reports.push(explode(&mut frame, sender, origin, radius)?);
        }
        for mutation in command.mutations() {
            frame.propose(mutation)?;
        }
    }
    reports.push(phase.finish()?);
    Ok(reports)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
