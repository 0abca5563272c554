//! Lodestone Server -- the tick loop and gameplay rules on top of the
//! tracking engine.
//!
//! This crate is the host side: it owns a
//! [`TrackingContext`](lodestone_tracker::tracking::TrackingContext), drives it
//! one fixed-timestep tick at a time, and turns player actions, commands and
//! random ticks into phases.
//!
//! # Architecture
//!
//! - [`config`]: [`ServerConfig`](config::ServerConfig) and
//!   [`TickConfig`](config::TickConfig), loadable from JSON.
//! - [`rules`]: the standard [`Effect`](lodestone_tracker::effect::Effect)s
//!   (drops, gravity, TNT, guards) and random block ticks.
//! - [`interaction`]: player actions, explosions and server commands, each
//!   run as its own phase.
//! - [`tick`]: the [`TickLoop`](tick::TickLoop) with its systems, end-of-tick
//!   cleanup and history.
//!
//! # Quick Start
//!
//! ```
//! use lodestone_server::prelude::*;
//!
//! let config = ServerConfig::default();
//! let mut server = TickLoop::from_config(&config, EventBus::new()).unwrap();
//!
//! server.add_system("build", |tc, info| {
//!     if info.tick == 0 {
//!         let report = place_block(tc, &Cause::Server, BlockPos::new(0, 64, 0), BlockState::STONE);
//!         info.record(report.unwrap());
//!     }
//! });
//!
//! let record = server.tick().unwrap();
//! assert_eq!(record.applied, 1);
//! assert_eq!(server.tracking().world().block(BlockPos::new(0, 64, 0)), BlockState::STONE);
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod interaction;
pub mod rules;
pub mod tick;

use tracing_subscriber::EnvFilter;

use lodestone_tracker::TrackerError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by the server layer.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    /// The world rejected a mutation observers were already told about.
    /// The loop halts; no further ticks run.
    #[error("tick {tick} failed fatally: {source}")]
    Fatal {
        tick: u64,
        #[source]
        source: TrackerError,
    },

    /// `tick` was called after a fatal error.
    #[error("tick loop halted after a fatal error at tick {tick}")]
    Halted { tick: u64 },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error("unknown command '{name}'")]
    UnknownCommand { name: String },

    #[error("bad arguments for '{command}': {details}")]
    BadArguments { command: String, details: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a `tracing` subscriber that honours `RUST_LOG`, falling back to
/// `default_filter`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init()
        .is_ok()
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common server usage.
pub mod prelude {
    pub use lodestone_events::prelude::*;
    pub use lodestone_tracker::prelude::*;
    pub use lodestone_world::prelude::*;

    pub use crate::config::{BlockRegion, ServerConfig, TickConfig};
    pub use crate::interaction::{break_block, explode, place_block, run_command, Command};
    pub use crate::rules::{
        install_standard_rules, random_tick, standard_rules, BlockDrops, BoundsGuard, Gravity,
        TntChain, UnbreakableGuard,
    };
    pub use crate::tick::{SystemFn, TickDiagnostics, TickInfo, TickLoop};
    pub use crate::{init_tracing, TickError};
}
