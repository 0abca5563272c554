//! Lodestone Tracker -- phase and transaction tracking for the tick thread.
//!
//! Every world mutation proposed during a tick is captured, attributed to a
//! cause chain, run through the effect pipeline of its mutation kind, offered
//! to observers for veto, and only then applied to the live world. This crate
//! is that bookkeeping engine.
//!
//! # Architecture
//!
//! - [`cause`]: [`CauseStack`](cause::CauseStack) of responsible objects plus
//!   scoped context values.
//! - [`phase`]: the fixed catalog of [`PhaseState`](phase::PhaseState)s and the
//!   typed extras each one requires.
//! - [`transaction`]: the arena-backed [`TransactionLog`](transaction::TransactionLog)
//!   recording proposed mutations as ordered trees.
//! - [`effect`]: [`Effect`](effect::Effect)s and per-kind
//!   [`EffectPipeline`](effect::EffectPipeline)s.
//! - [`context`] and [`tracker`]: per-phase [`PhaseContext`](context::PhaseContext)
//!   and the [`PhaseTracker`](tracker::PhaseTracker) stack.
//! - [`commit`]: the accept/veto/apply algorithm run when a phase exits.
//! - [`tracking`]: [`TrackingContext`](tracking::TrackingContext), which owns all
//!   of the above plus the world and the observer, and is passed explicitly to
//!   everything that runs on the tick thread.
//!
//! # Quick Start
//!
//! ```
//! use lodestone_tracker::prelude::*;
//! use lodestone_world::prelude::*;
//!
//! let mut tracking = TrackingContext::builder(VoxelWorld::new(WorldConfig::default())).build();
//! let pos = BlockPos::new(0, 64, 0);
//!
//! {
//!     let mut phase = tracking
//!         .enter(PhaseState::Tick(TickPhase::Block), PhaseContextBuilder::new(Cause::Server))
//!         .unwrap();
//!     phase.propose(Mutation::set_block(pos, BlockState::STONE)).unwrap();
//!     // Nothing is applied until the phase exits.
//!     assert_eq!(phase.world().block(pos), BlockState::AIR);
//! }
//!
//! assert_eq!(tracking.world().block(pos), BlockState::STONE);
//! ```

#![deny(unsafe_code)]

pub mod cause;
pub mod commit;
pub mod context;
pub mod diagnostics;
pub mod effect;
pub mod event;
pub mod phase;
pub mod thread;
pub mod tracker;
pub mod tracking;
pub mod transaction;

use serde::{Deserialize, Serialize};

use lodestone_world::WorldError;

// ---------------------------------------------------------------------------
// TrackerConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for a [`TrackingContext`](tracking::TrackingContext).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Deepest allowed cascade of child transactions below a root.
    ///
    /// `None` leaves cascades unbounded: a handler that keeps re-proposing
    /// itself exhausts the thread stack.
    pub max_cascade_depth: Option<usize>,
    /// How many diagnostics are kept in memory for inspection.
    pub diagnostic_history: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_cascade_depth: None,
            diagnostic_history: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors surfaced by the tracking engine.
///
/// Everything except [`TrackerError::WorldApply`] is a usage error in calling
/// code: it is returned, logged with the phase stack, and otherwise has no
/// effect on world state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackerError {
    /// A cause pop would go below the current frame or the thread baseline.
    #[error("cause stack imbalance: cannot pop below depth {floor} (depth is {depth})")]
    ImbalancedStack { depth: usize, floor: usize },

    /// A cause frame was closed while frames opened after it were still open.
    /// The stack was unwound to the closed frame's depth.
    #[error("cause frame {frame} closed out of order; {unwound} inner frame(s) force-closed")]
    FrameOutOfOrder { frame: u64, unwound: usize },

    /// A cause frame was closed twice, or never existed.
    #[error("cause frame {frame} is not open")]
    UnknownFrame { frame: u64 },

    /// A mutating call arrived from a thread other than the tick thread.
    #[error("'{operation}' called from thread {current}, but the tracker is owned by {owner}")]
    WrongThread {
        operation: &'static str,
        owner: String,
        current: String,
    },

    /// A mutation was proposed with no phase active. The mutation is dropped.
    #[error("mutation '{kind}' on {target} proposed with no active phase; dropped")]
    ProposeWhileIdle { kind: String, target: String },

    /// A mutation was proposed against a phase that has already completed.
    #[error("phase {phase} has already completed; proposal dropped")]
    ProposeAfterCompletion { phase: u64 },

    /// A mutation was proposed against a phase that is not the current one.
    #[error("phase {phase} is not switched in (current phase is {current})")]
    InactiveContext { phase: u64, current: u64 },

    /// `exit` named a phase that is not on the stack (usually: exited twice).
    #[error("phase {phase} is not on the phase stack (already exited?)")]
    UnknownPhase { phase: u64 },

    /// A phase was exited while phases entered after it were still open.
    #[error("phase {phase} exited with {above} phase(s) still open above it; completing them first")]
    OutOfOrderExit { phase: u64, above: usize },

    /// A phase was still open when the tick ended.
    #[error("phase '{phase}' was never exited; completing it at end of tick")]
    LeakedPhase { phase: String },

    /// A phase context was built without an extra its phase kind requires.
    #[error("phase '{phase}' requires extra '{extra}'")]
    MissingExtra {
        phase: &'static str,
        extra: phase::ExtraKey,
    },

    /// A cascade went deeper than [`TrackerConfig::max_cascade_depth`].
    #[error("cascade depth {depth} exceeds the configured limit of {limit}")]
    CascadeDepthExceeded { depth: usize, limit: usize },

    /// An untracked mutation was attempted while a phase is open.
    #[error("untracked mutation '{kind}' attempted while phase '{phase}' is active")]
    UntrackedWhileActive { kind: String, phase: &'static str },

    /// The world could not apply a mutation. Fatal when raised during commit,
    /// because observers have already been told the mutation happened.
    #[error("world rejected accepted mutation '{kind}' on {target}: {source}")]
    WorldApply {
        kind: String,
        target: String,
        #[source]
        source: WorldError,
    },
}

impl TrackerError {
    /// Whether this error invalidates the engine's guarantees.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrackerError::WorldApply { .. })
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::cause::{Cause, CauseChain, CauseStack, ContextKey, FrameId, StackFrame};
    pub use crate::commit::{CompletionReport, EffectScope};
    pub use crate::context::{PhaseContext, PhaseContextBuilder, PhaseId};
    pub use crate::diagnostics::{Diagnostic, Diagnostics};
    pub use crate::effect::{effect_fn, Effect, EffectPipeline, EffectResult, PipelineRegistry};
    pub use crate::event::{EventObserver, MutationEvent, NullObserver};
    pub use crate::phase::{
        Explosion, ExtraKey, GeneralPhase, GenerationPhase, PacketPhase, PhaseExtras, PhaseState,
        PluginPhase, TickPhase,
    };
    pub use crate::thread::ThreadAffinity;
    pub use crate::tracker::{PhaseTracker, TrackerState};
    pub use crate::tracking::{CauseFrame, PhaseHandle, TrackingContext, TrackingContextBuilder};
    pub use crate::transaction::{
        RejectReason, Transaction, TransactionId, TransactionLog, TransactionStatus,
    };
    pub use crate::{TrackerConfig, TrackerError};
}
