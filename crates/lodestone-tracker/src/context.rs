//! Per-phase state: one [`PhaseContext`] per phase-stack entry.

use std::fmt;

use serde::{Deserialize, Serialize};

use lodestone_world::block::{BlockPos, ChunkPos};
use lodestone_world::mutation::Mutation;

use crate::cause::{Cause, FrameId};
use crate::phase::{Explosion, PhaseExtras, PhaseState};
use crate::transaction::{Attribution, TransactionId, TransactionLog};
use crate::TrackerError;

/// Identity of one phase-stack entry, unique for the lifetime of its
/// tracking context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhaseId(pub(crate) u64);

impl PhaseId {
    /// The numeric id.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PhaseContext
// ---------------------------------------------------------------------------

/// The data of one active phase: what it is, who started it, and what it has
/// proposed so far.
///
/// A context only accepts proposals while it is switched in, which is the
/// case from the moment it is pushed until another phase is entered above
/// it, and again once that phase exits. After completion it accepts nothing.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    id: PhaseId,
    state: PhaseState,
    source: Cause,
    extras: PhaseExtras,
    log: TransactionLog,
    active: bool,
    completed: bool,
    pub(crate) frame: Option<FrameId>,
}

impl PhaseContext {
    /// Identity of this phase.
    pub fn id(&self) -> PhaseId {
        self.id
    }

    /// Kind of this phase.
    pub fn state(&self) -> PhaseState {
        self.state
    }

    /// The cause the phase was entered with.
    pub fn source(&self) -> &Cause {
        &self.source
    }

    /// Extras supplied on entry.
    pub fn extras(&self) -> &PhaseExtras {
        &self.extras
    }

    /// Proposals made so far. Empty and sealed once completion has begun.
    pub fn log(&self) -> &TransactionLog {
        &self.log
    }

    /// Whether the context is switched in and accepting proposals.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether completion has begun.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub(crate) fn activate(&mut self) {
        self.active = true;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }

    /// Record a proposal in this context's log. `mutation.before` must already
    /// be captured.
    pub(crate) fn propose(
        &mut self,
        mutation: Mutation,
        attribution: Attribution,
        current: PhaseId,
    ) -> Result<TransactionId, TrackerError> {
        if self.completed {
            return Err(TrackerError::ProposeAfterCompletion { phase: self.id.0 });
        }
        if !self.active {
            return Err(TrackerError::InactiveContext {
                phase: self.id.0,
                current: current.0,
            });
        }
        self.log.propose(mutation, attribution)
    }

    /// Hand the log and extras to the commit algorithm and mark the context
    /// completed.
    pub(crate) fn take_for_completion(&mut self) -> (TransactionLog, PhaseExtras) {
        self.completed = true;
        self.active = false;
        let log = std::mem::replace(&mut self.log, TransactionLog::owned_by(self.id.0));
        self.log.seal();
        (log, self.extras.clone())
    }
}

// ---------------------------------------------------------------------------
// PhaseContextBuilder
// ---------------------------------------------------------------------------

/// Collects the source cause and extras for a phase about to be entered.
///
/// The phase kind checks on entry that every extra it requires is present.
///
/// ```
/// use lodestone_tracker::prelude::*;
/// use lodestone_world::prelude::*;
///
/// let player = Cause::player(EntityId::new(0, 0), "alex");
/// let builder = PhaseContextBuilder::new(player.clone()).player(player);
/// # let _ = builder;
/// ```
#[derive(Debug, Clone)]
pub struct PhaseContextBuilder {
    source: Cause,
    extras: PhaseExtras,
}

impl PhaseContextBuilder {
    /// Start a builder for a phase entered by `source`.
    pub fn new(source: Cause) -> Self {
        Self {
            source,
            extras: PhaseExtras::default(),
        }
    }

    /// The player behind a packet phase.
    pub fn player(mut self, player: Cause) -> Self {
        self.extras.player = Some(player);
        self
    }

    /// The command line being run.
    pub fn command(mut self, line: impl Into<String>) -> Self {
        self.extras.command = Some(line.into());
        self
    }

    /// The explosion being resolved.
    pub fn explosion(mut self, explosion: Explosion) -> Self {
        self.extras.explosion = Some(explosion);
        self
    }

    /// The block whose update started this phase.
    pub fn notifier(mut self, pos: BlockPos) -> Self {
        self.extras.notifier = Some(pos);
        self
    }

    /// The chunk being generated or loaded.
    pub fn chunk(mut self, chunk: ChunkPos) -> Self {
        self.extras.chunk = Some(chunk);
        self
    }

    /// Attach a host-defined extra under `key`.
    pub fn extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.custom.insert(key.into(), value);
        self
    }

    /// The cause the phase will be entered with.
    pub fn source(&self) -> &Cause {
        &self.source
    }

    /// Build an inactive context, checking required extras.
    pub(crate) fn build(self, id: PhaseId, state: PhaseState) -> Result<PhaseContext, TrackerError> {
        if let Some(missing) = state
            .required_extras()
            .iter()
            .find(|key| !self.extras.has(**key))
        {
            return Err(TrackerError::MissingExtra {
                phase: state.name(),
                extra: *missing,
            });
        }
        Ok(PhaseContext {
            id,
            state,
            source: self.source,
            extras: self.extras,
            log: TransactionLog::owned_by(id.0),
            active: false,
            completed: false,
            frame: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
