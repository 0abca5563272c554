//! Per-tick records of completed phases and cross-tick causal trails.
//!
//! [`EventHistory`] turns the [`CompletionReport`]s drained from a tracking
//! context into one [`TickRecord`] per tick and keeps a bounded window of
//! them. Each tick follows this flow:
//!
//! 1. [`EventHistory::begin_tick`]: start a fresh record.
//! 2. [`EventHistory::record_report`] for every completed phase.
//! 3. [`EventHistory::end_tick`]: seal the record and push it to the rolling
//!    history.
//!
//! # Causal trails
//!
//! [`EventHistory::build_trail`] walks backward through the current tick
//! and the history collecting every committed change to one target, most
//! recent first, so "who last touched this block, and who before them" can
//! be answered after the fact.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

use lodestone_tracker::cause::CauseChain;
use lodestone_tracker::commit::CompletionReport;
use lodestone_tracker::phase::PhaseState;
use lodestone_tracker::transaction::{RejectReason, TransactionId};
use lodestone_world::mutation::{MutationKind, MutationTarget};

use crate::journal::{ChangeJournal, CommittedChange};

// ---------------------------------------------------------------------------
// TickRecord
// ---------------------------------------------------------------------------

/// What happened to world state during one tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickRecord {
    pub tick: u64,
    /// Names of the phases that completed, in completion order.
    pub phases: Vec<String>,
    pub applied: usize,
    /// Every rejected transaction, whatever the reason.
    pub rejected: usize,
    /// Rejected by an observer veto.
    pub vetoed: usize,
    /// Rejected because an effect aborted.
    pub aborted: usize,
    /// Rejected because the cascade limit was hit.
    pub cascade_limited: usize,
    pub journal: ChangeJournal,
}

impl TickRecord {
    pub fn new(tick: u64) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    /// Fold one completed phase into the record.
    pub fn absorb(&mut self, report: &CompletionReport) {
        self.phases.push(report.state.name().to_owned());
        self.applied += self.journal.record_report(self.tick, report);
        for id in &report.rejected {
            self.rejected += 1;
            let reason = report
                .transaction(*id)
                .and_then(|t| t.reject_reason.as_ref());
            match reason {
                Some(RejectReason::Vetoed) => self.vetoed += 1,
                Some(RejectReason::Aborted { .. }) => self.aborted += 1,
                Some(RejectReason::CascadeLimit) => self.cascade_limited += 1,
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CausalTrail
// ---------------------------------------------------------------------------

/// One committed change in a [`CausalTrail`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailStep {
    pub tick: u64,
    pub phase: PhaseState,
    pub transaction: TransactionId,
    pub kind: MutationKind,
    pub after: serde_json::Value,
    pub cause: CauseChain,
    pub description: String,
}

impl From<&CommittedChange> for TrailStep {
    fn from(change: &CommittedChange) -> Self {
        Self {
            tick: change.tick,
            phase: change.phase,
            transaction: change.transaction,
            kind: change.kind.clone(),
            after: change.after.clone(),
            cause: change.cause.clone(),
            description: change.describe(),
        }
    }
}

/// Every retained change to one target, from most recent to oldest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalTrail {
    pub target: MutationTarget,
    pub steps: Vec<TrailStep>,
}

impl CausalTrail {
    pub fn latest(&self) -> Option<&TrailStep> {
        self.steps.first()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

// ---------------------------------------------------------------------------
// EventHistory
// ---------------------------------------------------------------------------

/// Rolling window of [`TickRecord`]s plus the record being built.
#[derive(Debug, Clone)]
pub struct EventHistory {
    current: TickRecord,
    history: VecDeque<TickRecord>,
    max_history: usize,
}

impl EventHistory {
    /// History of the default size (60 ticks).
    pub fn new() -> Self {
        Self::with_max_history(60)
    }

    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            current: TickRecord::default(),
            history: VecDeque::new(),
            max_history,
        }
    }

    /// Start recording `tick`. Anything recorded since the last
    /// [`end_tick`](Self::end_tick) is discarded.
    pub fn begin_tick(&mut self, tick: u64) {
        self.current = TickRecord::new(tick);
    }

    pub fn record_report(&mut self, report: &CompletionReport) {
        self.current.absorb(report);
    }

    /// Seal the current record and push it to the history, trimming the
    /// oldest records beyond the window.
    pub fn end_tick(&mut self) -> TickRecord {
        let record = std::mem::take(&mut self.current);
        trace!(
            tick = record.tick,
            phases = record.phases.len(),
            applied = record.applied,
            rejected = record.rejected,
            "tick recorded"
        );
        self.current.tick = record.tick + 1;
        self.history.push_back(record.clone());
        while self.history.len() > self.max_history {
            self.history.pop_front();
        }
        record
    }

    /// The record being built for the current tick.
    pub fn current(&self) -> &TickRecord {
        &self.current
    }

    pub fn history(&self) -> &VecDeque<TickRecord> {
        &self.history
    }

    /// A sealed record, if it is still inside the window.
    pub fn record_at_tick(&self, tick: u64) -> Option<&TickRecord> {
        self.history.iter().find(|r| r.tick == tick)
    }

    /// Every retained change to `target`, most recent first.
    pub fn build_trail(&self, target: &MutationTarget) -> CausalTrail {
        let records = std::iter::once(&self.current).chain(self.history.iter().rev());
        let mut steps = Vec::new();
        for record in records {
            let mut in_tick: Vec<TrailStep> = record
                .journal
                .changes_for_target(target)
                .map(TrailStep::from)
                .collect();
            in_tick.reverse();
            steps.extend(in_tick);
        }
        CausalTrail {
            target: target.clone(),
            steps,
        }
    }

    /// Applied, rejected and vetoed counts summed over the window.
    pub fn totals(&self) -> (usize, usize, usize) {
        self.history.iter().fold((0, 0, 0), |(a, r, v), rec| {
            (a + rec.applied, r + rec.rejected, v + rec.vetoed)
        })
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
