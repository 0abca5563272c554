//! Phase completion: resolve every transaction, then apply the survivors.
//!
//! Completion runs in two passes over the phase's transaction log.
//!
//! 1. **Resolve.** Roots are taken in proposal order. For each transaction
//!    the effect pipeline of its mutation kind runs; effects may rewrite the
//!    post-state and propose children, and every child is resolved before
//!    the proposing effect gets control back. A transaction whose pipeline
//!    aborts is rejected together with its subtree and produces no event.
//!    Otherwise it is accepted and, if the phase announces its mutations, a
//!    [`MutationEvent`] is posted; a veto rejects the transaction and every
//!    descendant that had already been accepted.
//! 2. **Apply.** Accepted transactions are applied to the world depth-first,
//!    left to right. A world error here is fatal: observers have already
//!    been told the mutation happened.
//!
//! Nothing touches the world during pass 1, so a late veto never leaves a
//! half-applied phase behind.

use std::sync::Arc;

use tracing::{debug, trace};

use lodestone_world::block::{BlockPos, BlockState};
use lodestone_world::mutation::{Mutation, MutationTarget};
use lodestone_world::world::WorldState;

use crate::cause::{Cause, CauseStack};
use crate::context::PhaseId;
use crate::effect::{EffectResult, PipelineRegistry};
use crate::event::MutationEvent;
use crate::phase::{PhaseExtras, PhaseState};
use crate::tracking::TrackingContext;
use crate::transaction::{
    Attribution, RejectReason, Transaction, TransactionId, TransactionLog, TransactionStatus,
};
use crate::TrackerError;

// ---------------------------------------------------------------------------
// CompletionReport
// ---------------------------------------------------------------------------

/// What a completed phase did.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub phase: PhaseId,
    pub state: PhaseState,
    pub source: Cause,
    /// Transactions applied to the world, in application order.
    pub applied: Vec<TransactionId>,
    /// Rejected transactions, in proposal order.
    pub rejected: Vec<TransactionId>,
    /// The sealed log.
    pub log: TransactionLog,
}

impl CompletionReport {
    /// Mutations applied to the world, in application order.
    pub fn applied_mutations(&self) -> impl Iterator<Item = &Mutation> {
        self.applied
            .iter()
            .filter_map(|id| self.log.get(*id))
            .map(|t| &t.mutation)
    }

    /// Transaction `id` from the sealed log.
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.log.get(id)
    }

    /// Whether the phase proposed nothing.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

struct Resolver<'a> {
    pipelines: &'a PipelineRegistry,
    state: PhaseState,
    extras: &'a PhaseExtras,
    emits: bool,
}

/// Complete the phase `phase`. The context stays on the stack; the caller
/// pops it.
pub(crate) fn complete(
    tc: &mut TrackingContext,
    phase: PhaseId,
) -> Result<CompletionReport, TrackerError> {
    let Some(context) = tc.phases.get_mut(phase) else {
        return Err(TrackerError::UnknownPhase { phase: phase.raw() });
    };
    let state = context.state();
    let source = context.source().clone();
    let (mut log, extras) = context.take_for_completion();
    let pipelines = Arc::clone(&tc.pipelines);
    let resolver = Resolver {
        pipelines: &pipelines,
        state,
        extras: &extras,
        emits: state.emits_events(),
    };

    let mut next_root = 0;
    while let Some(root) = log.roots().get(next_root).copied() {
        resolve(tc, &mut log, &resolver, root);
        next_root += 1;
    }

    let order = log.accepted();
    let mut applied = Vec::with_capacity(order.len());
    for id in order {
        let Some(transaction) = log.get(id) else {
            continue;
        };
        let mutation = &transaction.mutation;
        if let Err(source) = tc.world.apply(mutation) {
            let error = TrackerError::WorldApply {
                kind: mutation.kind.to_string(),
                target: mutation.target.to_string(),
                source,
            };
            log.seal();
            return Err(tc.poison(error));
        }
        trace!(phase = state.name(), transaction = %id, kind = %mutation.kind, "applied");
        applied.push(id);
    }
    log.seal();

    let rejected = log.rejected();
    debug!(
        phase = state.name(),
        transactions = log.len(),
        applied = applied.len(),
        rejected = rejected.len(),
        "phase completed"
    );
    Ok(CompletionReport {
        phase,
        state,
        source,
        applied,
        rejected,
        log,
    })
}

/// Resolve one transaction and, through its effects, its whole subtree.
fn resolve(
    tc: &mut TrackingContext,
    log: &mut TransactionLog,
    resolver: &Resolver<'_>,
    id: TransactionId,
) {
    let Some(kind) = log.get(id).map(|t| t.mutation.kind.clone()) else {
        return;
    };
    log.begin(id);
    let mut aborted_by = None;
    if let Some(pipeline) = resolver.pipelines.pipeline(&kind) {
        for effect in pipeline.effects() {
            let mut scope = EffectScope {
                tc: &mut *tc,
                log: &mut *log,
                resolver,
                transaction: id,
            };
            if effect.process(&mut scope) == EffectResult::Abort {
                aborted_by = Some(effect.name().to_owned());
                break;
            }
        }
    }
    log.end(id);

    if let Some(effect) = aborted_by {
        debug!(transaction = %id, kind = %kind, effect = %effect, "transaction aborted");
        log.reject(id, RejectReason::Aborted { effect });
        return;
    }

    log.accept(id);
    if !resolver.emits {
        return;
    }
    let Some(event) = build_event(log, resolver.state, id) else {
        return;
    };
    if tc.observer.post(&event) {
        let rolled_back = log.reject(id, RejectReason::Vetoed);
        debug!(
            transaction = %id,
            kind = %kind,
            rolled_back = rolled_back.len(),
            "transaction vetoed"
        );
    }
}

fn build_event(log: &TransactionLog, state: PhaseState, id: TransactionId) -> Option<MutationEvent> {
    let t = log.get(id)?;
    Some(MutationEvent {
        transaction: id,
        phase: state,
        player_interaction: state.is_player_interaction(),
        kind: t.mutation.kind.clone(),
        target: t.mutation.target.clone(),
        before: t.mutation.before.clone(),
        after: t.mutation.after.clone(),
        cause: t.attribution.cause.clone(),
        context: t.attribution.context.clone(),
        cascade_depth: t.depth,
    })
}

/// Projected state of `target`: the latest pending proposal in `log`, then
/// in the logs still held by open phases from innermost out, then the live
/// world.
///
/// A phase being completed has already handed its log to the commit, so its
/// pending proposals are only visible when that log is passed as `log`.
pub(crate) fn project(
    tc: &TrackingContext,
    log: Option<&TransactionLog>,
    target: &MutationTarget,
) -> Option<serde_json::Value> {
    if let Some(value) = log.and_then(|l| l.projected(target)) {
        return Some(value.clone());
    }
    for context in tc.phases.iter().rev() {
        if let Some(value) = context.log().projected(target) {
            return Some(value.clone());
        }
    }
    tc.world.read(target)
}

// ---------------------------------------------------------------------------
// EffectScope
// ---------------------------------------------------------------------------

/// What an [`Effect`](crate::effect::Effect) sees while it processes a
/// transaction.
pub struct EffectScope<'a> {
    tc: &'a mut TrackingContext,
    log: &'a mut TransactionLog,
    resolver: &'a Resolver<'a>,
    transaction: TransactionId,
}

impl EffectScope<'_> {
    /// The transaction being processed.
    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    /// The mutation being processed, as rewritten by earlier effects.
    pub fn mutation(&self) -> &Mutation {
        &self.log.node(self.transaction).mutation
    }

    /// Rewrite the intended post-state.
    pub fn set_after(&mut self, after: serde_json::Value) {
        if let Some(mutation) = self.log.mutation_mut(self.transaction) {
            mutation.after = after;
        }
    }

    /// Propose a child of the current transaction and resolve it before
    /// returning.
    pub fn propose(&mut self, mut mutation: Mutation) -> Result<TransactionId, TrackerError> {
        if let Err(e) = self.tc.affinity.check("propose") {
            return Err(self.tc.report(e));
        }
        mutation.before = project(self.tc, Some(&*self.log), &mutation.target)
            .unwrap_or(serde_json::Value::Null);
        let attribution = Attribution {
            cause: self.tc.causes.current_cause(),
            context: self.tc.causes.context_snapshot(),
        };
        let child = self.log.propose(mutation, attribution)?;

        let depth = self.log.get(child).map_or(0, |t| t.depth);
        if let Some(limit) = self.tc.config.max_cascade_depth {
            if depth > limit {
                self.log.reject(child, RejectReason::CascadeLimit);
                return Err(self
                    .tc
                    .report(TrackerError::CascadeDepthExceeded { depth, limit }));
            }
        }

        resolve(self.tc, self.log, self.resolver, child);
        Ok(child)
    }

    /// Status of any transaction in the log being completed.
    pub fn status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.log.status(id)
    }

    /// Children proposed for the current transaction so far.
    pub fn children(&self) -> &[TransactionId] {
        self.log.children_of(self.transaction)
    }

    /// The log being completed.
    pub fn log(&self) -> &TransactionLog {
        self.log
    }

    /// State `target` will have once everything pending so far is applied.
    pub fn projected(&self, target: &MutationTarget) -> Option<serde_json::Value> {
        project(self.tc, Some(&*self.log), target)
    }

    /// Projected block at `pos`.
    pub fn projected_block(&self, pos: BlockPos) -> BlockState {
        self.projected(&MutationTarget::Block(pos))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(BlockState::AIR)
    }

    /// The live world, without pending changes.
    pub fn world(&self) -> &dyn WorldState {
        self.tc.world()
    }

    /// Kind of the phase being completed.
    pub fn phase(&self) -> PhaseState {
        self.resolver.state
    }

    /// Extras the phase was entered with.
    pub fn extras(&self) -> &PhaseExtras {
        self.resolver.extras
    }

    /// The live cause stack.
    pub fn causes(&self) -> &CauseStack {
        &self.tc.causes
    }

    /// Run `f` with `cause` pushed on a fresh cause frame, so that children
    /// proposed inside are attributed to it.
    pub fn with_cause<R>(&mut self, cause: Cause, f: impl FnOnce(&mut Self) -> R) -> Result<R, TrackerError> {
        let frame = self.tc.open_frame()?;
        if let Err(e) = self.tc.push_cause(cause) {
            // Closing a frame we just opened cannot fail on this thread.
            let _ = self.tc.close_frame(frame);
            return Err(e);
        }
        let result = f(self);
        self.tc.close_frame(frame)?;
        Ok(result)
    }

    /// The tracking context, for entering a nested phase. Proposals made
    /// through it go to that phase, not to this transaction.
    ///
    /// The completing phase's own pending proposals are not visible to the
    /// nested phase: its `before` values and projections read the world as
    /// committed so far.
    pub fn tracking(&mut self) -> &mut TrackingContext {
        self.tc
    }
}
