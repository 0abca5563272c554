//! The tracking context: everything the tick thread needs to attribute,
//! resolve, and commit world mutations.
//!
//! A [`TrackingContext`] owns the cause stack, the phase stack, the effect
//! pipelines, the world, and the observer. There is no global instance; the
//! tick loop owns one and passes `&mut` to every system it runs.
//!
//! # Phases
//!
//! [`TrackingContext::enter`] pushes a phase and returns a [`PhaseHandle`].
//! The handle completes the phase when it is dropped or explicitly
//! [`finish`](PhaseHandle::finish)ed. Entering a phase also opens a cause
//! frame with the phase's source cause on top, so that everything proposed
//! inside is attributed to it; the frame closes when the phase exits.
//!
//! The lower-level [`begin`](TrackingContext::begin) /
//! [`exit`](TrackingContext::exit) pair exists for hosts that cannot keep a
//! borrow alive across the phase. Misuse of it (exiting twice, exiting out of
//! order, leaving a phase open at the end of a tick) is reported and
//! repaired rather than panicking.

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, trace};

use lodestone_world::block::{BlockPos, BlockState};
use lodestone_world::mutation::{Mutation, MutationTarget};
use lodestone_world::world::WorldState;

use crate::cause::{Cause, CauseChain, CauseStack, ContextKey, FrameId};
use crate::commit::{self, CompletionReport};
use crate::context::{PhaseContext, PhaseContextBuilder, PhaseId};
use crate::diagnostics::Diagnostics;
use crate::effect::PipelineRegistry;
use crate::event::{EventObserver, NullObserver};
use crate::phase::PhaseState;
use crate::thread::ThreadAffinity;
use crate::tracker::PhaseTracker;
use crate::transaction::{Attribution, TransactionId};
use crate::{TrackerConfig, TrackerError};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`TrackingContext`].
pub struct TrackingContextBuilder {
    world: Box<dyn WorldState>,
    observer: Box<dyn EventObserver>,
    pipelines: PipelineRegistry,
    config: TrackerConfig,
    root: Cause,
}

impl TrackingContextBuilder {
    /// Where events go. Defaults to [`NullObserver`].
    pub fn observer(mut self, observer: impl EventObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    /// Effect pipelines run during completion. Defaults to none.
    pub fn pipelines(mut self, pipelines: PipelineRegistry) -> Self {
        self.pipelines = pipelines;
        self
    }

    /// Limits and buffer sizes. Defaults to [`TrackerConfig::default`].
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Permanent bottom entry of the cause stack. Defaults to
    /// [`Cause::Server`].
    pub fn root_cause(mut self, root: Cause) -> Self {
        self.root = root;
        self
    }

    /// Build the context, bound to the calling thread.
    pub fn build(self) -> TrackingContext {
        TrackingContext {
            causes: CauseStack::with_root(self.root),
            phases: PhaseTracker::new(),
            pipelines: Arc::new(self.pipelines),
            world: self.world,
            observer: self.observer,
            diagnostics: Diagnostics::new(self.config.diagnostic_history),
            config: self.config,
            affinity: ThreadAffinity::current(),
            reports: Vec::new(),
            fatal: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TrackingContext
// ---------------------------------------------------------------------------

/// Owner of all tracking state for one simulation thread.
pub struct TrackingContext {
    pub(crate) causes: CauseStack,
    pub(crate) phases: PhaseTracker,
    pub(crate) pipelines: Arc<PipelineRegistry>,
    pub(crate) world: Box<dyn WorldState>,
    pub(crate) observer: Box<dyn EventObserver>,
    pub(crate) config: TrackerConfig,
    pub(crate) affinity: ThreadAffinity,
    diagnostics: Diagnostics,
    /// Reports of phases completed by a guard drop or by repair.
    reports: Vec<CompletionReport>,
    fatal: Option<TrackerError>,
}

impl TrackingContext {
    /// Start building a context around `world`.
    pub fn builder(world: impl WorldState + 'static) -> TrackingContextBuilder {
        TrackingContextBuilder {
            world: Box::new(world),
            observer: Box::new(NullObserver),
            pipelines: PipelineRegistry::new(),
            config: TrackerConfig::default(),
            root: Cause::Server,
        }
    }

    // -- phases -------------------------------------------------------------

    /// Enter a phase. It completes when the returned handle drops.
    pub fn enter(
        &mut self,
        state: PhaseState,
        builder: PhaseContextBuilder,
    ) -> Result<PhaseHandle<'_>, TrackerError> {
        let id = self.begin(state, builder)?;
        Ok(PhaseHandle {
            tc: self,
            id,
            exited: false,
        })
    }

    /// Enter a phase without a guard. Pair with [`exit`](Self::exit).
    pub fn begin(
        &mut self,
        state: PhaseState,
        builder: PhaseContextBuilder,
    ) -> Result<PhaseId, TrackerError> {
        self.affinity.check("enter").map_err(|e| self.report(e))?;
        let id = self.phases.next_id();
        let mut context = builder.build(id, state).map_err(|e| self.report(e))?;

        let frame = self.causes.open_frame().map_err(|e| self.report(e))?;
        self.causes
            .push_cause(context.source().clone())
            .map_err(|e| self.report(e))?;
        for (key, value) in phase_context_values(&context) {
            self.causes
                .add_context(key, value)
                .map_err(|e| self.report(e))?;
        }
        context.frame = Some(frame);

        self.phases.push(context);
        debug!(phase = state.name(), id = %id, depth = self.phases.depth(), "phase entered");
        Ok(id)
    }

    /// Complete and pop phase `id`.
    ///
    /// Exiting a phase that is not open (usually: exiting it twice) is
    /// reported and changes nothing. Exiting a phase with phases still open
    /// above it completes those first.
    pub fn exit(&mut self, id: PhaseId) -> Result<CompletionReport, TrackerError> {
        self.affinity.check("exit").map_err(|e| self.report(e))?;
        let Some(position) = self.phases.position(id) else {
            return Err(self.report(TrackerError::UnknownPhase { phase: id.raw() }));
        };
        let above = self.phases.depth() - position - 1;
        if above > 0 {
            self.report(TrackerError::OutOfOrderExit {
                phase: id.raw(),
                above,
            });
            self.complete_above(id);
        }
        self.finish_top(id)
    }

    /// Complete every phase still open, innermost first. Called by the tick
    /// loop at the end of every tick.
    pub fn unwind_all(&mut self) -> Vec<CompletionReport> {
        let mut reports = Vec::new();
        while let Some(top) = self.phases.top() {
            let (id, name) = (top.id(), top.state().name());
            self.report(TrackerError::LeakedPhase {
                phase: name.to_owned(),
            });
            if let Ok(report) = self.finish_top(id) {
                reports.push(report);
            }
        }
        reports
    }

    /// Complete and pop every phase above `id`.
    fn complete_above(&mut self, id: PhaseId) {
        while let Some(top) = self.phases.top().map(PhaseContext::id).filter(|t| *t != id) {
            if let Ok(report) = self.finish_top(top) {
                self.reports.push(report);
            }
        }
    }

    /// Complete `id`, which must be the top phase, then pop it and close its
    /// cause frame.
    fn finish_top(&mut self, id: PhaseId) -> Result<CompletionReport, TrackerError> {
        let result = commit::complete(self, id);

        // An effect may have begun a phase and never exited it.
        while let Some(top) = self.phases.top().filter(|t| t.id() != id) {
            let (leaked, name) = (top.id(), top.state().name());
            self.report(TrackerError::LeakedPhase {
                phase: name.to_owned(),
            });
            if let Ok(report) = self.finish_top(leaked) {
                self.reports.push(report);
            }
        }

        if let Some(frame) = self.phases.pop().and_then(|c| c.frame) {
            if let Err(e) = self.causes.close_frame(frame) {
                self.report(e);
            }
        }
        trace!(id = %id, depth = self.phases.depth(), "phase exited");
        result
    }

    /// The current phase context, if any.
    pub fn current_context(&self) -> Option<&PhaseContext> {
        self.phases.top()
    }

    /// The phase stack.
    pub fn phases(&self) -> &PhaseTracker {
        &self.phases
    }

    /// Whether no phase is open.
    pub fn is_idle(&self) -> bool {
        self.phases.is_idle()
    }

    /// Number of open phases.
    pub fn phase_depth(&self) -> usize {
        self.phases.depth()
    }

    // -- proposals ----------------------------------------------------------

    /// Propose a mutation to the current phase.
    ///
    /// With no phase open the mutation is dropped and
    /// [`TrackerError::ProposeWhileIdle`] is returned.
    pub fn propose(&mut self, mutation: Mutation) -> Result<TransactionId, TrackerError> {
        self.affinity.check("propose").map_err(|e| self.report(e))?;
        let Some(current) = self.phases.top().map(PhaseContext::id) else {
            return Err(self.report(TrackerError::ProposeWhileIdle {
                kind: mutation.kind.to_string(),
                target: mutation.target.to_string(),
            }));
        };
        self.propose_to(current, mutation)
    }

    /// Propose a mutation to phase `phase`, which must be the current one.
    pub fn propose_to(
        &mut self,
        phase: PhaseId,
        mut mutation: Mutation,
    ) -> Result<TransactionId, TrackerError> {
        self.affinity.check("propose").map_err(|e| self.report(e))?;
        let Some(current) = self.phases.top().map(PhaseContext::id) else {
            return Err(self.report(TrackerError::ProposeWhileIdle {
                kind: mutation.kind.to_string(),
                target: mutation.target.to_string(),
            }));
        };
        if self.phases.get(phase).is_none() {
            return Err(self.report(TrackerError::ProposeAfterCompletion { phase: phase.raw() }));
        }

        mutation.before =
            commit::project(self, None, &mutation.target).unwrap_or(serde_json::Value::Null);
        let attribution = Attribution {
            cause: self.causes.current_cause(),
            context: self.causes.context_snapshot(),
        };
        let result = match self.phases.get_mut(phase) {
            Some(context) => context.propose(mutation, attribution, current),
            None => Err(TrackerError::UnknownPhase { phase: phase.raw() }),
        };
        result.map_err(|e| self.report(e))
    }

    /// State `target` will have once every open phase commits: the latest
    /// pending proposal from the innermost phase out, then the live world.
    pub fn projected(&self, target: &MutationTarget) -> Option<serde_json::Value> {
        commit::project(self, None, target)
    }

    /// Projected block at `pos`.
    pub fn projected_block(&self, pos: BlockPos) -> BlockState {
        self.projected(&MutationTarget::Block(pos))
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(BlockState::AIR)
    }

    /// Apply a mutation directly, bypassing tracking. Only allowed while idle
    /// (world setup, chunk loading outside of any phase).
    pub fn apply_untracked(&mut self, mutation: &Mutation) -> Result<(), TrackerError> {
        self.affinity
            .check("apply_untracked")
            .map_err(|e| self.report(e))?;
        if let Some(top) = self.phases.top() {
            let phase = top.state().name();
            return Err(self.report(TrackerError::UntrackedWhileActive {
                kind: mutation.kind.to_string(),
                phase,
            }));
        }
        self.world
            .apply(mutation)
            .map_err(|source| TrackerError::WorldApply {
                kind: mutation.kind.to_string(),
                target: mutation.target.to_string(),
                source,
            })
    }

    // -- causes -------------------------------------------------------------

    /// The cause stack.
    pub fn causes(&self) -> &CauseStack {
        &self.causes
    }

    /// Push `cause` on top of the cause stack.
    pub fn push_cause(&mut self, cause: Cause) -> Result<(), TrackerError> {
        self.causes.push_cause(cause).map_err(|e| self.report(e))
    }

    /// Pop the most recent cause. Never pops below the innermost open frame.
    pub fn pop_cause(&mut self) -> Result<Cause, TrackerError> {
        self.causes.pop_cause().map_err(|e| self.report(e))
    }

    /// Open a cause frame. Close it with [`close_frame`](Self::close_frame).
    pub fn open_frame(&mut self) -> Result<FrameId, TrackerError> {
        self.causes.open_frame().map_err(|e| self.report(e))
    }

    /// Close `frame`, dropping the causes and context pushed inside it.
    ///
    /// Inner frames still open are closed too, and reported as
    /// [`TrackerError::FrameOutOfOrder`].
    pub fn close_frame(&mut self, frame: FrameId) -> Result<(), TrackerError> {
        self.causes.close_frame(frame).map_err(|e| self.report(e))
    }

    /// Open a cause frame that closes when the guard drops. The guard
    /// dereferences to this context, so phases can be entered inside it.
    pub fn push_frame(&mut self) -> Result<CauseFrame<'_>, TrackerError> {
        let id = self.open_frame()?;
        Ok(CauseFrame { tc: self, id })
    }

    /// Set `key` until the innermost open frame closes. Returns the value it
    /// replaced.
    pub fn add_context(
        &mut self,
        key: ContextKey,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, TrackerError> {
        self.causes.add_context(key, value).map_err(|e| self.report(e))
    }

    /// The current value of `key`.
    pub fn context(&self, key: &ContextKey) -> Option<&serde_json::Value> {
        self.causes.context(key)
    }

    /// Snapshot of every cause on the stack, oldest first.
    pub fn current_cause(&self) -> CauseChain {
        self.causes.current_cause()
    }

    // -- collaborators ------------------------------------------------------

    /// The live world.
    pub fn world(&self) -> &dyn WorldState {
        &*self.world
    }

    /// The live world as its concrete type.
    pub fn world_as<W: Any>(&self) -> Option<&W> {
        self.world.as_any().downcast_ref::<W>()
    }

    /// Replace the observer that receives mutation events.
    pub fn set_observer(&mut self, observer: impl EventObserver + 'static) {
        self.observer = Box::new(observer);
    }

    /// The registered effect pipelines.
    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    /// Mutable pipelines. Phases completing right now keep the pipelines they
    /// started with.
    pub fn pipelines_mut(&mut self) -> &mut PipelineRegistry {
        Arc::make_mut(&mut self.pipelines)
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // -- diagnostics and lifecycle ------------------------------------------

    /// Misuse reports recorded so far.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Mutable diagnostics, for clearing between test cases.
    pub fn diagnostics_mut(&mut self) -> &mut Diagnostics {
        &mut self.diagnostics
    }

    /// Record `error` with the current phase stack and hand it back.
    pub(crate) fn report(&mut self, error: TrackerError) -> TrackerError {
        self.diagnostics.report(&error, self.phases.render());
        error
    }

    /// Record a fatal error. The tick loop aborts the tick when it sees it.
    pub(crate) fn poison(&mut self, error: TrackerError) -> TrackerError {
        let error = self.report(error);
        self.fatal = Some(error.clone());
        error
    }

    /// Whether a fatal error is waiting in [`take_fatal`](Self::take_fatal).
    pub fn is_poisoned(&self) -> bool {
        self.fatal.is_some()
    }

    /// Take the fatal error, if one occurred, clearing the poisoned state.
    pub fn take_fatal(&mut self) -> Option<TrackerError> {
        self.fatal.take()
    }

    /// Reports of phases completed by guard drops and stack repair since the
    /// last call.
    pub fn drain_reports(&mut self) -> Vec<CompletionReport> {
        std::mem::take(&mut self.reports)
    }

    /// Move ownership of the whole context to the calling thread.
    pub fn rebind_thread(&mut self) {
        self.affinity.rebind();
        self.causes.rebind_thread();
    }
}

/// Context values every phase publishes for its duration.
fn phase_context_values(context: &PhaseContext) -> Vec<(ContextKey, serde_json::Value)> {
    let extras = context.extras();
    let mut values = BTreeMap::new();
    values.insert(ContextKey::PHASE, json!(context.state().name()));
    if let Some(player) = &extras.player {
        values.insert(ContextKey::PLAYER, json!(player.to_string()));
    }
    if let Some(line) = &extras.command {
        values.insert(ContextKey::COMMAND, json!(line));
    }
    if let Some(pos) = extras.notifier {
        values.insert(ContextKey::NOTIFIER, json!(pos));
    }
    values.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Scoped phase. Dereferences to the [`TrackingContext`]; exits the phase on
/// drop.
///
/// Reports of phases completed by drop are collected by
/// [`TrackingContext::drain_reports`]; [`finish`](Self::finish) returns the
/// report directly instead.
pub struct PhaseHandle<'a> {
    tc: &'a mut TrackingContext,
    id: PhaseId,
    exited: bool,
}

impl PhaseHandle<'_> {
    /// Identity of the phase this handle guards.
    pub fn id(&self) -> PhaseId {
        self.id
    }

    /// Propose a mutation to this phase.
    pub fn propose(&mut self, mutation: Mutation) -> Result<TransactionId, TrackerError> {
        self.tc.propose_to(self.id, mutation)
    }

    /// Exit the phase now. A second call is reported and does nothing.
    pub fn exit(&mut self) -> Result<CompletionReport, TrackerError> {
        if self.exited {
            return Err(self
                .tc
                .report(TrackerError::UnknownPhase { phase: self.id.raw() }));
        }
        self.exited = true;
        self.tc.exit(self.id)
    }

    /// Exit the phase and return its report.
    pub fn finish(mut self) -> Result<CompletionReport, TrackerError> {
        self.exit()
    }
}

impl Deref for PhaseHandle<'_> {
    type Target = TrackingContext;

    fn deref(&self) -> &TrackingContext {
        self.tc
    }
}

impl DerefMut for PhaseHandle<'_> {
    fn deref_mut(&mut self) -> &mut TrackingContext {
        self.tc
    }
}

impl Drop for PhaseHandle<'_> {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;
        if let Ok(report) = self.tc.exit(self.id) {
            self.tc.reports.push(report);
        }
    }
}

/// Scoped cause frame on a [`TrackingContext`].
pub struct CauseFrame<'a> {
    tc: &'a mut TrackingContext,
    id: FrameId,
}

impl CauseFrame<'_> {
    /// Identity of the frame this guard closes.
    pub fn id(&self) -> FrameId {
        self.id
    }
}

impl Deref for CauseFrame<'_> {
    type Target = TrackingContext;

    fn deref(&self) -> &TrackingContext {
        self.tc
    }
}

impl DerefMut for CauseFrame<'_> {
    fn deref_mut(&mut self) -> &mut TrackingContext {
        self.tc
    }
}

impl Drop for CauseFrame<'_> {
    fn drop(&mut self) {
        // Failures are already recorded in the diagnostics.
        let _ = self.tc.close_frame(self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::EffectScope;
    use crate::effect::{effect_fn, EffectResult};
    use crate::phase::{GeneralPhase, PacketPhase, PluginPhase, TickPhase};
    use crate::transaction::{RejectReason, TransactionStatus};
    use lodestone_world::prelude::*;

    fn tracking() -> TrackingContext {
        TrackingContext::builder(VoxelWorld::new(WorldConfig::default())).build()
    }

    fn block_tick() -> PhaseState {
        PhaseState::Tick(TickPhase::Block)
    }

    fn server() -> PhaseContextBuilder {
        PhaseContextBuilder::new(Cause::Server)
    }

    fn stone(x: i32) -> Mutation {
        Mutation::set_block(BlockPos::new(x, 64, 0), BlockState::STONE)
    }

    // -- 1. Enter / exit ----------------------------------------------------

    #[test]
    fn mutations_apply_only_on_exit() {
        let mut tc = tracking();
        let pos = BlockPos::new(0, 64, 0);
        let report = {
            let mut phase = tc.enter(block_tick(), server()).unwrap();
            phase.propose(stone(0)).unwrap();
            assert_eq!(phase.world().block(pos), BlockState::AIR);
            phase.finish().unwrap()
        };
        assert_eq!(tc.world().block(pos), BlockState::STONE);
        assert_eq!(report.applied.len(), 1);
        assert!(tc.is_idle());
        assert!(tc.diagnostics().is_empty());
    }

    #[test]
    fn dropped_handle_reports_through_drain() {
        let mut tc = tracking();
        {
            let mut phase = tc.enter(block_tick(), server()).unwrap();
            phase.propose(stone(0)).unwrap();
        }
        let reports = tc.drain_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].state, block_tick());
        assert!(tc.drain_reports().is_empty());
    }

    #[test]
    fn second_exit_is_a_reported_no_op() {
        let mut tc = tracking();
        let mut phase = tc.enter(block_tick(), server()).unwrap();
        phase.propose(stone(0)).unwrap();
        assert!(phase.exit().is_ok());
        let hash = phase.world().state_hash();

        assert!(matches!(phase.exit(), Err(TrackerError::UnknownPhase { .. })));
        assert_eq!(phase.world().state_hash(), hash);
        drop(phase);
        assert_eq!(tc.diagnostics().total(), 1);
        assert!(tc.drain_reports().is_empty());
    }

    #[test]
    fn raw_exit_twice_is_reported() {
        let mut tc = tracking();
        let id = tc.begin(block_tick(), server()).unwrap();
        tc.exit(id).unwrap();
        assert_eq!(
            tc.exit(id).unwrap_err(),
            TrackerError::UnknownPhase { phase: id.raw() }
        );
        assert_eq!(tc.diagnostics().last().unwrap().phase_stack, "<idle>");
    }

    #[test]
    fn out_of_order_exit_completes_inner_first() {
        let mut tc = tracking();
        let outer = tc.begin(block_tick(), server()).unwrap();
        tc.propose(stone(0)).unwrap();
        let _inner = tc
            .begin(PhaseState::Plugin(PluginPhase::Listener), server())
            .unwrap();
        tc.propose(stone(1)).unwrap();

        let report = tc.exit(outer).unwrap();
        assert_eq!(report.phase, outer);
        assert!(tc.is_idle());
        assert_eq!(tc.causes().depth(), 1);
        assert_eq!(tc.drain_reports().len(), 1);
        assert!(matches!(
            tc.diagnostics().last().unwrap().error,
            TrackerError::OutOfOrderExit { above: 1, .. }
        ));
        assert_eq!(tc.world().block(BlockPos::new(1, 64, 0)), BlockState::STONE);
    }

    #[test]
    fn unwind_all_completes_leaked_phases() {
        let mut tc = tracking();
        tc.begin(block_tick(), server()).unwrap();
        tc.propose(stone(0)).unwrap();
        tc.begin(PhaseState::Tick(TickPhase::Entity), server()).unwrap();

        let reports = tc.unwind_all();
        assert_eq!(reports.len(), 2);
        assert!(tc.is_idle());
        assert_eq!(tc.world().block(BlockPos::new(0, 64, 0)), BlockState::STONE);
        assert_eq!(tc.diagnostics().total(), 2);
    }

    // -- 2. Proposal rules --------------------------------------------------

    #[test]
    fn propose_while_idle_is_dropped() {
        let mut tc = tracking();
        let err = tc.propose(stone(0)).unwrap_err();
        assert!(matches!(err, TrackerError::ProposeWhileIdle { .. }));
        assert_eq!(tc.world().block(BlockPos::new(0, 64, 0)), BlockState::AIR);
        assert_eq!(tc.diagnostics().total(), 1);
    }

    #[test]
    fn outer_phase_is_inactive_while_nested_phase_runs() {
        let mut tc = tracking();
        let outer = tc.begin(block_tick(), server()).unwrap();
        let inner = tc
            .begin(PhaseState::Tick(TickPhase::Entity), server())
            .unwrap();
        let err = tc.propose_to(outer, stone(0)).unwrap_err();
        assert_eq!(
            err,
            TrackerError::InactiveContext {
                phase: outer.raw(),
                current: inner.raw()
            }
        );
        tc.exit(inner).unwrap();
        assert!(tc.propose_to(outer, stone(0)).is_ok());
        tc.exit(outer).unwrap();
    }

    #[test]
    fn propose_to_exited_phase_fails() {
        let mut tc = tracking();
        let first = tc.begin(block_tick(), server()).unwrap();
        tc.exit(first).unwrap();
        tc.begin(block_tick(), server()).unwrap();
        assert_eq!(
            tc.propose_to(first, stone(0)).unwrap_err(),
            TrackerError::ProposeAfterCompletion { phase: first.raw() }
        );
        tc.unwind_all();
    }

    #[test]
    fn missing_extra_prevents_entry() {
        let mut tc = tracking();
        let err = tc
            .enter(PhaseState::Packet(PacketPhase::BreakBlock), server())
            .err()
            .unwrap();
        assert!(matches!(err, TrackerError::MissingExtra { .. }));
        assert!(tc.is_idle());
        assert_eq!(tc.causes().depth(), 1);
    }

    #[test]
    fn untracked_apply_only_while_idle() {
        let mut tc = tracking();
        tc.apply_untracked(&stone(0)).unwrap();
        assert_eq!(tc.world().block(BlockPos::new(0, 64, 0)), BlockState::STONE);

        let mut phase = tc.enter(block_tick(), server()).unwrap();
        assert!(matches!(
            phase.apply_untracked(&stone(1)),
            Err(TrackerError::UntrackedWhileActive {
                phase: "tick.block",
                ..
            })
        ));
    }

    #[test]
    fn projection_sees_pending_proposals_of_every_open_phase() {
        let mut tc = tracking();
        let pos = BlockPos::new(0, 64, 0);
        let outer = tc.begin(block_tick(), server()).unwrap();
        tc.propose(stone(0)).unwrap();
        assert_eq!(tc.projected_block(pos), BlockState::STONE);
        assert_eq!(tc.world().block(pos), BlockState::AIR);

        let inner = tc
            .begin(PhaseState::Tick(TickPhase::Entity), server())
            .unwrap();
        assert_eq!(tc.projected_block(pos), BlockState::STONE);
        tc.propose(Mutation::set_block(pos, BlockState::DIRT)).unwrap();
        assert_eq!(tc.projected_block(pos), BlockState::DIRT);

        tc.exit(inner).unwrap();
        tc.exit(outer).unwrap();
        assert_eq!(tc.projected_block(pos), BlockState::STONE);
    }

    // -- 3. Attribution -----------------------------------------------------

    #[test]
    fn phase_source_is_on_the_cause_stack_while_open() {
        let mut tc = tracking();
        let plugin = Cause::Plugin("worldedit".to_owned());
        {
            let phase = tc
                .enter(
                    PhaseState::General(GeneralPhase::Command),
                    PhaseContextBuilder::new(plugin.clone()).command("//set stone"),
                )
                .unwrap();
            assert_eq!(phase.current_cause().most_recent(), Some(&plugin));
            assert_eq!(phase.context(&ContextKey::COMMAND), Some(&json!("//set stone")));
        }
        assert_eq!(tc.current_cause().len(), 1);
        assert!(tc.context(&ContextKey::COMMAND).is_none());
    }

    #[test]
    fn cause_frame_guard_scopes_pushes() {
        let mut tc = tracking();
        {
            let mut frame = tc.push_frame().unwrap();
            frame.push_cause(Cause::Custom("redstone".into())).unwrap();
            assert_eq!(frame.causes().depth(), 2);
        }
        assert_eq!(tc.causes().depth(), 1);
        assert!(matches!(
            tc.pop_cause(),
            Err(TrackerError::ImbalancedStack { .. })
        ));
    }

    // -- 4. Commit ----------------------------------------------------------

    #[test]
    fn abort_rejects_without_event() {
        let mut registry = PipelineRegistry::new();
        registry.register(
            MutationKind::BLOCK_SET,
            effect_fn("refuse", |_: &mut EffectScope<'_>| EffectResult::Abort),
        );
        let posted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&posted);
        let mut tc = TrackingContext::builder(VoxelWorld::new(WorldConfig::default()))
            .pipelines(registry)
            .observer(move |_: &crate::event::MutationEvent| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                false
            })
            .build();

        let report = {
            let mut phase = tc.enter(block_tick(), server()).unwrap();
            let id = phase.propose(stone(0)).unwrap();
            let report = phase.finish().unwrap();
            assert_eq!(report.log.status(id), Some(TransactionStatus::Rejected));
            assert_eq!(
                report.log.get(id).unwrap().reject_reason,
                Some(RejectReason::Aborted {
                    effect: "refuse".into()
                })
            );
            report
        };
        assert!(report.applied.is_empty());
        assert_eq!(posted.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(tc.world_as::<VoxelWorld>().unwrap().block_count(), 0);
    }

    #[test]
    fn world_failure_poisons_the_context() {
        let mut tc = tracking();
        {
            let mut phase = tc.enter(block_tick(), server()).unwrap();
            phase
                .propose(Mutation::set_block(BlockPos::new(0, 999, 0), BlockState::STONE))
                .unwrap();
            assert!(matches!(
                phase.finish(),
                Err(TrackerError::WorldApply { .. })
            ));
        }
        assert!(tc.is_poisoned());
        assert!(tc.take_fatal().unwrap().is_fatal());
        assert!(!tc.is_poisoned());
        assert!(tc.is_idle());
    }

    #[test]
    fn projected_before_state_sees_earlier_proposals() {
        let mut tc = tracking();
        let mut phase = tc.enter(block_tick(), server()).unwrap();
        phase.propose(stone(0)).unwrap();
        let second = phase
            .propose(Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::DIRT))
            .unwrap();
        let report = phase.finish().unwrap();
        assert_eq!(
            report.log.get(second).unwrap().mutation.before_block(),
            Some(BlockState::STONE)
        );
    }

    // -- 5. Threads ---------------------------------------------------------

    #[test]
    fn foreign_thread_is_refused_until_rebound() {
        let mut tc = tracking();
        let mut tc = std::thread::spawn(move || {
            assert!(matches!(
                tc.begin(block_tick(), server()),
                Err(TrackerError::WrongThread { .. })
            ));
            assert!(matches!(
                tc.push_cause(Cause::Server),
                Err(TrackerError::WrongThread { .. })
            ));
            tc
        })
        .join()
        .unwrap();
        assert!(tc.is_idle());
        assert_eq!(tc.diagnostics().total(), 2);

        let mut tc = std::thread::spawn(move || {
            tc.rebind_thread();
            let id = tc.begin(block_tick(), server()).unwrap();
            tc.exit(id).unwrap();
            tc
        })
        .join()
        .unwrap();
        assert!(tc.begin(block_tick(), server()).is_err());
    }
}
