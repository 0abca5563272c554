//! Journal of committed mutations with their attribution.
//!
//! The [`ChangeJournal`] records every mutation a completed phase applied to
//! the world. Each entry ([`CommittedChange`]) captures the target, kind,
//! pre- and post-state, and the cause chain captured when the mutation was
//! proposed, together with the phase and tick it committed in.
//!
//! Entries are appended from [`CompletionReport`]s via
//! [`ChangeJournal::record_report`], so they come out in application order.
//! Rejected transactions never reach the journal.
//!
//! # Query API
//!
//! - **Target**: [`ChangeJournal::changes_for_target`]
//! - **Mutation kind**: [`ChangeJournal::changes_of_kind`]
//! - **Cause**: [`ChangeJournal::changes_caused_by`] (anywhere in the chain)
//! - **Player**: [`ChangeJournal::changes_by_player`]
//!
//! # Example
//!
//! ```
//! use lodestone_events::journal::ChangeJournal;
//! use lodestone_tracker::prelude::*;
//! use lodestone_world::prelude::*;
//!
//! let mut tracking = TrackingContext::builder(VoxelWorld::default()).build();
//! let pos = BlockPos::new(0, 64, 0);
//! let report = {
//!     let mut phase = tracking
//!         .enter(PhaseState::Tick(TickPhase::Block), PhaseContextBuilder::new(Cause::Server))
//!         .unwrap();
//!     phase.propose(Mutation::set_block(pos, BlockState::STONE)).unwrap();
//!     phase.finish().unwrap()
//! };
//!
//! let mut journal = ChangeJournal::new();
//! journal.record_report(1, &report);
//! assert_eq!(journal.changes_for_target(&MutationTarget::Block(pos)).count(), 1);
//! ```

use serde::{Deserialize, Serialize};

use lodestone_tracker::cause::{Cause, CauseChain};
use lodestone_tracker::commit::CompletionReport;
use lodestone_tracker::context::PhaseId;
use lodestone_tracker::phase::PhaseState;
use lodestone_tracker::transaction::{Transaction, TransactionId};
use lodestone_world::entity::EntityId;
use lodestone_world::mutation::{MutationKind, MutationTarget};

// ---------------------------------------------------------------------------
// CommittedChange
// ---------------------------------------------------------------------------

/// One mutation that was applied to the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedChange {
    /// Tick the owning phase completed in.
    pub tick: u64,
    pub phase: PhaseState,
    pub phase_id: PhaseId,
    /// Id within the phase's log. Only unique together with `phase_id`.
    pub transaction: TransactionId,
    pub kind: MutationKind,
    pub target: MutationTarget,
    /// Projected state of the target when the mutation was proposed.
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    /// Cause stack at proposal time, oldest first.
    pub cause: CauseChain,
    /// 0 for mutations proposed directly under the phase.
    pub cascade_depth: usize,
}

impl CommittedChange {
    /// Build an entry for a transaction of the phase `report` describes.
    pub fn from_transaction(tick: u64, report: &CompletionReport, transaction: &Transaction) -> Self {
        let mutation = &transaction.mutation;
        Self {
            tick,
            phase: report.state,
            phase_id: report.phase,
            transaction: transaction.id,
            kind: mutation.kind.clone(),
            target: mutation.target.clone(),
            before: mutation.before.clone(),
            after: mutation.after.clone(),
            cause: transaction.cause().clone(),
            cascade_depth: transaction.depth,
        }
    }

    /// One-line human-readable summary.
    pub fn describe(&self) -> String {
        format!(
            "tick {} {} {} {} on {} ({} -> {}) by {}",
            self.tick,
            self.phase,
            self.transaction,
            self.kind,
            self.target,
            self.before,
            self.after,
            self.cause,
        )
    }
}

// ---------------------------------------------------------------------------
// ChangeJournal
// ---------------------------------------------------------------------------

/// Accumulates [`CommittedChange`] entries and answers queries over them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeJournal {
    changes: Vec<CommittedChange>,
}

impl ChangeJournal {
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    pub fn record_change(&mut self, change: CommittedChange) {
        self.changes.push(change);
    }

    /// Record every applied transaction of `report`, in application order.
    /// Returns how many entries were added.
    pub fn record_report(&mut self, tick: u64, report: &CompletionReport) -> usize {
        let before = self.changes.len();
        for id in &report.applied {
            if let Some(transaction) = report.transaction(*id) {
                self.changes
                    .push(CommittedChange::from_transaction(tick, report, transaction));
            }
        }
        self.changes.len() - before
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// All entries in the order they were recorded.
    pub fn all_changes(&self) -> &[CommittedChange] {
        &self.changes
    }

    pub fn changes_for_target<'a>(
        &'a self,
        target: &'a MutationTarget,
    ) -> impl Iterator<Item = &'a CommittedChange> {
        self.changes.iter().filter(move |c| c.target == *target)
    }

    pub fn changes_of_kind<'a>(
        &'a self,
        kind: &'a MutationKind,
    ) -> impl Iterator<Item = &'a CommittedChange> {
        self.changes.iter().filter(move |c| c.kind == *kind)
    }

    /// Entries whose cause chain contains `cause` at any position.
    pub fn changes_caused_by<'a>(
        &'a self,
        cause: &'a Cause,
    ) -> impl Iterator<Item = &'a CommittedChange> {
        self.changes.iter().filter(move |c| c.cause.contains(cause))
    }

    /// Entries attributed to a player, matched on the most recent player in
    /// the chain.
    pub fn changes_by_player(&self, player: EntityId) -> impl Iterator<Item = &CommittedChange> {
        self.changes
            .iter()
            .filter(move |c| c.cause.player() == Some(player))
    }

    /// The last recorded change to `target`.
    pub fn latest_for_target(&self, target: &MutationTarget) -> Option<&CommittedChange> {
        self.changes.iter().rev().find(|c| c.target == *target)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use lodestone_tracker::prelude::*;
    use lodestone_world::prelude::*;

    use super::*;

    // -- helpers ------------------------------------------------------------

    fn alex() -> Cause {
        Cause::player(EntityId::new(0, 0), "alex")
    }

    fn stone_world() -> VoxelWorld {
        let mut world = VoxelWorld::default();
        world.fill(
            BlockPos::new(0, 64, 0),
            BlockPos::new(2, 64, 0),
            BlockState::STONE,
        );
        world
    }

    /// Break `positions` as `alex`, then place one block as the server.
    fn sample_journal() -> ChangeJournal {
        let mut tc = TrackingContext::builder(stone_world()).build();
        let mut journal = ChangeJournal::new();

        let report = {
            let mut phase = tc
                .enter(
                    PhaseState::Packet(PacketPhase::BreakBlock),
                    PhaseContextBuilder::new(alex()).player(alex()),
                )
                .unwrap();
            for x in 0..3 {
                phase
                    .propose(Mutation::set_block(BlockPos::new(x, 64, 0), BlockState::AIR))
                    .unwrap();
            }
            phase.finish().unwrap()
        };
        assert_eq!(journal.record_report(7, &report), 3);

        let report = {
            let mut phase = tc
                .enter(
                    PhaseState::Tick(TickPhase::Block),
                    PhaseContextBuilder::new(Cause::Server),
                )
                .unwrap();
            phase
                .propose(Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::DIRT))
                .unwrap();
            phase
                .propose(Mutation::drop_item(
                    BlockPos::new(0, 65, 0),
                    ItemStack::new("dirt", 1),
                ))
                .unwrap();
            phase.finish().unwrap()
        };
        assert_eq!(journal.record_report(8, &report), 2);
        journal
    }

    // -- 1. recording --------------------------------------------------------

    #[test]
    fn records_applied_transactions_in_order() {
        let journal = sample_journal();
        assert_eq!(journal.len(), 5);
        let ticks: Vec<u64> = journal.all_changes().iter().map(|c| c.tick).collect();
        assert_eq!(ticks, vec![7, 7, 7, 8, 8]);
        let first = &journal.all_changes()[0];
        assert_eq!(first.phase, PhaseState::Packet(PacketPhase::BreakBlock));
        assert_eq!(first.before, serde_json::json!(BlockState::STONE));
        assert_eq!(first.after, serde_json::json!(BlockState::AIR));
    }

    #[test]
    fn rejected_transactions_are_not_recorded() {
        let mut tc = TrackingContext::builder(stone_world())
            .observer(|e: &MutationEvent| e.target == MutationTarget::Block(BlockPos::new(1, 64, 0)))
            .build();
        let report = {
            let mut phase = tc
                .enter(
                    PhaseState::Tick(TickPhase::Block),
                    PhaseContextBuilder::new(Cause::Server),
                )
                .unwrap();
            for x in 0..3 {
                phase
                    .propose(Mutation::set_block(BlockPos::new(x, 64, 0), BlockState::AIR))
                    .unwrap();
            }
            phase.finish().unwrap()
        };

        let mut journal = ChangeJournal::new();
        assert_eq!(journal.record_report(1, &report), 2);
        assert_eq!(
            journal
                .changes_for_target(&MutationTarget::Block(BlockPos::new(1, 64, 0)))
                .count(),
            0
        );
    }

    #[test]
    fn clear_empties_the_journal() {
        let mut journal = sample_journal();
        journal.clear();
        assert!(journal.is_empty());
    }

    // -- 2. queries ----------------------------------------------------------

    #[test]
    fn query_by_target_and_latest() {
        let journal = sample_journal();
        let target = MutationTarget::Block(BlockPos::new(0, 64, 0));
        assert_eq!(journal.changes_for_target(&target).count(), 2);
        let latest = journal.latest_for_target(&target).unwrap();
        assert_eq!(latest.tick, 8);
        assert_eq!(latest.after, serde_json::json!(BlockState::DIRT));
    }

    #[test]
    fn query_by_kind() {
        let journal = sample_journal();
        assert_eq!(journal.changes_of_kind(&MutationKind::BLOCK_SET).count(), 4);
        assert_eq!(journal.changes_of_kind(&MutationKind::ITEM_DROP).count(), 1);
    }

    #[test]
    fn query_by_cause_and_player() {
        let journal = sample_journal();
        assert_eq!(journal.changes_caused_by(&alex()).count(), 3);
        assert_eq!(journal.changes_by_player(EntityId::new(0, 0)).count(), 3);
        assert_eq!(journal.changes_by_player(EntityId::new(1, 0)).count(), 0);
        // The thread root is in every chain.
        assert_eq!(journal.changes_caused_by(&Cause::Server).count(), 5);
    }

    // -- 3. serialization ----------------------------------------------------

    #[test]
    fn journal_serializes_to_json() {
        let journal = sample_journal();
        let json = serde_json::to_string(&journal).unwrap();
        let back: ChangeJournal = serde_json::from_str(&json).unwrap();
        assert_eq!(back.all_changes(), journal.all_changes());
        assert!(journal.all_changes()[0].describe().contains("packet.break_block"));
    }
}
