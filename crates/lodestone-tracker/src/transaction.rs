//! The transaction log: an ordered forest of proposed mutations.
//!
//! Transactions live in a flat arena and refer to each other by
//! [`TransactionId`]. A transaction proposed while another is being processed
//! (between [`TransactionLog::begin`] and [`TransactionLog::end`]) becomes
//! that transaction's child; otherwise it becomes a new root. Children are
//! therefore only ever added while their parent is in flight, and once the
//! log is sealed nothing more can be added at all.
//!
//! # Example
//!
//! ```
//! use lodestone_tracker::cause::CauseChain;
//! use lodestone_tracker::transaction::{Attribution, TransactionLog};
//! use lodestone_world::prelude::*;
//!
//! let mut log = TransactionLog::new();
//! let pos = BlockPos::new(0, 64, 0);
//! let root = log
//!     .propose(Mutation::set_block(pos, BlockState::AIR), Attribution::default())
//!     .unwrap();
//! log.begin(root);
//! let drop = log
//!     .propose(Mutation::drop_item(pos, ItemStack::new("dirt", 1)), Attribution::default())
//!     .unwrap();
//! log.end(root);
//!
//! assert_eq!(log.children_of(root), &[drop]);
//! assert_eq!(log.depth_first(), vec![root, drop]);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use lodestone_world::mutation::{Mutation, MutationTarget};

use crate::cause::{CauseChain, ContextKey};
use crate::TrackerError;

// ---------------------------------------------------------------------------
// Identifiers and status
// ---------------------------------------------------------------------------

/// Index of a transaction in its log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u32);

impl TransactionId {
    /// Position in the owning log's arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Proposed,
    Accepted,
    Rejected,
}

/// Why a transaction ended up rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// An effect in its pipeline returned `Abort`.
    Aborted { effect: String },
    /// The observer vetoed its event.
    Vetoed,
    /// An ancestor was rejected after this transaction had been accepted.
    ParentRejected { parent: TransactionId },
    /// It was proposed deeper than the configured cascade limit.
    CascadeLimit,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Who caused a proposal, captured when it was made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attribution {
    pub cause: CauseChain,
    pub context: BTreeMap<ContextKey, serde_json::Value>,
}

impl Attribution {
    /// Attribution with `cause` and no context entries.
    pub fn new(cause: CauseChain) -> Self {
        Self {
            cause,
            context: BTreeMap::new(),
        }
    }
}

/// One proposed mutation and its place in the cascade tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    pub parent: Option<TransactionId>,
    /// 0 for roots.
    pub depth: usize,
    pub mutation: Mutation,
    pub attribution: Attribution,
    pub children: Vec<TransactionId>,
    pub status: TransactionStatus,
    pub reject_reason: Option<RejectReason>,
    /// Position in the order transactions were resolved.
    pub completed_seq: Option<u64>,
}

impl Transaction {
    /// The cause chain captured when this transaction was proposed.
    pub fn cause(&self) -> &CauseChain {
        &self.attribution.cause
    }
}

// ---------------------------------------------------------------------------
// TransactionLog
// ---------------------------------------------------------------------------

/// Arena-backed forest of [`Transaction`]s for one phase.
#[derive(Debug, Clone, Default)]
pub struct TransactionLog {
    nodes: Vec<Transaction>,
    roots: Vec<TransactionId>,
    /// Transactions currently being processed, innermost last.
    processing: Vec<TransactionId>,
    next_seq: u64,
    owner: u64,
    sealed: bool,
}

impl TransactionLog {
    /// An empty, unowned log.
    pub fn new() -> Self {
        Self::default()
    }

    /// A log belonging to the phase with raw id `owner`.
    pub(crate) fn owned_by(owner: u64) -> Self {
        Self {
            owner,
            ..Self::default()
        }
    }

    // -- recording ----------------------------------------------------------

    /// Record a proposal as a child of the transaction being processed, or as
    /// a new root when none is.
    pub fn propose(
        &mut self,
        mutation: Mutation,
        attribution: Attribution,
    ) -> Result<TransactionId, TrackerError> {
        if self.sealed {
            return Err(TrackerError::ProposeAfterCompletion { phase: self.owner });
        }
        let id = TransactionId(self.nodes.len() as u32);
        let parent = self.processing.last().copied();
        let depth = match parent {
            Some(p) => self.nodes[p.index()].depth + 1,
            None => 0,
        };
        self.nodes.push(Transaction {
            id,
            parent,
            depth,
            mutation,
            attribution,
            children: Vec::new(),
            status: TransactionStatus::Proposed,
            reject_reason: None,
            completed_seq: None,
        });
        match parent {
            Some(p) => self.nodes[p.index()].children.push(id),
            None => self.roots.push(id),
        }
        Ok(id)
    }

    /// Mark `id` as being processed; proposals until the matching
    /// [`end`](Self::end) become its children.
    pub fn begin(&mut self, id: TransactionId) {
        self.processing.push(id);
    }

    /// Finish processing `id`. Anything opened after it is closed too.
    pub fn end(&mut self, id: TransactionId) {
        if let Some(at) = self.processing.iter().rposition(|p| *p == id) {
            self.processing.truncate(at);
        }
    }

    /// The transaction currently being processed.
    pub fn processing(&self) -> Option<TransactionId> {
        self.processing.last().copied()
    }

    /// Mark `id` accepted. Transactions no longer `Proposed` are left alone.
    pub fn accept(&mut self, id: TransactionId) {
        let seq = self.bump_seq();
        if let Some(node) = self.nodes.get_mut(id.index()) {
            if node.status == TransactionStatus::Proposed {
                node.status = TransactionStatus::Accepted;
                node.completed_seq = Some(seq);
            }
        }
    }

    /// Reject `id` and every descendant that is not already rejected.
    ///
    /// Descendants are rejected first, in reverse completion order, each with
    /// [`RejectReason::ParentRejected`]. Returns every transaction whose
    /// status changed, in the order it changed.
    pub fn reject(&mut self, id: TransactionId, reason: RejectReason) -> Vec<TransactionId> {
        if id.index() >= self.nodes.len() {
            return Vec::new();
        }
        let mut descendants = self.descendants(id);
        descendants.retain(|d| self.nodes[d.index()].status != TransactionStatus::Rejected);
        descendants.sort_by_key(|d| std::cmp::Reverse(self.nodes[d.index()].completed_seq));

        let mut changed = Vec::with_capacity(descendants.len() + 1);
        for d in descendants {
            let parent = self.nodes[d.index()].parent.unwrap_or(id);
            self.mark_rejected(d, RejectReason::ParentRejected { parent });
            changed.push(d);
        }
        if self.nodes[id.index()].status != TransactionStatus::Rejected {
            self.mark_rejected(id, reason);
            changed.push(id);
        }
        changed
    }

    fn mark_rejected(&mut self, id: TransactionId, reason: RejectReason) {
        let seq = self.bump_seq();
        let node = &mut self.nodes[id.index()];
        node.status = TransactionStatus::Rejected;
        node.reject_reason = Some(reason);
        if node.completed_seq.is_none() {
            node.completed_seq = Some(seq);
        }
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Transaction `id`, which must have come from this log.
    pub(crate) fn node(&self, id: TransactionId) -> &Transaction {
        &self.nodes[id.index()]
    }

    /// Mutable access to a transaction's mutation while it is being processed.
    pub(crate) fn mutation_mut(&mut self, id: TransactionId) -> Option<&mut Mutation> {
        self.nodes.get_mut(id.index()).map(|n| &mut n.mutation)
    }

    /// Refuse further proposals.
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
        self.processing.clear();
    }

    /// Whether the log refuses further proposals.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    // -- queries ------------------------------------------------------------

    /// Transaction `id`, if it belongs to this log.
    pub fn get(&self, id: TransactionId) -> Option<&Transaction> {
        self.nodes.get(id.index())
    }

    /// Status of transaction `id`.
    pub fn status(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.get(id).map(|n| n.status)
    }

    /// Transactions proposed while `id` was being processed, in proposal
    /// order.
    pub fn children_of(&self, id: TransactionId) -> &[TransactionId] {
        self.get(id).map_or(&[], |n| n.children.as_slice())
    }

    /// Top-level transactions in proposal order.
    pub fn roots(&self) -> &[TransactionId] {
        &self.roots
    }

    /// Number of transactions, roots and children alike.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing was ever proposed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every transaction in proposal order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.nodes.iter()
    }

    /// Every transaction, depth-first and left-to-right: each root followed
    /// by its whole subtree, then the next root.
    pub fn depth_first(&self) -> Vec<TransactionId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<TransactionId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.nodes[id.index()].children.iter().rev().copied());
        }
        order
    }

    /// Accepted transactions in application order.
    pub fn accepted(&self) -> Vec<TransactionId> {
        self.depth_first()
            .into_iter()
            .filter(|id| self.nodes[id.index()].status == TransactionStatus::Accepted)
            .collect()
    }

    /// Rejected transactions in proposal order.
    pub fn rejected(&self) -> Vec<TransactionId> {
        self.nodes
            .iter()
            .filter(|n| n.status == TransactionStatus::Rejected)
            .map(|n| n.id)
            .collect()
    }

    /// Post-state `target` will have if every pending or accepted transaction
    /// in this log is applied: the `after` of the latest such proposal.
    pub fn projected(&self, target: &MutationTarget) -> Option<&serde_json::Value> {
        self.nodes
            .iter()
            .rev()
            .filter(|n| n.status != TransactionStatus::Rejected)
            .find(|n| n.mutation.target == *target)
            .map(|n| &n.mutation.after)
    }

    /// All ids strictly below `id`, preorder.
    fn descendants(&self, id: TransactionId) -> Vec<TransactionId> {
        let mut out = Vec::new();
        let mut stack: Vec<TransactionId> = self.nodes[id.index()].children.iter().rev().copied().collect();
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next.index()].children.iter().rev().copied());
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lodestone_world::block::{BlockPos, BlockState};

    fn set(x: i32) -> Mutation {
        Mutation::set_block(BlockPos::new(x, 0, 0), BlockState::STONE)
    }

    fn propose(log: &mut TransactionLog, x: i32) -> TransactionId {
        log.propose(set(x), Attribution::default()).unwrap()
    }

    // -- 1. Shape -----------------------------------------------------------

    #[test]
    fn proposals_outside_processing_are_roots() {
        let mut log = TransactionLog::new();
        let a = propose(&mut log, 0);
        let b = propose(&mut log, 1);
        assert_eq!(log.roots(), &[a, b]);
        assert_eq!(log.get(b).unwrap().depth, 0);
        assert_eq!(log.status(a), Some(TransactionStatus::Proposed));
    }

    #[test]
    fn proposals_during_processing_are_children() {
        let mut log = TransactionLog::new();
        let t1 = propose(&mut log, 0);
        log.begin(t1);
        let c1a = propose(&mut log, 1);
        log.begin(c1a);
        let grandchild = propose(&mut log, 2);
        log.end(c1a);
        let c1b = propose(&mut log, 3);
        log.end(t1);
        let t2 = propose(&mut log, 4);

        assert_eq!(log.children_of(t1), &[c1a, c1b]);
        assert_eq!(log.get(grandchild).unwrap().depth, 2);
        assert_eq!(log.get(grandchild).unwrap().parent, Some(c1a));
        assert_eq!(log.depth_first(), vec![t1, c1a, grandchild, c1b, t2]);
    }

    #[test]
    fn unknown_id_has_no_children() {
        let log = TransactionLog::new();
        assert!(log.children_of(TransactionId(9)).is_empty());
        assert_eq!(log.status(TransactionId(9)), None);
    }

    // -- 2. Resolution ------------------------------------------------------

    #[test]
    fn reject_cascades_in_reverse_completion_order() {
        let mut log = TransactionLog::new();
        let root = propose(&mut log, 0);
        log.begin(root);
        let first = propose(&mut log, 1);
        log.accept(first);
        let second = propose(&mut log, 2);
        log.accept(second);
        log.end(root);
        log.accept(root);

        let changed = log.reject(root, RejectReason::Vetoed);
        assert_eq!(changed, vec![second, first, root]);
        assert_eq!(log.get(root).unwrap().reject_reason, Some(RejectReason::Vetoed));
        assert_eq!(
            log.get(first).unwrap().reject_reason,
            Some(RejectReason::ParentRejected { parent: root })
        );
        assert!(log.accepted().is_empty());
    }

    #[test]
    fn reject_leaves_already_rejected_children_alone() {
        let mut log = TransactionLog::new();
        let root = propose(&mut log, 0);
        log.begin(root);
        let child = propose(&mut log, 1);
        log.reject(
            child,
            RejectReason::Aborted {
                effect: "bounds".into(),
            },
        );
        log.end(root);

        assert_eq!(log.reject(root, RejectReason::Vetoed), vec![root]);
        assert!(matches!(
            log.get(child).unwrap().reject_reason,
            Some(RejectReason::Aborted { .. })
        ));
    }

    // -- 3. Sealing ---------------------------------------------------------

    #[test]
    fn sealed_log_refuses_proposals() {
        let mut log = TransactionLog::owned_by(7);
        propose(&mut log, 0);
        log.seal();
        assert_eq!(
            log.propose(set(1), Attribution::default()).unwrap_err(),
            TrackerError::ProposeAfterCompletion { phase: 7 }
        );
        assert_eq!(log.len(), 1);
    }

    // -- 4. Projection ------------------------------------------------------

    #[test]
    fn projection_skips_rejected_and_prefers_latest() {
        let mut log = TransactionLog::new();
        let pos = BlockPos::new(0, 0, 0);
        let target = MutationTarget::Block(pos);
        log.propose(Mutation::set_block(pos, BlockState::DIRT), Attribution::default())
            .unwrap();
        let later = log
            .propose(Mutation::set_block(pos, BlockState::SAND), Attribution::default())
            .unwrap();
        assert_eq!(log.projected(&target), Some(&serde_json::json!(12)));

        log.reject(later, RejectReason::Vetoed);
        assert_eq!(log.projected(&target), Some(&serde_json::json!(3)));
        assert_eq!(log.projected(&MutationTarget::Block(BlockPos::new(5, 5, 5))), None);
    }
}
