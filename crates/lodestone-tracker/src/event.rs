//! The observer contract.
//!
//! For every transaction that survives its effect pipeline in an announcing
//! phase, the engine builds a [`MutationEvent`] and hands it to the
//! [`EventObserver`]. The single return value decides whether the mutation
//! goes ahead.

use std::collections::BTreeMap;

use serde::Serialize;

use lodestone_world::mutation::{MutationKind, MutationTarget};

use crate::cause::{CauseChain, ContextKey};
use crate::phase::PhaseState;
use crate::transaction::TransactionId;

/// A mutation about to be committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationEvent {
    pub transaction: TransactionId,
    pub phase: PhaseState,
    pub player_interaction: bool,
    pub kind: MutationKind,
    pub target: MutationTarget,
    /// Projected state of the target when the mutation was proposed.
    pub before: serde_json::Value,
    /// State the mutation will write.
    pub after: serde_json::Value,
    /// Cause stack when the mutation was proposed, oldest first.
    pub cause: CauseChain,
    pub context: BTreeMap<ContextKey, serde_json::Value>,
    /// 0 for mutations proposed directly under the phase.
    pub cascade_depth: usize,
}

/// Receiver of [`MutationEvent`]s.
pub trait EventObserver: Send {
    /// Deliver `event`. Returns `true` to veto it.
    fn post(&mut self, event: &MutationEvent) -> bool;
}

/// Observer that accepts everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl EventObserver for NullObserver {
    fn post(&mut self, _event: &MutationEvent) -> bool {
        false
    }
}

impl<F> EventObserver for F
where
    F: FnMut(&MutationEvent) -> bool + Send,
{
    fn post(&mut self, event: &MutationEvent) -> bool {
        self(event)
    }
}
