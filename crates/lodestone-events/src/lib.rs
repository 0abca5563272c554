//! Lodestone Events -- listeners and committed-change history on top of the
//! tracking engine.
//!
//! The tracking engine talks to exactly one observer. This crate provides
//! the observer a server actually installs, plus the bookkeeping that turns
//! completion reports into something queryable.
//!
//! # Architecture
//!
//! - [`bus`]: [`EventBus`](bus::EventBus), an ordered listener registry with
//!   kind filters, veto/restore and monitor listeners.
//! - [`journal`]: [`ChangeJournal`](journal::ChangeJournal) of committed
//!   mutations with their cause chains.
//! - [`history`]: per-tick [`TickRecord`](history::TickRecord)s in a rolling
//!   window and cross-tick [`CausalTrail`](history::CausalTrail)s.

#![deny(unsafe_code)]

pub mod bus;
pub mod history;
pub mod journal;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bus::{BusStats, EventBus, ListenerId, ListenerOptions, ListenerResult, Order};
    pub use crate::history::{CausalTrail, EventHistory, TickRecord, TrailStep};
    pub use crate::journal::{ChangeJournal, CommittedChange};
}
