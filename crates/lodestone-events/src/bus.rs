//! Ordered event listeners with veto and un-veto.
//!
//! The [`EventBus`] is the observer a host installs on its
//! [`TrackingContext`](lodestone_tracker::tracking::TrackingContext). Every
//! [`MutationEvent`] the engine posts is offered to the registered listeners
//! in [`Order`], then in registration order within the same order. Each
//! listener sees whether the event is currently cancelled and answers with a
//! [`ListenerResult`]; the final cancelled flag is the veto handed back to
//! the engine.
//!
//! # Listener rules
//!
//! - A listener with a kind filter only sees events of that mutation kind.
//! - Once an event is cancelled, later listeners are skipped unless they were
//!   registered with `receive_cancelled`. A receiving listener may answer
//!   [`ListenerResult::Restore`] to lift the veto.
//! - [`Order::Post`] listeners are monitors: they run last and their answers
//!   are ignored.
//!
//! # Example
//!
//! ```
//! use lodestone_events::bus::{EventBus, ListenerOptions, ListenerResult, Order};
//! use lodestone_world::block::BlockState;
//! use lodestone_world::mutation::MutationKind;
//!
//! let mut bus = EventBus::new();
//! bus.listen(
//!     "no_tnt",
//!     ListenerOptions::new(Order::Early).kind(MutationKind::BLOCK_SET),
//!     |event, _cancelled| {
//!         if event.after == serde_json::json!(BlockState::TNT) {
//!             ListenerResult::Veto
//!         } else {
//!             ListenerResult::Allow
//!         }
//!     },
//! );
//! assert_eq!(bus.len(), 1);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use lodestone_tracker::event::{EventObserver, MutationEvent};
use lodestone_world::mutation::MutationKind;

// ---------------------------------------------------------------------------
// Order / ListenerResult
// ---------------------------------------------------------------------------

/// When a listener runs relative to the others.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Order {
    /// Runs first. Meant for protection plugins that decide early.
    Pre,
    Early,
    #[default]
    Default,
    Late,
    /// Runs last; the answer is ignored.
    Post,
}

/// A listener's answer to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerResult {
    /// Leave the cancelled flag as it is.
    Allow,
    /// Cancel the event.
    Veto,
    /// Un-cancel an event an earlier listener vetoed.
    Restore,
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Handle returned by [`EventBus::listen`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// How a listener is registered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListenerOptions {
    pub order: Order,
    /// Only deliver events of this mutation kind.
    pub kind: Option<MutationKind>,
    /// Deliver events that are already cancelled.
    pub receive_cancelled: bool,
}

impl ListenerOptions {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: MutationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn receive_cancelled(mut self) -> Self {
        self.receive_cancelled = true;
        self
    }
}

type Handler = Box<dyn FnMut(&MutationEvent, bool) -> ListenerResult + Send>;

struct Listener {
    id: ListenerId,
    name: String,
    options: ListenerOptions,
    handler: Handler,
}

impl Listener {
    fn wants(&self, event: &MutationEvent, cancelled: bool) -> bool {
        if cancelled && !self.options.receive_cancelled {
            return false;
        }
        self.options.kind.as_ref().map_or(true, |k| *k == event.kind)
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Counters kept by an [`EventBus`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub posted: u64,
    pub vetoed: u64,
    /// Events cancelled by one listener and restored by a later one.
    pub restored: u64,
}

/// Ordered listener registry. See the [module docs](self).
#[derive(Default)]
pub struct EventBus {
    /// Sorted by `(order, id)`.
    listeners: Vec<Listener>,
    next_id: u64,
    stats: BusStats,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    pub fn listen(
        &mut self,
        name: impl Into<String>,
        options: ListenerOptions,
        handler: impl FnMut(&MutationEvent, bool) -> ListenerResult + Send + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        let at = self
            .listeners
            .partition_point(|l| (l.options.order, l.id) < (options.order, id));
        self.listeners.insert(
            at,
            Listener {
                id,
                name: name.into(),
                options,
                handler: Box::new(handler),
            },
        );
        id
    }

    /// Register a [`Order::Post`] monitor that only observes.
    pub fn monitor(
        &mut self,
        name: impl Into<String>,
        mut handler: impl FnMut(&MutationEvent, bool) + Send + 'static,
    ) -> ListenerId {
        self.listen(
            name,
            ListenerOptions::new(Order::Post).receive_cancelled(),
            move |event, cancelled| {
                handler(event, cancelled);
                ListenerResult::Allow
            },
        )
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unlisten(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| l.id != id);
        self.listeners.len() != before
    }

    /// Listener names in dispatch order.
    pub fn listener_names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn stats(&self) -> BusStats {
        self.stats
    }

    /// Offer `event` to every listener and return the final cancelled flag.
    pub fn dispatch(&mut self, event: &MutationEvent) -> bool {
        self.stats.posted += 1;
        let mut cancelled = false;
        let mut was_cancelled = false;
        for listener in &mut self.listeners {
            if !listener.wants(event, cancelled) {
                continue;
            }
            let result = (listener.handler)(event, cancelled);
            if listener.options.order == Order::Post {
                continue;
            }
            match result {
                ListenerResult::Allow => {}
                ListenerResult::Veto if !cancelled => {
                    trace!(listener = %listener.name, transaction = %event.transaction, "event cancelled");
                    cancelled = true;
                    was_cancelled = true;
                }
                ListenerResult::Veto => {}
                ListenerResult::Restore if cancelled => {
                    trace!(listener = %listener.name, transaction = %event.transaction, "event restored");
                    cancelled = false;
                }
                ListenerResult::Restore => {}
            }
        }
        if cancelled {
            self.stats.vetoed += 1;
            debug!(
                transaction = %event.transaction,
                kind = %event.kind,
                target = %event.target,
                phase = event.phase.name(),
                "mutation vetoed by listener"
            );
        } else if was_cancelled {
            self.stats.restored += 1;
        }
        cancelled
    }
}

impl EventObserver for EventBus {
    fn post(&mut self, event: &MutationEvent) -> bool {
        self.dispatch(event)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_names())
            .field("stats", &self.stats)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
