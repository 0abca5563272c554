//! The phase stack.

use crate::context::{PhaseContext, PhaseId};

/// Whether any phase is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Idle,
    Active { depth: usize },
}

/// Stack of [`PhaseContext`]s, innermost last. Only the top entry is switched
/// in.
#[derive(Debug, Clone, Default)]
pub struct PhaseTracker {
    stack: Vec<PhaseContext>,
    next_id: u64,
}

impl PhaseTracker {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&mut self) -> PhaseId {
        let id = PhaseId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Push `context`, switching out the previous top.
    pub(crate) fn push(&mut self, mut context: PhaseContext) {
        if let Some(top) = self.stack.last_mut() {
            top.deactivate();
        }
        context.activate();
        self.stack.push(context);
    }

    /// Pop the top context and switch the one below back in.
    pub(crate) fn pop(&mut self) -> Option<PhaseContext> {
        let popped = self.stack.pop();
        if let Some(top) = self.stack.last_mut() {
            top.activate();
        }
        popped
    }

    /// Idle, or active with the current depth.
    pub fn state(&self) -> TrackerState {
        match self.stack.len() {
            0 => TrackerState::Idle,
            depth => TrackerState::Active { depth },
        }
    }

    /// Whether the stack is empty.
    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// The current context.
    pub fn top(&self) -> Option<&PhaseContext> {
        self.stack.last()
    }

    /// The open context with identity `id`.
    pub fn get(&self, id: PhaseId) -> Option<&PhaseContext> {
        self.stack.iter().find(|c| c.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: PhaseId) -> Option<&mut PhaseContext> {
        self.stack.iter_mut().find(|c| c.id() == id)
    }

    /// Stack index of `id`, 0 being the outermost.
    pub fn position(&self, id: PhaseId) -> Option<usize> {
        self.stack.iter().position(|c| c.id() == id)
    }

    /// Contexts from outermost to innermost.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PhaseContext> {
        self.stack.iter()
    }

    /// `"tick.block > packet.break_block"`, or `"<idle>"`.
    pub fn render(&self) -> String {
        if self.stack.is_empty() {
            return "<idle>".to_owned();
        }
        self.stack
            .iter()
            .map(|c| c.state().name())
            .collect::<Vec<_>>()
            .join(" > ")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::Cause;
    use crate::context::PhaseContextBuilder;
    use crate::phase::{PhaseState, PluginPhase, TickPhase};

    fn context(tracker: &mut PhaseTracker, state: PhaseState) -> PhaseContext {
        let id = tracker.next_id();
        PhaseContextBuilder::new(Cause::Server).build(id, state).unwrap()
    }

    #[test]
    fn only_top_is_active() {
        let mut tracker = PhaseTracker::new();
        assert_eq!(tracker.state(), TrackerState::Idle);

        let outer = context(&mut tracker, PhaseState::Tick(TickPhase::Block));
        let outer_id = outer.id();
        tracker.push(outer);
        let inner = context(&mut tracker, PhaseState::Plugin(PluginPhase::Listener));
        tracker.push(inner);

        assert_eq!(tracker.state(), TrackerState::Active { depth: 2 });
        assert!(!tracker.get(outer_id).unwrap().is_active());
        assert!(tracker.top().unwrap().is_active());
        assert_eq!(tracker.render(), "tick.block > plugin.listener");

        tracker.pop();
        assert!(tracker.get(outer_id).unwrap().is_active());
        assert_eq!(tracker.position(outer_id), Some(0));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut tracker = PhaseTracker::new();
        let a = context(&mut tracker, PhaseState::Tick(TickPhase::Block));
        let a_id = a.id();
        tracker.push(a);
        tracker.pop();
        let b = context(&mut tracker, PhaseState::Tick(TickPhase::Block));
        assert_ne!(a_id, b.id());
        assert_eq!(tracker.render(), "<idle>");
    }
}
