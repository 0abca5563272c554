//! The single reporting channel for tracking-engine inconsistencies.
//!
//! Usage errors never unwind game logic. They are logged through `tracing`
//! together with a rendering of the phase stack at the time, and the most
//! recent ones are kept in a bounded in-memory history so that tests and
//! debug tooling can inspect them.

use std::collections::VecDeque;

use tracing::{error, warn};

use crate::TrackerError;

/// One reported inconsistency.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub error: TrackerError,
    /// Phase stack at the time of the report, innermost last
    /// (e.g. `"tick.block > packet.break_block"`), or `"<idle>"`.
    pub phase_stack: String,
}

/// Bounded history of [`Diagnostic`]s.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    history: VecDeque<Diagnostic>,
    capacity: usize,
    total: u64,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            total: 0,
        }
    }

    /// Log `error` and remember it.
    pub fn report(&mut self, error: &TrackerError, phase_stack: String) {
        if error.is_fatal() {
            error!(phase_stack = %phase_stack, error = %error, "tracking engine fatal error");
        } else {
            warn!(phase_stack = %phase_stack, error = %error, "tracking engine usage error");
        }
        self.total += 1;
        if self.capacity == 0 {
            return;
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(Diagnostic {
            error: error.clone(),
            phase_stack,
        });
    }

    /// Retained diagnostics, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Diagnostic> {
        self.history.iter()
    }

    pub fn last(&self) -> Option<&Diagnostic> {
        self.history.back()
    }

    /// Number of diagnostics ever reported, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.total = 0;
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_error(n: u64) -> TrackerError {
        TrackerError::UnknownPhase { phase: n }
    }

    #[test]
    fn history_is_bounded_but_total_counts_all() {
        let mut d = Diagnostics::new(2);
        for n in 0..5 {
            d.report(&idle_error(n), "<idle>".to_owned());
        }
        assert_eq!(d.total(), 5);
        let kept: Vec<_> = d.history().map(|x| x.error.clone()).collect();
        assert_eq!(kept, vec![idle_error(3), idle_error(4)]);
        assert_eq!(d.last().unwrap().phase_stack, "<idle>");
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut d = Diagnostics::new(0);
        d.report(&idle_error(1), "<idle>".to_owned());
        assert_eq!(d.total(), 1);
        assert!(d.last().is_none());
    }
}
