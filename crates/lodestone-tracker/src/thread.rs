//! Tick-thread affinity.
//!
//! The tracking structures are not synchronised. Instead, each records the
//! thread that owns it and rejects mutating calls from anywhere else with
//! [`TrackerError::WrongThread`].

use std::thread::{self, ThreadId};

use crate::TrackerError;

/// The thread allowed to mutate a tracking structure.
#[derive(Debug, Clone)]
pub struct ThreadAffinity {
    owner: ThreadId,
    owner_name: String,
}

impl ThreadAffinity {
    /// Bind to the calling thread.
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            owner: current.id(),
            owner_name: describe(&current),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// `Ok` on the owning thread, [`TrackerError::WrongThread`] elsewhere.
    pub fn check(&self, operation: &'static str) -> Result<(), TrackerError> {
        let current = thread::current();
        if current.id() == self.owner {
            return Ok(());
        }
        Err(TrackerError::WrongThread {
            operation,
            owner: self.owner_name.clone(),
            current: describe(&current),
        })
    }

    /// Hand ownership to the calling thread.
    pub fn rebind(&mut self) {
        *self = Self::current();
    }
}

fn describe(thread: &thread::Thread) -> String {
    match thread.name() {
        Some(name) => format!("'{name}' ({:?})", thread.id()),
        None => format!("{:?}", thread.id()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
