//! The cause stack: who is responsible for what is happening right now.
//!
//! A [`CauseStack`] is an ordered stack of [`Cause`]s (bottom = oldest) plus a
//! table of named context values. Emitted events carry a [`CauseChain`]
//! snapshot of the stack, so observers can tell that a block was broken by a
//! player, during a command, run by a plugin.
//!
//! # Frames
//!
//! Causes and context values are normally scoped with frames. A frame records
//! the stack depth when it opens; closing it truncates the stack back to that
//! depth and restores every context value set inside it. Frames nest strictly.
//! Closing an outer frame while an inner one is open is a usage error: the
//! stack is still restored to the outer frame's depth (the inner frames are
//! force-closed) and the later close of the inner frame becomes a no-op.
//!
//! ```
//! use lodestone_tracker::cause::{Cause, CauseStack, ContextKey};
//!
//! let mut stack = CauseStack::with_root(Cause::Server);
//! {
//!     let mut frame = stack.push_frame().unwrap();
//!     frame.push_cause(Cause::Plugin("worldedit".to_owned())).unwrap();
//!     frame.add_context(ContextKey::COMMAND, "//set stone".into()).unwrap();
//!     assert_eq!(frame.current_cause().len(), 2);
//! }
//! assert_eq!(stack.depth(), 1);
//! assert!(stack.context(&ContextKey::COMMAND).is_none());
//! ```

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use tracing::warn;

use lodestone_world::block::{BlockPos, BlockState};
use lodestone_world::entity::EntityId;

use crate::thread::ThreadAffinity;
use crate::TrackerError;

// ---------------------------------------------------------------------------
// Cause
// ---------------------------------------------------------------------------

/// An object responsible for an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cause {
    /// A connected player.
    Player { id: EntityId, name: String },
    /// A non-player entity (mob, falling block, primed tnt).
    Entity(EntityId),
    /// A block acting on its surroundings (redstone, tnt, a falling sand column).
    Block { pos: BlockPos, state: BlockState },
    /// A plugin, by id.
    Plugin(String),
    /// A command line being executed.
    Command(String),
    /// The server itself.
    Server,
    /// Anything else, by description.
    Custom(String),
}

impl Cause {
    pub fn player(id: EntityId, name: impl Into<String>) -> Self {
        Cause::Player {
            id,
            name: name.into(),
        }
    }

    /// The player id, if this cause is a player.
    pub fn as_player(&self) -> Option<EntityId> {
        match self {
            Cause::Player { id, .. } => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Player { name, .. } => write!(f, "player:{name}"),
            Cause::Entity(id) => write!(f, "entity:{id}"),
            Cause::Block { pos, state } => write!(f, "block:{}@{pos}", state.name()),
            Cause::Plugin(id) => write!(f, "plugin:{id}"),
            Cause::Command(line) => write!(f, "command:{line}"),
            Cause::Server => f.write_str("server"),
            Cause::Custom(what) => write!(f, "custom:{what}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CauseChain
// ---------------------------------------------------------------------------

/// An immutable snapshot of a cause stack, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CauseChain(Vec<Cause>);

impl CauseChain {
    pub fn new(causes: Vec<Cause>) -> Self {
        Self(causes)
    }

    /// The oldest cause.
    pub fn root(&self) -> Option<&Cause> {
        self.0.first()
    }

    /// The cause pushed last.
    pub fn most_recent(&self) -> Option<&Cause> {
        self.0.last()
    }

    /// The most recently pushed player, if any.
    pub fn player(&self) -> Option<EntityId> {
        self.0.iter().rev().find_map(Cause::as_player)
    }

    pub fn contains(&self, cause: &Cause) -> bool {
        self.0.contains(cause)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cause> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Cause] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CauseChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cause) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" > ")?;
            }
            write!(f, "{cause}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ContextKey
// ---------------------------------------------------------------------------

/// Name of a context value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(Cow<'static, str>);

impl ContextKey {
    /// The player on whose behalf the current action runs.
    pub const PLAYER: ContextKey = ContextKey(Cow::Borrowed("player"));
    /// The block that triggered a neighbour notification.
    pub const NOTIFIER: ContextKey = ContextKey(Cow::Borrowed("notifier"));
    /// What dealt the damage in a damage-related action.
    pub const DAMAGE_SOURCE: ContextKey = ContextKey(Cow::Borrowed("damage_source"));
    /// Name of the world being ticked.
    pub const ACTIVE_WORLD: ContextKey = ContextKey(Cow::Borrowed("active_world"));
    /// Command line being executed.
    pub const COMMAND: ContextKey = ContextKey(Cow::Borrowed("command"));
    /// Name of the innermost phase.
    pub const PHASE: ContextKey = ContextKey(Cow::Borrowed("phase"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// FrameId
// ---------------------------------------------------------------------------

/// Handle for an open frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

impl FrameId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
struct FrameRecord {
    id: FrameId,
    depth: usize,
    /// Context values overwritten inside this frame, with their prior value,
    /// in the order they were first touched.
    saved: Vec<(ContextKey, Option<serde_json::Value>)>,
}

// ---------------------------------------------------------------------------
// CauseStack
// ---------------------------------------------------------------------------

/// Stack of causes and scoped context values for one tick thread.
#[derive(Debug, Clone)]
pub struct CauseStack {
    causes: Vec<Cause>,
    frames: Vec<FrameRecord>,
    context: HashMap<ContextKey, serde_json::Value>,
    baseline: usize,
    next_frame: u64,
    affinity: ThreadAffinity,
}

impl CauseStack {
    /// An empty stack owned by the calling thread.
    pub fn new() -> Self {
        Self {
            causes: Vec::new(),
            frames: Vec::new(),
            context: HashMap::new(),
            baseline: 0,
            next_frame: 0,
            affinity: ThreadAffinity::current(),
        }
    }

    /// A stack whose permanent bottom entry is `root`. Nothing can pop it.
    pub fn with_root(root: Cause) -> Self {
        let mut stack = Self::new();
        stack.causes.push(root);
        stack.baseline = 1;
        stack
    }

    pub fn affinity(&self) -> &ThreadAffinity {
        &self.affinity
    }

    /// Hand the stack to the calling thread.
    pub fn rebind_thread(&mut self) {
        self.affinity.rebind();
    }

    // -- causes -------------------------------------------------------------

    pub fn push_cause(&mut self, cause: Cause) -> Result<(), TrackerError> {
        self.affinity.check("push_cause")?;
        self.causes.push(cause);
        Ok(())
    }

    /// Pop the most recent cause.
    ///
    /// Fails with [`TrackerError::ImbalancedStack`] instead of popping below
    /// the innermost open frame or the thread baseline; the stack is left
    /// untouched in that case.
    pub fn pop_cause(&mut self) -> Result<Cause, TrackerError> {
        self.affinity.check("pop_cause")?;
        let floor = self.floor();
        let depth = self.causes.len();
        if depth <= floor {
            return Err(TrackerError::ImbalancedStack { depth, floor });
        }
        self.causes
            .pop()
            .ok_or(TrackerError::ImbalancedStack { depth, floor })
    }

    pub fn peek_cause(&self) -> Option<&Cause> {
        self.causes.last()
    }

    pub fn depth(&self) -> usize {
        self.causes.len()
    }

    /// Depth that can never be popped below.
    pub fn baseline(&self) -> usize {
        self.baseline
    }

    /// Snapshot of every cause, oldest first.
    pub fn current_cause(&self) -> CauseChain {
        CauseChain(self.causes.clone())
    }

    fn floor(&self) -> usize {
        self.frames
            .last()
            .map_or(self.baseline, |f| f.depth.max(self.baseline))
    }

    // -- frames -------------------------------------------------------------

    /// Open a frame and return its id. Prefer [`push_frame`](Self::push_frame).
    pub fn open_frame(&mut self) -> Result<FrameId, TrackerError> {
        self.affinity.check("open_frame")?;
        let id = FrameId(self.next_frame);
        self.next_frame += 1;
        self.frames.push(FrameRecord {
            id,
            depth: self.causes.len(),
            saved: Vec::new(),
        });
        Ok(id)
    }

    /// Close `frame`, restoring depth and context to what they were when it
    /// opened.
    ///
    /// If inner frames are still open they are closed first and
    /// [`TrackerError::FrameOutOfOrder`] is returned; the stack is restored
    /// either way.
    pub fn close_frame(&mut self, frame: FrameId) -> Result<(), TrackerError> {
        self.affinity.check("close_frame")?;
        let Some(index) = self.frames.iter().rposition(|f| f.id == frame) else {
            return Err(TrackerError::UnknownFrame { frame: frame.0 });
        };
        let unwound = self.frames.len() - index - 1;
        while self.frames.len() > index {
            if let Some(record) = self.frames.pop() {
                self.restore(record);
            }
        }
        if unwound > 0 {
            return Err(TrackerError::FrameOutOfOrder {
                frame: frame.0,
                unwound,
            });
        }
        Ok(())
    }

    /// Open a frame that closes when the returned guard drops.
    pub fn push_frame(&mut self) -> Result<StackFrame<'_>, TrackerError> {
        let id = self.open_frame()?;
        Ok(StackFrame { stack: self, id })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn restore(&mut self, record: FrameRecord) {
        self.causes.truncate(record.depth.max(self.baseline));
        for (key, prior) in record.saved.into_iter().rev() {
            match prior {
                Some(value) => {
                    self.context.insert(key, value);
                }
                None => {
                    self.context.remove(&key);
                }
            }
        }
    }

    // -- context ------------------------------------------------------------

    /// Set `key`, returning the value it replaces. Restored when the innermost
    /// open frame closes.
    pub fn add_context(
        &mut self,
        key: ContextKey,
        value: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, TrackerError> {
        self.affinity.check("add_context")?;
        let prior = self.context.insert(key.clone(), value);
        self.remember(key, &prior);
        Ok(prior)
    }

    /// Unset `key` until the innermost open frame closes.
    pub fn remove_context(
        &mut self,
        key: &ContextKey,
    ) -> Result<Option<serde_json::Value>, TrackerError> {
        self.affinity.check("remove_context")?;
        let prior = self.context.remove(key);
        self.remember(key.clone(), &prior);
        Ok(prior)
    }

    pub fn context(&self, key: &ContextKey) -> Option<&serde_json::Value> {
        self.context.get(key)
    }

    /// Every context value, ordered by key.
    pub fn context_snapshot(&self) -> BTreeMap<ContextKey, serde_json::Value> {
        self.context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn remember(&mut self, key: ContextKey, prior: &Option<serde_json::Value>) {
        if let Some(frame) = self.frames.last_mut() {
            if !frame.saved.iter().any(|(k, _)| *k == key) {
                frame.saved.push((key, prior.clone()));
            }
        }
    }
}

impl Default for CauseStack {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StackFrame
// ---------------------------------------------------------------------------

/// Scoped frame on a [`CauseStack`]. Dereferences to the stack; closes the
/// frame on drop.
pub struct StackFrame<'a> {
    stack: &'a mut CauseStack,
    id: FrameId,
}

impl StackFrame<'_> {
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Open a nested frame.
    pub fn push_frame(&mut self) -> Result<StackFrame<'_>, TrackerError> {
        self.stack.push_frame()
    }
}

impl Deref for StackFrame<'_> {
    type Target = CauseStack;

    fn deref(&self) -> &CauseStack {
        self.stack
    }
}

impl DerefMut for StackFrame<'_> {
    fn deref_mut(&mut self) -> &mut CauseStack {
        self.stack
    }
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.stack.close_frame(self.id) {
            warn!(frame = self.id.0, error = %error, "cause frame did not close cleanly");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
