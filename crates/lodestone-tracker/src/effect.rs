//! Effects and the per-kind pipelines that run them.
//!
//! An [`Effect`] is one side-effect handler. When a transaction is resolved,
//! every effect registered for its [`MutationKind`] runs in registration
//! order, each receiving an [`EffectScope`] through which it can read the
//! transaction, rewrite its post-state, propose children, or reach the
//! tracking context to enter a nested phase. Returning
//! [`EffectResult::Abort`] stops the pipeline and rejects the transaction.
//!
//! # Example
//!
//! ```
//! use lodestone_tracker::prelude::*;
//! use lodestone_world::prelude::*;
//!
//! let mut registry = PipelineRegistry::new();
//! registry.register(
//!     MutationKind::BLOCK_SET,
//!     effect_fn("no_bedrock", |scope: &mut EffectScope<'_>| {
//!         if scope.mutation().after_block() == Some(BlockState::BEDROCK) {
//!             EffectResult::Abort
//!         } else {
//!             EffectResult::Continue
//!         }
//!     }),
//! );
//! assert_eq!(registry.pipeline(&MutationKind::BLOCK_SET).unwrap().len(), 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lodestone_world::mutation::MutationKind;

use crate::commit::EffectScope;

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// Outcome of one effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectResult {
    /// Run the next effect.
    Continue,
    /// Stop the pipeline and reject the transaction without an event.
    Abort,
}

/// A side-effect handler bound to a mutation kind.
pub trait Effect: Send + Sync {
    /// Name used in diagnostics and [`RejectReason::Aborted`](crate::transaction::RejectReason::Aborted).
    fn name(&self) -> &str;

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult;
}

/// An [`Effect`] backed by a closure. Built with [`effect_fn`].
pub struct FnEffect<F> {
    name: String,
    f: F,
}

impl<F> Effect for FnEffect<F>
where
    F: Fn(&mut EffectScope<'_>) -> EffectResult + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, scope: &mut EffectScope<'_>) -> EffectResult {
        (self.f)(scope)
    }
}

/// Wrap a closure as a named effect.
pub fn effect_fn<F>(name: impl Into<String>, f: F) -> FnEffect<F>
where
    F: Fn(&mut EffectScope<'_>) -> EffectResult + Send + Sync,
{
    FnEffect {
        name: name.into(),
        f,
    }
}

// ---------------------------------------------------------------------------
// EffectPipeline
// ---------------------------------------------------------------------------

/// Ordered effects for one mutation kind.
#[derive(Clone)]
pub struct EffectPipeline {
    kind: MutationKind,
    effects: Vec<Arc<dyn Effect>>,
}

impl EffectPipeline {
    /// An empty pipeline for `kind`.
    pub fn new(kind: MutationKind) -> Self {
        Self {
            kind,
            effects: Vec::new(),
        }
    }

    /// The mutation kind this pipeline handles.
    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    /// Append `effect`. It runs after every effect already registered.
    pub fn push(&mut self, effect: Arc<dyn Effect>) {
        self.effects.push(effect);
    }

    /// Effects in the order they run.
    pub fn effects(&self) -> &[Arc<dyn Effect>] {
        &self.effects
    }

    /// Effect names in run order.
    pub fn names(&self) -> Vec<&str> {
        self.effects.iter().map(|e| e.name()).collect()
    }

    /// Number of effects.
    pub fn len(&self) -> usize {
        self.effects.len()
    }

    /// Whether the pipeline has no effects.
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

impl fmt::Debug for EffectPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectPipeline")
            .field("kind", &self.kind)
            .field("effects", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PipelineRegistry
// ---------------------------------------------------------------------------

/// Pipelines keyed by mutation kind. Kinds without a pipeline resolve with
/// no effects.
#[derive(Clone, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<MutationKind, Arc<EffectPipeline>>,
}

impl PipelineRegistry {
    /// A registry with no pipelines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `effect` to the pipeline for `kind`.
    pub fn register(&mut self, kind: MutationKind, effect: impl Effect + 'static) -> &mut Self {
        self.register_arc(kind, Arc::new(effect))
    }

    /// Append an already shared `effect` to the pipeline for `kind`.
    pub fn register_arc(&mut self, kind: MutationKind, effect: Arc<dyn Effect>) -> &mut Self {
        let pipeline = self
            .pipelines
            .entry(kind.clone())
            .or_insert_with(|| Arc::new(EffectPipeline::new(kind)));
        Arc::make_mut(pipeline).push(effect);
        self
    }

    /// The pipeline for `kind`, if any effect was registered for it.
    pub fn pipeline(&self, kind: &MutationKind) -> Option<&Arc<EffectPipeline>> {
        self.pipelines.get(kind)
    }

    /// Kinds with a registered pipeline, sorted.
    pub fn kinds(&self) -> Vec<&MutationKind> {
        let mut kinds: Vec<_> = self.pipelines.keys().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.kinds().into_iter().map(|k| (k, &self.pipelines[k])))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
