//! Shared fixtures for the tracker integration tests.

#![allow(dead_code)]

use std::any::Any;
use std::sync::{Arc, Mutex};

use lodestone_tracker::prelude::*;
use lodestone_world::prelude::*;

/// A [`VoxelWorld`] that records every mutation applied to it.
pub struct RecordingWorld {
    inner: VoxelWorld,
    applied: Arc<Mutex<Vec<Mutation>>>,
}

impl RecordingWorld {
    pub fn new(inner: VoxelWorld) -> (Self, Arc<Mutex<Vec<Mutation>>>) {
        let applied = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                applied: Arc::clone(&applied),
            },
            applied,
        )
    }
}

impl WorldState for RecordingWorld {
    fn read(&self, target: &MutationTarget) -> Option<serde_json::Value> {
        self.inner.read(target)
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<(), WorldError> {
        self.applied.lock().unwrap().push(mutation.clone());
        self.inner.apply(mutation)
    }

    fn block(&self, pos: BlockPos) -> BlockState {
        self.inner.block(pos)
    }

    fn in_bounds(&self, pos: BlockPos) -> bool {
        self.inner.in_bounds(pos)
    }

    fn state_hash(&self) -> String {
        self.inner.state_hash()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Observer that records every event and vetoes those `veto` selects.
pub fn recording_observer(
    veto: impl Fn(&MutationEvent) -> bool + Send + 'static,
) -> (
    impl FnMut(&MutationEvent) -> bool + Send + 'static,
    Arc<Mutex<Vec<MutationEvent>>>,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let observer = move |event: &MutationEvent| {
        sink.lock().unwrap().push(event.clone());
        veto(event)
    };
    (observer, events)
}

/// The block-break pipeline: breaking a block with a drop proposes the drop.
pub fn drops_pipeline() -> PipelineRegistry {
    let mut registry = PipelineRegistry::new();
    registry.register(
        MutationKind::BLOCK_SET,
        effect_fn("block_drops", |scope: &mut EffectScope<'_>| {
            let m = scope.mutation().clone();
            let (Some(pos), Some(before), Some(after)) =
                (m.block_pos(), m.before_block(), m.after_block())
            else {
                return EffectResult::Continue;
            };
            if after.is_air() {
                if let Some(stack) = before.drop_item() {
                    if scope.propose(Mutation::drop_item(pos, stack)).is_err() {
                        return EffectResult::Abort;
                    }
                }
            }
            EffectResult::Continue
        }),
    );
    registry
}

pub fn player() -> Cause {
    Cause::player(EntityId::new(0, 0), "alex")
}
