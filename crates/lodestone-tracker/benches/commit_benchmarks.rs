//! Phase completion benchmarks.
//!
//! Measures the cost of the accept-then-apply commit for a block-heavy phase
//! (an explosion-sized batch of block changes, each with an item-drop child)
//! and the fixed overhead of entering and exiting an empty phase.
//!
//! Run with: `cargo bench --bench commit_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use lodestone_tracker::prelude::*;
use lodestone_world::prelude::*;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn stone_cube(side: i32) -> VoxelWorld {
    let mut world = VoxelWorld::new(WorldConfig::default());
    world.fill(
        BlockPos::new(0, 10, 0),
        BlockPos::new(side - 1, 10 + side - 1, side - 1),
        BlockState::STONE,
    );
    world
}

fn drops_pipeline() -> PipelineRegistry {
    let mut registry = PipelineRegistry::new();
    registry.register(
        MutationKind::BLOCK_SET,
        effect_fn("block_drops", |scope: &mut EffectScope<'_>| {
            let m = scope.mutation().clone();
            if let (Some(pos), Some(before)) = (m.block_pos(), m.before_block()) {
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

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_break_cube(c: &mut Criterion) {
    let mut group = c.benchmark_group("break_cube");
    for side in [4, 8, 12] {
        group.bench_with_input(BenchmarkId::from_parameter(side), &side, |b, &side| {
            b.iter_batched(
                || {
                    TrackingContext::builder(stone_cube(side))
                        .pipelines(drops_pipeline())
                        .build()
                },
                |mut tc| {
                    let explosion = Explosion {
                        origin: BlockPos::new(0, 10, 0),
                        radius: side as u8,
                        breaks_blocks: true,
                    };
                    let mut phase = tc
                        .enter(
                            PhaseState::General(GeneralPhase::Explosion),
                            PhaseContextBuilder::new(Cause::Server).explosion(explosion),
                        )
                        .unwrap();
                    for x in 0..side {
                        for y in 10..10 + side {
                            for z in 0..side {
                                phase
                                    .propose(Mutation::set_block(
                                        BlockPos::new(x, y, z),
                                        BlockState::AIR,
                                    ))
                                    .unwrap();
                            }
                        }
                    }
                    black_box(phase.finish().unwrap().applied.len())
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_empty_phase(c: &mut Criterion) {
    let mut tc = TrackingContext::builder(VoxelWorld::default()).build();
    c.bench_function("enter_exit_empty_phase", |b| {
        b.iter(|| {
            let phase = tc
                .enter(
                    PhaseState::Tick(TickPhase::Block),
                    PhaseContextBuilder::new(Cause::Server),
                )
                .unwrap();
            black_box(phase.finish().unwrap().is_empty())
        });
    });
}

criterion_group!(benches, bench_break_cube, bench_empty_phase);
criterion_main!(benches);
