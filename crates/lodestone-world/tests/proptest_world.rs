//! Property tests for the voxel world.
//!
//! Random sequences of mutations are applied to a [`VoxelWorld`] and checked
//! against a plain map of blocks and a count of live entities.

use std::collections::BTreeMap;

use lodestone_world::prelude::*;
use proptest::prelude::*;

/// Mutations we can apply to the world.
#[derive(Debug, Clone)]
enum WorldOp {
    SetBlock(BlockPos, BlockState),
    Spawn(BlockPos),
    Remove(usize),
    Move(usize, BlockPos),
}

fn config() -> WorldConfig {
    WorldConfig { min_y: 0, max_y: 15 }
}

/// Positions in a small box that pokes out below and above the build height.
fn pos() -> impl Strategy<Value = BlockPos> {
    (-3..=3i32, -2..=18i32, -3..=3i32).prop_map(|(x, y, z)| BlockPos::new(x, y, z))
}

fn state() -> impl Strategy<Value = BlockState> {
    prop_oneof![
        Just(BlockState::AIR),
        Just(BlockState::STONE),
        Just(BlockState::DIRT),
        Just(BlockState::SAND),
        Just(BlockState::TNT),
    ]
}

fn op() -> impl Strategy<Value = WorldOp> {
    prop_oneof![
        4 => (pos(), state()).prop_map(|(p, s)| WorldOp::SetBlock(p, s)),
        2 => pos().prop_map(WorldOp::Spawn),
        1 => (0..8usize).prop_map(WorldOp::Remove),
        1 => (0..8usize, pos()).prop_map(|(i, p)| WorldOp::Move(i, p)),
    ]
}

fn live_ids(world: &VoxelWorld) -> Vec<EntityId> {
    let mut ids: Vec<EntityId> = world.entities().map(|e| e.id).collect();
    ids.sort();
    ids
}

proptest! {
    /// The world agrees with a plain block map after any sequence of
    /// mutations, and rejected mutations leave it untouched.
    #[test]
    fn apply_matches_model(ops in prop::collection::vec(op(), 1..60)) {
        let mut world = VoxelWorld::new(config());
        let mut blocks: BTreeMap<BlockPos, BlockState> = BTreeMap::new();
        let mut entities = 0usize;

        for op in &ops {
            let before = world.state_hash();
            match op {
                WorldOp::SetBlock(p, s) => {
                    let result = world.apply(&Mutation::set_block(*p, *s));
                    if world.in_bounds(*p) {
                        prop_assert!(result.is_ok());
                        if s.is_air() {
                            blocks.remove(p);
                        } else {
                            blocks.insert(*p, *s);
                        }
                    } else {
                        let is_out_of_bounds = matches!(result, Err(WorldError::OutOfBounds { .. }));
                        prop_assert!(is_out_of_bounds);
                        prop_assert_eq!(world.state_hash(), before);
                    }
                }
                WorldOp::Spawn(p) => {
                    let result = world.apply(&Mutation::spawn_entity(*p, "marker", serde_json::json!({})));
                    prop_assert!(result.is_ok());
                    entities += 1;
                }
                WorldOp::Remove(i) => {
                    let ids = live_ids(&world);
                    if let Some(&id) = ids.get(*i) {
                        prop_assert!(world.apply(&Mutation::remove_entity(id)).is_ok());
                        entities -= 1;
                        // A removed id is stale from then on.
                        prop_assert!(world.apply(&Mutation::remove_entity(id)).is_err());
                        prop_assert!(world.entity(id).is_none());
                    }
                }
                WorldOp::Move(i, p) => {
                    let ids = live_ids(&world);
                    if let Some(&id) = ids.get(*i) {
                        prop_assert!(world.apply(&Mutation::move_entity(id, *p)).is_ok());
                        prop_assert_eq!(world.entity(id).map(|e| e.position), Some(*p));
                    }
                }
            }

            prop_assert_eq!(world.block_count(), blocks.len());
            prop_assert_eq!(world.entity_count(), entities);
        }

        let stored: Vec<(BlockPos, BlockState)> = world.blocks().collect();
        let expected: Vec<(BlockPos, BlockState)> = blocks.into_iter().collect();
        prop_assert_eq!(stored, expected);
    }

    /// Writing the same final blocks in any order gives the same digest.
    #[test]
    fn state_hash_ignores_write_order(
        cells in prop::collection::btree_map(pos(), state(), 0..40),
        seed in any::<u64>(),
    ) {
        let mut forward = VoxelWorld::new(config());
        for (p, s) in &cells {
            forward.set_block(*p, *s);
        }

        // Deterministic shuffle keyed on the seed.
        let mut shuffled: Vec<(BlockPos, BlockState)> = cells.into_iter().collect();
        shuffled.sort_by_key(|(p, _)| {
            let key = (i64::from(p.x) * 73_856_093) ^ (i64::from(p.y) * 19_349_663) ^ (i64::from(p.z) * 83_492_791);
            (key as u64) ^ seed
        });
        let mut backward = VoxelWorld::new(config());
        for (p, s) in shuffled.iter().rev() {
            backward.set_block(*p, *s);
        }

        prop_assert_eq!(forward.state_hash(), backward.state_hash());
    }
}
