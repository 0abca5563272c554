//! Fixed-timestep tick loop driving the tracking engine.
//!
//! The [`TickLoop`] owns the [`TrackingContext`] and advances it one tick at a
//! time. Each tick:
//!
//! 1. All registered systems run in registration order. Systems enter phases
//!    on the tracking context and hand explicit completion reports to
//!    [`TickInfo::record`].
//! 2. `random_tick_speed` random block ticks land in the configured region.
//! 3. Phases still open are completed innermost first.
//! 4. Every completion report of the tick is folded into the
//!    [`EventHistory`]: recorded reports first, then guard-drop reports, then
//!    leaked phases.
//! 5. The tick counter and simulation time advance.
//!
//! A fatal error (the world refusing an accepted mutation) halts the loop:
//! the tick that hit it returns [`TickError::Fatal`] and every later call
//! returns [`TickError::Halted`].
//!
//! Randomness comes only from the loop's seeded RNG, so the same seed, the
//! same systems and the same initial world give the same final world.
//!
//! # Example
//!
//! ```
//! use lodestone_server::prelude::*;
//!
//! let tracking = TrackingContext::builder(VoxelWorld::default())
//!     .pipelines(standard_rules())
//!     .build();
//! let mut server = TickLoop::new(tracking, TickConfig::default());
//!
//! server.add_system("noop", |_tc, _info| {});
//! server.run_ticks(10).unwrap();
//!
//! assert_eq!(server.tick_count(), 10);
//! assert_eq!(server.history().history().len(), 10);
//! ```

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tracing::{debug, error, trace, warn};

use lodestone_events::history::{EventHistory, TickRecord};
use lodestone_tracker::commit::CompletionReport;
use lodestone_tracker::event::EventObserver;
use lodestone_tracker::tracking::TrackingContext;
use lodestone_world::block::BlockPos;
use lodestone_world::world::VoxelWorld;

use crate::config::{BlockRegion, ServerConfig, TickConfig};
use crate::rules::{random_tick, standard_rules};
use crate::TickError;

// ---------------------------------------------------------------------------
// TickInfo
// ---------------------------------------------------------------------------

/// Per-tick state handed to every system.
#[derive(Debug)]
pub struct TickInfo {
    /// Index of the tick being run, starting at 0.
    pub tick: u64,
    /// Simulation time at the start of this tick, in seconds.
    pub sim_time: f64,
    /// The loop's seeded RNG. Systems must use this and nothing else.
    pub rng: Pcg32,
    completed: Vec<CompletionReport>,
}

impl TickInfo {
    fn new(seed: u64) -> Self {
        Self {
            tick: 0,
            sim_time: 0.0,
            rng: Pcg32::seed_from_u64(seed),
            completed: Vec::new(),
        }
    }

    /// Hand a completion report to the tick's history.
    pub fn record(&mut self, report: CompletionReport) {
        self.completed.push(report);
    }

    pub fn record_all(&mut self, reports: impl IntoIterator<Item = CompletionReport>) {
        self.completed.extend(reports);
    }

    /// Reports recorded so far this tick.
    pub fn recorded(&self) -> &[CompletionReport] {
        &self.completed
    }
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and cleanup diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system, in execution order.
    pub system_times: Vec<(String, Duration)>,
    /// Random ticks that entered a phase.
    pub random_ticks: u32,
    /// Phases that were still open when the tick ended.
    pub leaked_phases: usize,
    /// Total time for the tick.
    pub total_time: Duration,
}

// ---------------------------------------------------------------------------
// SystemFn
// ---------------------------------------------------------------------------

/// A system run once per tick.
///
/// Systems get the tracking context and the tick's [`TickInfo`]. World
/// changes go through phases on the context; reports returned by
/// [`PhaseHandle::finish`](lodestone_tracker::tracking::PhaseHandle::finish)
/// should be passed to [`TickInfo::record`].
pub type SystemFn = fn(&mut TrackingContext, &mut TickInfo);

#[derive(Debug)]
struct RegisteredSystem {
    name: String,
    func: SystemFn,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// The fixed-timestep server loop.
pub struct TickLoop {
    tracking: TrackingContext,
    systems: Vec<RegisteredSystem>,
    info: TickInfo,
    tick_counter: u64,
    fixed_dt: f64,
    config: TickConfig,
    history: EventHistory,
    last_diagnostics: TickDiagnostics,
    halted: bool,
}

impl TickLoop {
    /// Create a loop around `tracking`.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is not positive and finite.
    pub fn new(tracking: TrackingContext, mut config: TickConfig) -> Self {
        assert!(
            config.fixed_dt > 0.0 && config.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        let region = config.random_tick_region;
        config.random_tick_region = BlockRegion::new(region.min, region.max);
        Self {
            tracking,
            systems: Vec::new(),
            info: TickInfo::new(config.seed),
            tick_counter: 0,
            fixed_dt: config.fixed_dt,
            config,
            history: EventHistory::new(),
            last_diagnostics: TickDiagnostics::default(),
            halted: false,
        }
    }

    /// Keep `ticks` ticks of history instead of the default 60.
    pub fn with_history(mut self, ticks: usize) -> Self {
        self.history = EventHistory::with_max_history(ticks);
        self
    }

    /// Build a server with an empty [`VoxelWorld`], the standard rules and
    /// `observer` from a validated configuration.
    pub fn from_config(
        config: &ServerConfig,
        observer: impl EventObserver + 'static,
    ) -> Result<Self, TickError> {
        config.validate()?;
        let tracking = TrackingContext::builder(VoxelWorld::new(config.world.clone()))
            .pipelines(standard_rules())
            .config(config.tracker.clone())
            .observer(observer)
            .build();
        let tick_loop = Self::new(tracking, config.tick.clone());
        Ok(match config.history_ticks {
            Some(ticks) => tick_loop.with_history(ticks),
            None => tick_loop,
        })
    }

    /// Register a system. Systems run in registration order.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, name: &str, func: SystemFn) {
        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );
        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func,
        });
    }

    /// Run one tick and return its record.
    pub fn tick(&mut self) -> Result<TickRecord, TickError> {
        if self.halted {
            return Err(TickError::Halted {
                tick: self.tick_counter,
            });
        }
        let tick_start = Instant::now();
        let tick = self.tick_counter;
        self.info.tick = tick;
        self.info.sim_time = self.sim_time();
        self.history.begin_tick(tick);

        // Systems, in registration order.
        let mut system_times = Vec::with_capacity(self.systems.len());
        for system in &self.systems {
            if self.tracking.is_poisoned() {
                break;
            }
            let start = Instant::now();
            (system.func)(&mut self.tracking, &mut self.info);
            system_times.push((system.name.clone(), start.elapsed()));
        }

        // Random block ticks.
        let random_ticks = self.run_random_ticks();

        // End-of-tick cleanup.
        let drained = self.tracking.drain_reports();
        let leaked = self.tracking.unwind_all();
        let leaked_phases = leaked.len();
        if leaked_phases > 0 {
            warn!(tick, leaked = leaked_phases, "phases left open at end of tick");
        }
        for report in self.info.completed.drain(..).chain(drained).chain(leaked) {
            self.history.record_report(&report);
        }

        self.last_diagnostics = TickDiagnostics {
            system_times,
            random_ticks,
            leaked_phases,
            total_time: tick_start.elapsed(),
        };

        if let Some(source) = self.tracking.take_fatal() {
            self.halted = true;
            error!(tick, error = %source, "fatal tracker error; halting tick loop");
            self.history.end_tick();
            return Err(TickError::Fatal { tick, source });
        }

        let record = self.history.end_tick();
        self.tick_counter += 1;
        trace!(tick, applied = record.applied, rejected = record.rejected, "tick complete");
        Ok(record)
    }

    fn run_random_ticks(&mut self) -> u32 {
        let region = self.config.random_tick_region;
        let mut ran = 0;
        for _ in 0..self.config.random_tick_speed {
            if self.tracking.is_poisoned() {
                break;
            }
            let rng = &mut self.info.rng;
            let pos = BlockPos::new(
                rng.gen_range(region.min.x..=region.max.x),
                rng.gen_range(region.min.y..=region.max.y),
                rng.gen_range(region.min.z..=region.max.z),
            );
            match random_tick(&mut self.tracking, rng, pos) {
                Ok(Some(report)) => {
                    ran += 1;
                    self.info.completed.push(report);
                }
                Ok(None) => {}
                Err(error) => debug!(at = %pos, %error, "random tick failed"),
            }
        }
        ran
    }

    /// Run `count` ticks, stopping at the first error.
    pub fn run_ticks(&mut self, count: u64) -> Result<Vec<TickRecord>, TickError> {
        (0..count).map(|_| self.tick()).collect()
    }

    // -- accessors ----------------------------------------------------------

    /// The number of ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// The current simulation time in seconds, computed as
    /// `tick_count * fixed_dt`.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.fixed_dt
    }

    pub fn tracking(&self) -> &TrackingContext {
        &self.tracking
    }

    /// Mutable access to the tracking context between ticks, for setup and
    /// for driving actions from outside the loop.
    pub fn tracking_mut(&mut self) -> &mut TrackingContext {
        &mut self.tracking
    }

    pub fn history(&self) -> &EventHistory {
        &self.history
    }

    /// The names of all registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }

    /// Whether a fatal error has stopped the loop.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn config(&self) -> &TickConfig {
        &self.config
    }

    /// Content digest of the world.
    pub fn state_hash(&self) -> String {
        self.tracking.world().state_hash()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use lodestone_tracker::prelude::*;
    use lodestone_world::prelude::*;

    use super::*;
    use crate::interaction::place_block;

    fn quiet() -> TickConfig {
        TickConfig {
            random_tick_speed: 0,
            ..Default::default()
        }
    }

    fn server(config: TickConfig) -> TickLoop {
        let tracking = TrackingContext::builder(VoxelWorld::default())
            .pipelines(standard_rules())
            .build();
        TickLoop::new(tracking, config)
    }

    // -- 1. Construction ----------------------------------------------------

    #[test]
    #[should_panic(expected = "fixed_dt must be positive and finite")]
    fn zero_dt_panics() {
        server(TickConfig {
            fixed_dt: 0.0,
            ..Default::default()
        });
    }

    #[test]
    #[should_panic(expected = "fixed_dt must be positive and finite")]
    fn infinite_dt_panics() {
        server(TickConfig {
            fixed_dt: f64::INFINITY,
            ..Default::default()
        });
    }

    #[test]
    #[should_panic(expected = "duplicate system name")]
    fn duplicate_system_panics() {
        let mut server = server(quiet());
        server.add_system("a", |_, _| {});
        server.add_system("a", |_, _| {});
    }

    #[test]
    fn from_config_applies_history_and_tracker_settings() {
        let config = ServerConfig {
            history_ticks: Some(2),
            tracker: TrackerConfig {
                max_cascade_depth: Some(4),
                ..Default::default()
            },
            tick: quiet(),
            ..Default::default()
        };
        let mut server = TickLoop::from_config(&config, NullObserver).unwrap();
        assert_eq!(server.tracking().config().max_cascade_depth, Some(4));
        server.run_ticks(5).unwrap();
        assert_eq!(server.history().history().len(), 2);
        assert!(server.history().record_at_tick(4).is_some());
        assert!(server.history().record_at_tick(2).is_none());
    }

    #[test]
    fn from_config_rejects_invalid_config() {
        let config = ServerConfig {
            tick: TickConfig {
                fixed_dt: -1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            TickLoop::from_config(&config, NullObserver),
            Err(TickError::InvalidConfig(_))
        ));
    }

    // -- 2. Time and systems ------------------------------------------------

    #[test]
    fn tick_advances_counter_and_time() {
        let mut server = server(TickConfig {
            fixed_dt: 0.1,
            ..quiet()
        });
        assert_eq!(server.tick_count(), 0);
        server.run_ticks(10).unwrap();
        assert_eq!(server.tick_count(), 10);
        assert!((server.sim_time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn systems_run_in_registration_order() {
        static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

        let mut server = server(quiet());
        server.add_system("first", |_, _| ORDER.lock().unwrap().push("first"));
        server.add_system("second", |_, _| ORDER.lock().unwrap().push("second"));
        server.add_system("third", |_, _| ORDER.lock().unwrap().push("third"));
        server.tick().unwrap();

        assert_eq!(*ORDER.lock().unwrap(), vec!["first", "second", "third"]);
        assert_eq!(server.system_names(), vec!["first", "second", "third"]);
        let timed: Vec<&str> = server
            .last_diagnostics()
            .system_times
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(timed, vec!["first", "second", "third"]);
    }

    #[test]
    fn systems_see_tick_index_and_time() {
        static LAST_TICK: AtomicU64 = AtomicU64::new(u64::MAX);

        let mut server = server(quiet());
        server.add_system("clock", |_, info| {
            LAST_TICK.store(info.tick, Ordering::SeqCst);
            assert!((info.sim_time - info.tick as f64 / 20.0).abs() < 1e-9);
        });
        server.run_ticks(3).unwrap();
        assert_eq!(LAST_TICK.load(Ordering::SeqCst), 2);
    }

    // -- 3. Reports and history ---------------------------------------------

    #[test]
    fn recorded_reports_reach_the_history() {
        let mut server = server(quiet());
        server.add_system("builder", |tc, info| {
            let pos = BlockPos::new(info.tick as i32, 64, 0);
            let report = place_block(tc, &Cause::Server, pos, BlockState::STONE);
            info.record(report.unwrap());
        });

        let record = server.tick().unwrap();
        assert_eq!(record.tick, 0);
        assert_eq!(record.applied, 1);
        assert_eq!(record.phases, vec!["packet.place_block".to_owned()]);
        server.tick().unwrap();

        let trail = server
            .history()
            .build_trail(&MutationTarget::Block(BlockPos::new(1, 64, 0)));
        assert_eq!(trail.steps.len(), 1);
        assert_eq!(trail.latest().unwrap().tick, 1);
        assert_eq!(server.history().totals().0, 2);
    }

    #[test]
    fn guard_dropped_phases_are_recorded() {
        let mut server = server(quiet());
        server.add_system("guarded", |tc, _| {
            let mut phase = tc
                .enter(
                    PhaseState::Plugin(PluginPhase::ScheduledTask),
                    PhaseContextBuilder::new(Cause::Plugin("demo".to_owned())),
                )
                .unwrap();
            phase
                .propose(Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::DIRT))
                .unwrap();
        });

        let record = server.tick().unwrap();
        assert_eq!(record.applied, 1);
        assert_eq!(server.last_diagnostics().leaked_phases, 0);
    }

    #[test]
    fn leaked_phases_are_completed_and_reported() {
        let mut server = server(quiet());
        server.add_system("leaky", |tc, _| {
            tc.begin(
                PhaseState::Tick(TickPhase::Block),
                PhaseContextBuilder::new(Cause::Server),
            )
            .unwrap();
            tc.propose(Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::STONE))
                .unwrap();
        });

        let record = server.tick().unwrap();
        assert_eq!(record.applied, 1);
        assert_eq!(server.last_diagnostics().leaked_phases, 1);
        assert!(server.tracking().is_idle());
        assert_eq!(
            server.tracking().world().block(BlockPos::new(0, 64, 0)),
            BlockState::STONE
        );
        assert!(server
            .tracking()
            .diagnostics()
            .history()
            .any(|d| matches!(d.error, TrackerError::LeakedPhase { .. })));
    }

    // -- 4. Random ticks ----------------------------------------------------

    #[test]
    fn random_ticks_stay_inside_the_region() {
        let mut server = server(TickConfig {
            random_tick_speed: 64,
            random_tick_region: BlockRegion::new(BlockPos::new(0, 64, 0), BlockPos::new(0, 64, 0)),
            ..Default::default()
        });
        {
            let tc = server.tracking_mut();
            tc.apply_untracked(&Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::GRASS))
                .unwrap();
            tc.apply_untracked(&Mutation::set_block(BlockPos::new(0, 65, 0), BlockState::STONE))
                .unwrap();
        }

        let record = server.tick().unwrap();
        // The first tick decays the covered grass; later ones find dirt.
        assert_eq!(server.last_diagnostics().random_ticks, 1);
        assert_eq!(record.phases, vec!["tick.random_block".to_owned()]);
        assert_eq!(
            server.tracking().world().block(BlockPos::new(0, 64, 0)),
            BlockState::DIRT
        );
    }

    #[test]
    fn hand_built_inverted_region_is_normalized() {
        let mut server = server(TickConfig {
            random_tick_speed: 16,
            random_tick_region: BlockRegion {
                min: BlockPos::new(2, 64, 2),
                max: BlockPos::new(-2, 64, -2),
            },
            ..Default::default()
        });
        server.run_ticks(3).unwrap();
        assert!(server.config().random_tick_region.is_ordered());
    }

    #[test]
    fn random_ticks_at_the_coordinate_edge() {
        let edge = BlockPos::new(i32::MAX, 64, i32::MIN);
        let mut server = server(TickConfig {
            random_tick_speed: 64,
            random_tick_region: BlockRegion::new(edge, edge),
            seed: 9,
            ..Default::default()
        });
        server
            .tracking_mut()
            .apply_untracked(&Mutation::set_block(edge, BlockState::GRASS))
            .unwrap();
        server.run_ticks(4).unwrap();
        assert_eq!(server.tracking().world().block(edge), BlockState::GRASS);
    }

    #[test]
    fn zero_speed_disables_random_ticks() {
        let mut server = server(quiet());
        server
            .tracking_mut()
            .apply_untracked(&Mutation::set_block(BlockPos::new(0, 64, 0), BlockState::GRASS))
            .unwrap();
        server.run_ticks(5).unwrap();
        assert_eq!(server.last_diagnostics().random_ticks, 0);
    }

    // -- 5. Fatal errors ----------------------------------------------------

    #[test]
    fn world_failure_halts_the_loop() {
        // No rules, so nothing guards the build height.
        let tracking = TrackingContext::builder(VoxelWorld::default()).build();
        let mut server = TickLoop::new(tracking, quiet());
        server.add_system("bad", |tc, info| {
            if info.tick == 1 {
                let mut phase = tc
                    .enter(
                        PhaseState::Tick(TickPhase::Block),
                        PhaseContextBuilder::new(Cause::Server),
                    )
                    .unwrap();
                phase
                    .propose(Mutation::set_block(BlockPos::new(0, 999, 0), BlockState::STONE))
                    .unwrap();
                assert!(phase.finish().unwrap_err().is_fatal());
            }
        });

        server.tick().unwrap();
        let err = server.tick().unwrap_err();
        assert!(matches!(err, TickError::Fatal { tick: 1, .. }));
        assert!(server.is_halted());
        assert_eq!(server.tick_count(), 1);
        assert!(matches!(server.tick(), Err(TickError::Halted { tick: 1 })));
    }
}
