//! Server configuration.
//!
//! Plain structs with defaults. A whole [`ServerConfig`] can be loaded from
//! JSON; every field is optional and falls back to its default.
//!
//! # Example
//!
//! ```
//! use lodestone_server::config::ServerConfig;
//!
//! let config = ServerConfig::from_json_str(r#"{ "tick": { "seed": 42 } }"#).unwrap();
//! assert_eq!(config.tick.seed, 42);
//! assert_eq!(config.tick.random_tick_speed, 3);
//! ```

use serde::{Deserialize, Serialize};

use lodestone_tracker::TrackerConfig;
use lodestone_world::block::BlockPos;
use lodestone_world::world::WorldConfig;

use crate::TickError;

// ---------------------------------------------------------------------------
// BlockRegion
// ---------------------------------------------------------------------------

/// Inclusive box of block positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRegion {
    pub min: BlockPos,
    pub max: BlockPos,
}

impl BlockRegion {
    /// The box spanned by two corners, in any order.
    pub fn new(a: BlockPos, b: BlockPos) -> Self {
        Self {
            min: BlockPos::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: BlockPos::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        (self.min.x..=self.max.x).contains(&pos.x)
            && (self.min.y..=self.max.y).contains(&pos.y)
            && (self.min.z..=self.max.z).contains(&pos.z)
    }

    /// Whether `min` is at or below `max` on every axis.
    ///
    /// Always true for regions built with [`BlockRegion::new`]; a
    /// deserialized region may not be.
    pub fn is_ordered(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Number of cells in the box, saturating at `u64::MAX`. Zero for a
    /// region that is not ordered.
    pub fn volume(&self) -> u64 {
        let span = |lo: i32, hi: i32| u64::try_from(i64::from(hi) - i64::from(lo) + 1).unwrap_or(0);
        span(self.min.x, self.max.x)
            .saturating_mul(span(self.min.y, self.max.y))
            .saturating_mul(span(self.min.z, self.max.z))
    }
}

impl Default for BlockRegion {
    /// Two chunks across, the lower half of the default build height.
    fn default() -> Self {
        Self {
            min: BlockPos::new(-16, 0, -16),
            max: BlockPos::new(15, 127, 15),
        }
    }
}

// ---------------------------------------------------------------------------
// TickConfig
// ---------------------------------------------------------------------------

/// Configuration for the tick loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Random block ticks per tick. 0 disables them.
    pub random_tick_speed: u32,
    /// Where random ticks land.
    pub random_tick_region: BlockRegion,
    /// Seed for the tick loop's RNG.
    pub seed: u64,
}

impl Default for TickConfig {
    /// 20 ticks per second, three random ticks per tick.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 20.0,
            random_tick_speed: 3,
            random_tick_region: BlockRegion::default(),
            seed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Everything needed to build a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub tick: TickConfig,
    pub tracker: TrackerConfig,
    pub world: WorldConfig,
    /// How many ticks of committed-change history to keep.
    pub history_ticks: Option<usize>,
}

impl ServerConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, TickError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TickError> {
        let dt = self.tick.fixed_dt;
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(TickError::InvalidConfig(format!(
                "tick.fixed_dt must be positive and finite, got {dt}"
            )));
        }
        if self.world.min_y > self.world.max_y {
            return Err(TickError::InvalidConfig(format!(
                "world.min_y ({}) is above world.max_y ({})",
                self.world.min_y, self.world.max_y
            )));
        }
        let region = &self.tick.random_tick_region;
        if !region.is_ordered() {
            return Err(TickError::InvalidConfig(format!(
                "tick.random_tick_region has min {} above max {} on some axis",
                region.min, region.max
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
