//! Engine configuration.
//!
//! Loaded via the `config` crate from `TIDEWATER__*` environment variables,
//! e.g. `TIDEWATER__MAX_WORKERS=4` or `TIDEWATER__IO_TIMEOUTS__READ_SECS=30`.
//! Every field has a default, so an empty environment yields
//! [`EngineConfig::default`].

use rootcause::prelude::Report;
use serde::Deserialize;
use std::time::Duration;

/// Limits and pool sizes for the graph engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent executor slots.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-node execution limit for nodes without their own `timeout_secs`.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Connect/read/write limits handed to I/O-bound executors.
    #[serde(default)]
    pub io_timeouts: IoTimeouts,

    /// Hard upper bound for a loop node's `loop_count`.
    #[serde(default = "default_max_loop_count")]
    pub max_loop_count: u32,

    /// Upper bound for an iteration node's `parallelism`.
    #[serde(default = "default_max_iteration_parallelism")]
    pub max_iteration_parallelism: usize,

    /// Total node dispatches allowed in one run, container bodies included.
    #[serde(default = "default_max_execution_steps")]
    pub max_execution_steps: u32,

    /// Wall-clock limit for one run.
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
}

/// Timeouts executors should apply to their own I/O.
///
/// The engine does not enforce these itself; it only enforces the overall
/// per-node timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct IoTimeouts {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,
    #[serde(default = "default_write_secs")]
    pub write_secs: u64,
}

fn default_max_workers() -> usize {
    10
}

fn default_node_timeout_secs() -> u64 {
    600
}

fn default_max_loop_count() -> u32 {
    100
}

fn default_max_iteration_parallelism() -> usize {
    10
}

fn default_max_execution_steps() -> u32 {
    500
}

fn default_max_execution_time_secs() -> u64 {
    1200
}

fn default_connect_secs() -> u64 {
    10
}

fn default_read_secs() -> u64 {
    60
}

fn default_write_secs() -> u64 {
    20
}

impl Default for IoTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            read_secs: default_read_secs(),
            write_secs: default_write_secs(),
        }
    }
}

impl IoTimeouts {
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    #[must_use]
    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            node_timeout_secs: default_node_timeout_secs(),
            io_timeouts: IoTimeouts::default(),
            max_loop_count: default_max_loop_count(),
            max_iteration_parallelism: default_max_iteration_parallelism(),
            max_execution_steps: default_max_execution_steps(),
            max_execution_time_secs: default_max_execution_time_secs(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `TIDEWATER__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, Report<config::ConfigError>> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TIDEWATER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    #[must_use]
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs)
    }

    /// Clamps a configured loop count to `max_loop_count`.
    #[must_use]
    pub fn clamp_loop_count(&self, requested: u32) -> u32 {
        requested.min(self.max_loop_count)
    }

    /// Effective concurrency for an iteration node, at least 1.
    #[must_use]
    pub fn clamp_parallelism(&self, requested: usize) -> usize {
        requested.clamp(1, self.max_iteration_parallelism.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_has_correct_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.node_timeout(), Duration::from_secs(600));
        assert_eq!(config.max_loop_count, 100);
        assert_eq!(config.max_execution_steps, 500);
        assert_eq!(config.max_execution_time(), Duration::from_secs(1200));
        assert_eq!(config.io_timeouts.read(), Duration::from_secs(60));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "max_workers": 2,
            "io_timeouts": {"read_secs": 5}
        }))
        .expect("valid config");
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.io_timeouts.read_secs, 5);
        assert_eq!(config.io_timeouts.connect_secs, 10);
        assert_eq!(config.max_iteration_parallelism, 10);
    }

    #[test]
    fn clamps_loop_count_and_parallelism() {
        let config = EngineConfig {
            max_loop_count: 3,
            max_iteration_parallelism: 4,
            ..EngineConfig::default()
        };
        assert_eq!(config.clamp_loop_count(10), 3);
        assert_eq!(config.clamp_loop_count(2), 2);
        assert_eq!(config.clamp_parallelism(0), 1);
        assert_eq!(config.clamp_parallelism(16), 4);
    }
}
