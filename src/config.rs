//! Engine configuration.
//!
//! Controls default freshness/retention windows and background sweep cadence.

use std::time::Duration;

use serde::Deserialize;

// Default values for engine configuration
const DEFAULT_STALE_WINDOW_MS: u64 = 30_000;
const DEFAULT_RETENTION_WINDOW_MS: u64 = 300_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_EVENT_LOG_LIMIT: usize = 1_000;

/// Engine configuration.
///
/// Per-query policies may override the default windows; these values apply
/// when a caller does not specify its own.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default duration (ms) a fresh entry is served without refetching.
    pub stale_window_ms: u64,
    /// Default duration (ms) an unobserved entry is retained before eviction.
    pub retention_window_ms: u64,
    /// Background eviction sweep interval (ms).
    pub sweep_interval_ms: u64,
    /// Maximum retained engine events before the oldest are dropped.
    pub event_log_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_window_ms: DEFAULT_STALE_WINDOW_MS,
            retention_window_ms: DEFAULT_RETENTION_WINDOW_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            event_log_limit: DEFAULT_EVENT_LOG_LIMIT,
        }
    }
}

impl EngineConfig {
    /// Default stale window as a `Duration`.
    pub fn stale_window(&self) -> Duration {
        Duration::from_millis(self.stale_window_ms)
    }

    /// Default retention window as a `Duration`.
    pub fn retention_window(&self) -> Duration {
        Duration::from_millis(self.retention_window_ms)
    }

    /// Sweep interval as a `Duration`, clamped to at least 1ms so an interval
    /// timer never spins.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}
