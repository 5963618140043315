//! Engine tunables. Defaults are the production constants; tests compress
//! the timer periods to keep suites fast. A period of zero disables the
//! corresponding background task.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Outbox items pushed per remote batch during a drain.
    pub batch_size: usize,
    /// Pause between batches, to stay under remote write throttling.
    pub batch_gap: Duration,

    /// Real-failure retry budget before an item dead-letters.
    pub max_retries: u32,
    /// Network-failure retry budget. Far more generous: a flaky link is not
    /// the item's fault.
    pub max_network_retries: u32,
    pub real_backoff_base: Duration,
    pub real_backoff_cap: Duration,
    pub network_backoff_base: Duration,
    pub network_backoff_cap: Duration,

    pub high_priority_period: Duration,
    pub normal_period: Duration,
    pub low_priority_period: Duration,
    /// Full hydration is forced at this cadence even when the queue is idle.
    pub baseline_hydration_period: Duration,
    pub dlq_reaper_period: Duration,
    /// Dead-letter items older than this are eligible for resurrection.
    pub dlq_resurrect_age: Duration,
    pub watchdog_period: Duration,
    /// A sync lock held longer than this is considered stuck and released.
    pub stuck_sync_threshold: Duration,

    /// Two updates within this window count as concurrent for additive
    /// merging.
    pub concurrency_window_ms: i64,
    /// Outbox items older than this with half their retry budget spent are
    /// dropped at load time.
    pub outbox_expiry_ms: i64,

    pub processed_ids_cap: usize,
    pub processed_ids_trim: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_gap: Duration::from_millis(100),
            max_retries: 3,
            max_network_retries: 15,
            real_backoff_base: Duration::from_secs(1),
            real_backoff_cap: Duration::from_secs(5 * 60),
            network_backoff_base: Duration::from_secs(5),
            network_backoff_cap: Duration::from_secs(60),
            high_priority_period: Duration::from_secs(5),
            normal_period: Duration::from_secs(15),
            low_priority_period: Duration::from_secs(60),
            baseline_hydration_period: Duration::from_secs(5 * 60),
            dlq_reaper_period: Duration::from_secs(10 * 60),
            dlq_resurrect_age: Duration::from_secs(60 * 60),
            watchdog_period: Duration::from_secs(2 * 60),
            stuck_sync_threshold: Duration::from_secs(5 * 60),
            concurrency_window_ms: 5 * 60 * 1000,
            outbox_expiry_ms: 24 * 60 * 60 * 1000,
            processed_ids_cap: 1000,
            processed_ids_trim: 500,
        }
    }
}

impl EngineConfig {
    /// A configuration with every background timer disabled, for tests that
    /// drive the engine by hand.
    pub fn manual() -> Self {
        Self {
            batch_gap: Duration::ZERO,
            high_priority_period: Duration::ZERO,
            normal_period: Duration::ZERO,
            low_priority_period: Duration::ZERO,
            baseline_hydration_period: Duration::ZERO,
            dlq_reaper_period: Duration::ZERO,
            watchdog_period: Duration::ZERO,
            ..Self::default()
        }
    }
}
