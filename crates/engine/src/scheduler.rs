//! Background tasks: the three drain/hydration cadences, the dead-letter
//! reaper, the stuck-sync watchdog, and the reconnect listener.
//!
//! Every loop follows the same shape: a `tokio::time::interval` with missed
//! ticks skipped, raced against the shutdown watch channel. A period of
//! zero disables the task.

use crate::drain::run_drain;
use crate::engine::EngineShared;
use crate::hydrator::hydrate_all;
use std::sync::Arc;
use std::time::Duration;
use tillsync_types::time::now_ms;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

pub(crate) fn spawn_tasks(
    shared: Arc<Mutex<EngineShared>>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_high_priority(shared.clone(), shutdown_rx.clone())),
        tokio::spawn(run_normal(shared.clone(), shutdown_rx.clone())),
        tokio::spawn(run_low_priority(shared.clone(), shutdown_rx.clone())),
        tokio::spawn(run_dlq_reaper(shared.clone(), shutdown_rx.clone())),
        tokio::spawn(run_watchdog(shared.clone(), shutdown_rx.clone())),
        tokio::spawn(run_network_listener(shared, shutdown_rx)),
    ]
}

fn make_interval(period: Duration) -> time::Interval {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// High-priority cadence: when assignment flags, balances, or organization
/// settings are queued, push them and pull peers' view straight after.
async fn run_high_priority(shared: Arc<Mutex<EngineShared>>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = { shared.lock().await.config.high_priority_period };
    if period.is_zero() {
        tracing::info!(target: "scheduler", "high-priority task disabled (period=0)");
        let _ = shutdown_rx.changed().await;
        return;
    }

    let mut ticker = make_interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let has_work = { shared.lock().await.outbox.has_high_priority_work() };
                if !has_work {
                    continue;
                }
                if let Err(e) = run_drain(&shared).await {
                    tracing::error!(target: "scheduler", error = %e, "high-priority drain failed");
                    continue;
                }
                if let Err(e) = hydrate_all(&shared, false).await {
                    tracing::error!(target: "scheduler", error = %e, "high-priority hydration failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

/// Normal cadence: drain whenever the queue is non-empty, and force a full
/// hydration at the baseline period even when idle.
async fn run_normal(shared: Arc<Mutex<EngineShared>>, mut shutdown_rx: watch::Receiver<bool>) {
    let (period, baseline) = {
        let guard = shared.lock().await;
        (
            guard.config.normal_period,
            guard.config.baseline_hydration_period,
        )
    };
    if period.is_zero() {
        tracing::info!(target: "scheduler", "normal task disabled (period=0)");
        let _ = shutdown_rx.changed().await;
        return;
    }

    let mut ticker = make_interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (queued, last_full) = {
                    let guard = shared.lock().await;
                    (
                        guard.outbox.queue_len() + guard.outbox.bundle_len(),
                        guard.last_full_hydration,
                    )
                };

                let baseline_due = !baseline.is_zero()
                    && now_ms() - last_full >= baseline.as_millis() as i64;

                if queued > 0 {
                    if let Err(e) = run_drain(&shared).await {
                        tracing::error!(target: "scheduler", error = %e, "drain failed");
                        continue;
                    }
                }
                if queued > 0 || baseline_due {
                    if let Err(e) = hydrate_all(&shared, false).await {
                        tracing::error!(target: "scheduler", error = %e, "hydration failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

/// Low-priority cadence: a passive drain plus processed-id ledger upkeep.
async fn run_low_priority(shared: Arc<Mutex<EngineShared>>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = { shared.lock().await.config.low_priority_period };
    if period.is_zero() {
        tracing::info!(target: "scheduler", "low-priority task disabled (period=0)");
        let _ = shutdown_rx.changed().await;
        return;
    }

    let mut ticker = make_interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_drain(&shared).await {
                    tracing::error!(target: "scheduler", error = %e, "passive drain failed");
                }
                let mut guard = shared.lock().await;
                let config = guard.config.clone();
                if let Err(e) = guard.outbox.trim_processed(&config).await {
                    tracing::error!(target: "scheduler", error = %e, "processed-id trim failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

/// Dead-letter reaper: items that have sat in the DLQ long enough get
/// another life.
async fn run_dlq_reaper(shared: Arc<Mutex<EngineShared>>, mut shutdown_rx: watch::Receiver<bool>) {
    let (period, min_age) = {
        let guard = shared.lock().await;
        (guard.config.dlq_reaper_period, guard.config.dlq_resurrect_age)
    };
    if period.is_zero() {
        tracing::info!(target: "scheduler", "dlq reaper disabled (period=0)");
        let _ = shutdown_rx.changed().await;
        return;
    }

    let mut ticker = make_interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let resurrected = {
                    let mut guard = shared.lock().await;
                    match guard.outbox.resurrect_dlq(Some(min_age), now_ms()).await {
                        Ok(count) => count,
                        Err(e) => {
                            tracing::error!(target: "scheduler", error = %e, "dlq resurrection failed");
                            continue;
                        }
                    }
                };
                if resurrected > 0 {
                    if let Err(e) = run_drain(&shared).await {
                        tracing::error!(target: "scheduler", error = %e, "post-reap drain failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

/// Stuck-sync watchdog: a drain that died without clearing the lock would
/// otherwise block syncing forever.
async fn run_watchdog(shared: Arc<Mutex<EngineShared>>, mut shutdown_rx: watch::Receiver<bool>) {
    let (period, threshold) = {
        let guard = shared.lock().await;
        (
            guard.config.watchdog_period,
            guard.config.stuck_sync_threshold,
        )
    };
    if period.is_zero() {
        tracing::info!(target: "scheduler", "watchdog disabled (period=0)");
        let _ = shutdown_rx.changed().await;
        return;
    }

    let mut ticker = make_interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut guard = shared.lock().await;
                if let Some(started) = guard.sync_started_at {
                    let held_for = now_ms() - started;
                    if held_for > threshold.as_millis() as i64 {
                        tracing::warn!(
                            target: "scheduler",
                            held_for_ms = held_for,
                            "sync lock stuck, force releasing"
                        );
                        guard.is_syncing = false;
                        guard.sync_started_at = None;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}

/// Reconnect listener: the false -> true edge resurrects the whole DLQ and
/// drains immediately.
async fn run_network_listener(
    shared: Arc<Mutex<EngineShared>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut network_rx = { shared.lock().await.network.subscribe() };
    let mut was_online = *network_rx.borrow();

    loop {
        tokio::select! {
            changed = network_rx.changed() => {
                if changed.is_err() {
                    // Monitor dropped; nothing further to listen for.
                    let _ = shutdown_rx.changed().await;
                    return;
                }
                let online = *network_rx.borrow();
                let came_online = online && !was_online;
                was_online = online;
                if !came_online {
                    continue;
                }
                tracing::info!(target: "scheduler", "network restored, resurrecting dead letters");
                {
                    let mut guard = shared.lock().await;
                    if let Err(e) = guard.outbox.resurrect_dlq(None, now_ms()).await {
                        tracing::error!(target: "scheduler", error = %e, "reconnect resurrection failed");
                    }
                }
                if let Err(e) = run_drain(&shared).await {
                    tracing::error!(target: "scheduler", error = %e, "reconnect drain failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
        }
    }
}
