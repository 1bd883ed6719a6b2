//! Background reclaim of long-expired session records.
//!
//! Expired records already read as unknown, so sweeping only bounds memory.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::delta::DeltaEngine;
use crate::store::SessionStore;

/// Sweeper timing.
#[derive(Clone, Copy, Debug)]
pub struct SweepConfig {
    /// Time between passes.
    pub interval: Duration,
    /// How long past expiry a record is kept.
    pub grace: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(600),
        }
    }
}

/// Counts from one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Session records removed.
    pub sessions: usize,
    /// Delta states removed.
    pub delta_states: usize,
}

/// Run one pass: purge sessions past `grace`, then drop delta state that
/// no longer has a session record behind it.
pub fn sweep_once(store: &SessionStore, engine: &DeltaEngine, grace: Duration) -> SweepReport {
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::MAX);
    let removed = store.purge_expired(grace);
    let mut delta_states = removed.iter().filter(|id| engine.forget(id)).count();
    // States created for ids the store never knew.
    delta_states += engine.retain(|id| store.is_tracked(id));
    SweepReport {
        sessions: removed.len(),
        delta_states,
    }
}

/// Spawn the periodic sweeper. It stops when `cancel` fires.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    engine: Arc<DeltaEngine>,
    config: SweepConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        let _ = ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("session sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = sweep_once(&store, &engine, config.grace);
                    if report.sessions > 0 || report.delta_states > 0 {
                        info!(
                            sessions = report.sessions,
                            delta_states = report.delta_states,
                            "swept expired session state"
                        );
                    } else {
                        debug!("sweep found nothing to reclaim");
                    }
                }
            }
        }
    })
}
