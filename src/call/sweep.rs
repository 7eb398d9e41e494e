// intercom-signaling-service/src/call/sweep.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::call::store::SessionStore;

#[derive(Debug, Clone, Copy)]
pub struct SweepPolicy {
    pub ring_timeout: Duration,
    pub call_timeout: Duration,
    pub interval: Duration,
}

/// Periodically evicts abandoned sessions until `shutdown` flips to true.
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    policy: SweepPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(policy.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            event = "SESSION_SWEEP_ACTIVE",
            ring_timeout_secs = policy.ring_timeout.as_secs(),
            call_timeout_secs = policy.call_timeout.as_secs(),
            "🧹 Session sweeper started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let evicted = store.cleanup_timed_out(policy.ring_timeout, policy.call_timeout);
                    if evicted > 0 {
                        info!(event = "SESSION_SWEEP", evicted, remaining = store.len(), "Timed out sessions evicted");
                    } else {
                        debug!(event = "SESSION_SWEEP", remaining = store.len(), "Nothing to evict");
                    }
                }
            }
        }
        info!(event = "SESSION_SWEEP_STOPPED", "Session sweeper stopped");
    })
}
