//! Scheduled sweep of the quota store.
//!
//! The reaper is an explicit task owned by the process lifecycle rather than
//! a free-floating timer: `main` spawns it with a cancellation token and
//! awaits it on shutdown, and tests can start and stop it deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::rate_limiting::{now_ms, QuotaStore};

pub fn spawn_reaper(
    store: Arc<QuotaStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so sweeps start one full
        // interval after startup
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Reaper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let stats = store.sweep(now_ms());
                    tracing::info!(
                        removed = stats.removed,
                        active = stats.active,
                        "Swept quota store"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;

    use crate::config_parser::LimitsConfig;
    use crate::identity::resolve_user_key;

    #[tokio::test(start_paused = true)]
    async fn test_reaper_sweeps_on_interval_and_stops_on_cancel() {
        let store = Arc::new(QuotaStore::new(LimitsConfig::default()));
        let key = resolve_user_key(&HeaderMap::new());
        // Plant a user whose entire history is far outside the retention
        // window and idle past the eviction threshold
        let long_ago = now_ms() - 48 * 3600 * 1000;
        store.try_admit(&key, long_ago).unwrap();
        assert_eq!(store.active_users(), 1);

        let cancel = CancellationToken::new();
        let handle = spawn_reaper(store.clone(), Duration::from_secs(3600), cancel.clone());
        // Let the task register its timer before advancing the clock
        tokio::task::yield_now().await;

        // Before the first interval elapses, nothing has been swept
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(store.active_users(), 1);

        tokio::time::advance(Duration::from_secs(3600)).await;
        // Let the spawned task run its sweep
        tokio::task::yield_now().await;
        assert_eq!(store.active_users(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
