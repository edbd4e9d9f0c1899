//! Idle-session cleanup: expiry evaluation and the periodic scheduler.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::warn;

/// True once a session has sat idle for its whole TTL.
///
/// An idle time exactly equal to the TTL counts as expired, so the next
/// reaper tick after the deadline collects the session.
pub fn is_expired(last_seen_at: DateTime<Utc>, idle_ttl_seconds: u64, now: DateTime<Utc>) -> bool {
    let deadline = last_seen_at + chrono::Duration::seconds(idle_ttl_seconds as i64);
    now >= deadline
}

/// Run a cleanup callback on a fixed interval until stopped.
pub struct CleanupScheduler {
    task: Option<JoinHandle<()>>,
}

impl CleanupScheduler {
    pub fn start<F, Fut>(interval: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = callback().await {
                    warn!(error = err, "cleanup callback failed");
                }
            }
        });
        Self { task: Some(task) }
    }

    pub async fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}
