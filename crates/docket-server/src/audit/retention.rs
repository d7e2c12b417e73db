//! Retention sweeper
//!
//! Deletes records older than the retention period in bounded batches so a
//! large backlog never turns into one long-running delete.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::store::AuditStore;
use crate::config::AuditConfig;
use crate::error::AuditResult;

#[derive(Clone)]
pub struct RetentionSweeper {
    store: Arc<dyn AuditStore>,
    retention: chrono::Duration,
    batch_size: i64,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn AuditStore>, config: &AuditConfig) -> Self {
        Self {
            store,
            retention: chrono::Duration::days(i64::from(config.retention_days)),
            batch_size: config.retention_batch_size,
            interval: config.retention_sweep_interval(),
        }
    }

    /// Oldest creation time still retained at `now`
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.retention
    }

    /// Delete every expired record; returns how many were removed
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> AuditResult<u64> {
        let cutoff = self.cutoff(now);
        let mut removed = 0u64;

        loop {
            let deleted = self.store.purge_older_than(cutoff, self.batch_size).await?;
            removed += deleted;
            if deleted < self.batch_size as u64 {
                break;
            }
        }

        if removed > 0 {
            info!(removed, cutoff = %cutoff, "Purged expired audit records");
        } else {
            debug!(cutoff = %cutoff, "No expired audit records");
        }

        Ok(removed)
    }

    /// Sweep on every interval tick until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once(Utc::now()).await {
                        warn!(error = %err, "Audit retention sweep failed");
                    }
                },
            }
        }
        debug!("Audit retention sweeper stopped");
    }
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("retention_days", &self.retention.num_days())
            .field("batch_size", &self.batch_size)
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::store::tests::record;
    use crate::audit::store::MemoryAuditStore;

    fn sweeper(store: Arc<MemoryAuditStore>, batch: i64) -> RetentionSweeper {
        let config = AuditConfig {
            retention_days: 30,
            retention_batch_size: batch,
            ..Default::default()
        };
        RetentionSweeper::new(store, &config)
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_in_batches() {
        let store = Arc::new(MemoryAuditStore::new());
        let now = Utc::now();
        for i in 1..=7 {
            store
                .insert(&record(i, now - chrono::Duration::days(40 + i)))
                .await
                .unwrap();
        }
        store.insert(&record(8, now - chrono::Duration::days(29))).await.unwrap();
        store.insert(&record(9, now)).await.unwrap();

        let removed = sweeper(store.clone(), 3).sweep_once(now).await.unwrap();
        assert_eq!(removed, 7);

        let left: Vec<i64> = store.snapshot().await.iter().map(|r| r.sequence).collect();
        assert_eq!(left, vec![8, 9]);
    }

    #[tokio::test]
    async fn test_sweep_exact_batch_multiple_terminates() {
        let store = Arc::new(MemoryAuditStore::new());
        let now = Utc::now();
        for i in 1..=4 {
            store.insert(&record(i, now - chrono::Duration::days(60))).await.unwrap();
        }
        assert_eq!(sweeper(store.clone(), 2).sweep_once(now).await.unwrap(), 4);
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_cutoff_uses_retention_days() {
        let store = Arc::new(MemoryAuditStore::new());
        let now = Utc::now();
        assert_eq!(sweeper(store, 10).cutoff(now), now - chrono::Duration::days(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryAuditStore::new());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sweeper(store, 10).run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
