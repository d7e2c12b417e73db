//! Tiered delivery of audit events
//!
//! 1. Enqueue onto the durable job queue, drained by [`super::worker`].
//! 2. Otherwise write directly through the circuit breaker.
//! 3. Otherwise one last plain write. If that fails too, the loss counts
//!    toward the failure alarm.
//!
//! Every tier appends through the one [`HashChain`]. Nothing here returns an
//! error to the caller of [`DeliveryPipeline::submit`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::alert::{AlertSink, FailureAlarm};
use super::breaker::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker};
use super::classification::{categorize_path, classify};
use super::hash_chain::HashChain;
use super::models::{AuditRecord, NewAuditEvent, PendingRecord, MAX_ACTION_LEN};
use super::queue::{JobQueue, RetryPolicy};
use super::redaction::Redactor;
use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};

/// Backlog and failure counters for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// `None` when running without the queue or when it cannot be read
    pub queue_depth: Option<i64>,
    pub failed_jobs: Option<i64>,
    pub breaker: BreakerStats,
    pub direct_failures_in_window: u32,
    pub alerts_emitted: u64,
    pub enqueued: u64,
    pub direct_writes: u64,
    pub fallback_writes: u64,
    pub lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    direct_writes: AtomicU64,
    fallback_writes: AtomicU64,
    lost: AtomicU64,
}

pub struct DeliveryPipeline {
    redactor: Redactor,
    max_body_bytes: usize,
    db_timeout: Duration,
    chain: Arc<HashChain>,
    queue: Option<Arc<dyn JobQueue>>,
    breaker: CircuitBreaker,
    alarm: FailureAlarm,
    retry: RetryPolicy,
    counters: Counters,
}

/// Decide whether boot may proceed after trying to attach the queue
pub fn resolve_queue(
    config: &AuditConfig,
    attempt: AuditResult<Arc<dyn JobQueue>>,
) -> AuditResult<Option<Arc<dyn JobQueue>>> {
    match attempt {
        Ok(queue) => Ok(Some(queue)),
        Err(err) if config.require_queue => Err(AuditError::Configuration(format!(
            "audit queue is required but could not be initialized: {err}"
        ))),
        Err(err) => {
            warn!(
                error = %err,
                "Audit queue unavailable, continuing with direct writes only"
            );
            Ok(None)
        },
    }
}

/// Cut `value` to at most `max` characters
fn bound_chars(value: String, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value,
    }
}

impl DeliveryPipeline {
    pub fn new(
        config: &AuditConfig,
        chain: Arc<HashChain>,
        queue: Option<Arc<dyn JobQueue>>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            redactor: Redactor::new(&config.sensitive_fields),
            max_body_bytes: config.max_body_bytes,
            db_timeout: config.db_timeout(),
            chain,
            queue,
            breaker: CircuitBreaker::new(BreakerConfig::from(config)),
            alarm: FailureAlarm::from_config(config, sink),
            retry: RetryPolicy::from_config(config),
            counters: Counters::default(),
        }
    }

    pub fn chain(&self) -> &Arc<HashChain> {
        &self.chain
    }

    pub fn queue(&self) -> Option<&Arc<dyn JobQueue>> {
        self.queue.as_ref()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn alarm(&self) -> &FailureAlarm {
        &self.alarm
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn db_timeout(&self) -> Duration {
        self.db_timeout
    }

    /// Redact, truncate and classify a raw event
    pub fn prepare(&self, event: NewAuditEvent) -> PendingRecord {
        let category = event
            .category
            .unwrap_or_else(|| categorize_path(&event.endpoint));
        let severity = classify(category, event.status_code);

        PendingRecord {
            actor_id: event.actor_id.map(|id| id.to_string()),
            tenant_id: event.tenant_id.map(|id| id.to_string()),
            action: bound_chars(event.action, MAX_ACTION_LEN),
            resource: bound_chars(event.resource, MAX_ACTION_LEN),
            resource_id: event.resource_id,
            method: event.method,
            endpoint: event.endpoint,
            ip_address: event.ip_address,
            user_agent: event.user_agent,
            status_code: event.status_code,
            request_body: event
                .request_body
                .map(|body| self.redactor.protect(&body, self.max_body_bytes)),
            response_data: event
                .response_data
                .map(|data| self.redactor.protect(&data, self.max_body_bytes)),
            error: event.error,
            severity,
            category,
        }
    }

    /// Deliver one event through the first tier that accepts it
    pub async fn submit(&self, event: NewAuditEvent) {
        let pending = self.prepare(event);

        if let Some(queue) = &self.queue {
            match tokio::time::timeout(self.db_timeout, queue.enqueue(&pending)).await {
                Ok(Ok(job_id)) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    debug!(job_id = %job_id, action = %pending.action, "Audit event queued");
                    return;
                },
                Ok(Err(err)) => {
                    warn!(error = %err, action = %pending.action, "Audit enqueue failed, writing directly");
                },
                Err(_) => {
                    warn!(
                        timeout_ms = self.db_timeout.as_millis() as u64,
                        action = %pending.action,
                        "Audit enqueue timed out, writing directly"
                    );
                },
            }
        }

        // Open circuit fails fast without queueing for the chain lock
        let guarded = if self.breaker.state() == BreakerState::Open {
            Err(AuditError::BreakerOpen)
        } else {
            let writer = self.chain.writer().await;
            let written = self.breaker.call(writer.append(pending.clone())).await;
            written
        };

        match guarded {
            Ok(record) => {
                self.counters.direct_writes.fetch_add(1, Ordering::Relaxed);
                debug!(record_id = %record.id, "Audit event written directly");
                return;
            },
            Err(err) => {
                warn!(
                    error = %err,
                    breaker = %self.breaker.state(),
                    action = %pending.action,
                    "Guarded audit write failed, attempting fallback write"
                );
            },
        }

        let action = pending.action.clone();
        match self.append_bounded(pending).await {
            Ok(record) => {
                self.counters.fallback_writes.fetch_add(1, Ordering::Relaxed);
                debug!(record_id = %record.id, "Audit event written by fallback");
            },
            Err(err) => {
                self.counters.lost.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, action = %action, "Audit event lost, every delivery tier failed");
                self.alarm.record_failure(&err.to_string());
            },
        }
    }

    /// Append under the storage timeout, started once the chain lock is held
    pub async fn append_bounded(&self, pending: PendingRecord) -> AuditResult<AuditRecord> {
        let writer = self.chain.writer().await;
        let written = tokio::time::timeout(self.db_timeout, writer.append(pending)).await;
        written.unwrap_or(Err(AuditError::StorageTimeout(self.db_timeout)))
    }

    pub async fn stats(&self) -> DeliveryStats {
        let (queue_depth, failed_jobs) = match &self.queue {
            Some(queue) => (queue.depth().await.ok(), queue.failed_count().await.ok()),
            None => (None, None),
        };

        DeliveryStats {
            queue_depth,
            failed_jobs,
            breaker: self.breaker.stats(),
            direct_failures_in_window: self.alarm.failures_in_window(),
            alerts_emitted: self.alarm.alerts_emitted(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            direct_writes: self.counters.direct_writes.load(Ordering::Relaxed),
            fallback_writes: self.counters.fallback_writes.load(Ordering::Relaxed),
            lost: self.counters.lost.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline")
            .field("max_body_bytes", &self.max_body_bytes)
            .field("queue", &self.queue.is_some())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::alert::tests::RecordingSink;
    use crate::audit::models::{Category, Severity};
    use crate::audit::queue::MemoryJobQueue;
    use crate::audit::redaction::REDACTED;
    use crate::audit::store::MemoryAuditStore;
    use docket_common::ObjectId;
    use serde_json::json;

    struct Harness {
        store: Arc<MemoryAuditStore>,
        queue: Arc<MemoryJobQueue>,
        sink: Arc<RecordingSink>,
        pipeline: DeliveryPipeline,
    }

    fn harness(config: AuditConfig, with_queue: bool) -> Harness {
        let store = Arc::new(MemoryAuditStore::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let sink = Arc::new(RecordingSink::default());
        let chain = Arc::new(HashChain::new(store.clone()));
        let attached: Option<Arc<dyn JobQueue>> = if with_queue {
            Some(queue.clone())
        } else {
            None
        };
        let pipeline = DeliveryPipeline::new(&config, chain, attached, sink.clone());
        Harness {
            store,
            queue,
            sink,
            pipeline,
        }
    }

    fn event(endpoint: &str, status: u16) -> NewAuditEvent {
        NewAuditEvent::builder()
            .actor_id(Some(ObjectId::parse("507f1f77bcf86cd799439011").unwrap()))
            .action("create_clients")
            .resource("clients")
            .method("POST")
            .endpoint(endpoint)
            .status_code(status)
            .request_body(json!({"password": "secret123", "email": "a@b.com"}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_prepare_protects_and_classifies() {
        let h = harness(AuditConfig::default(), false);
        let pending = h.pipeline.prepare(event("/api/v1/auth/login", 401));

        assert_eq!(pending.category, Category::Auth);
        assert_eq!(pending.severity, Severity::High);
        let body = pending.request_body.unwrap();
        assert_eq!(body["password"], REDACTED);
        assert_eq!(body["email"], "a@b.com");
        assert_eq!(pending.actor_id.as_deref(), Some("507f1f77bcf86cd799439011"));
    }

    #[test]
    fn test_prepare_truncates_large_bodies() {
        let config = AuditConfig {
            max_body_bytes: 256,
            ..Default::default()
        };
        let h = harness(config, false);
        let mut raw = event("/api/v1/clients", 201);
        raw.response_data = Some(json!({"notes": "x".repeat(1000)}));

        let pending = h.pipeline.prepare(raw);
        let data = pending.response_data.unwrap();
        assert_eq!(data["truncated"], true);
        assert!(serde_json::to_string(&data).unwrap().len() <= 256);
    }

    #[test]
    fn test_prepare_keeps_explicit_category_and_bounds_action() {
        let h = harness(AuditConfig::default(), false);
        let mut raw = event("/api/v1/clients", 403);
        raw.category = Some(Category::Security);
        raw.action = "a".repeat(300);

        let pending = h.pipeline.prepare(raw);
        assert_eq!(pending.category, Category::Security);
        assert_eq!(pending.severity, Severity::Critical);
        assert_eq!(pending.action.chars().count(), MAX_ACTION_LEN);
    }

    #[test]
    fn test_resolve_queue_modes() {
        let strict = AuditConfig {
            require_queue: true,
            ..Default::default()
        };
        let err = resolve_queue(&strict, Err(AuditError::QueueUnavailable("down".into())));
        assert!(matches!(err, Err(AuditError::Configuration(_))));

        let lenient = AuditConfig::default();
        let none = resolve_queue(&lenient, Err(AuditError::QueueUnavailable("down".into())));
        assert!(none.unwrap().is_none());

        let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new());
        assert!(resolve_queue(&strict, Ok(queue)).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_submit_prefers_queue() {
        let h = harness(AuditConfig::default(), true);
        h.pipeline.submit(event("/api/v1/clients", 201)).await;

        assert_eq!(h.queue.jobs().len(), 1);
        assert!(h.store.is_empty().await);
        assert_eq!(h.pipeline.stats().await.enqueued, 1);
    }

    #[tokio::test]
    async fn test_queue_unavailable_falls_back_to_direct_write() {
        let h = harness(AuditConfig::default(), true);
        h.queue.set_unavailable(true);

        h.pipeline.submit(event("/api/v1/clients", 201)).await;
        h.pipeline.submit(event("/api/v1/clients", 201)).await;

        assert_eq!(h.store.len().await, 2);
        let verification = h.pipeline.chain().verify_chain(10).await.unwrap();
        assert!(verification.valid);

        let stats = h.pipeline.stats().await;
        assert_eq!(stats.direct_writes, 2);
        assert_eq!(stats.breaker.state, BreakerState::Closed);
        assert_eq!(stats.breaker.window_successes, 2);
        assert_eq!(stats.queue_depth, None);
    }

    #[tokio::test]
    async fn test_total_failure_raises_alert_at_threshold() {
        let config = AuditConfig {
            alert_threshold: 3,
            ..Default::default()
        };
        let h = harness(config, false);
        h.store.set_failing(true);

        for _ in 0..3 {
            h.pipeline.submit(event("/api/v1/clients", 201)).await;
        }

        // guarded and fallback write per event
        assert_eq!(h.store.insert_attempts(), 6);
        assert_eq!(h.sink.count(), 1);
        let stats = h.pipeline.stats().await;
        assert_eq!(stats.lost, 3);
        assert_eq!(stats.alerts_emitted, 1);
        assert_eq!(stats.direct_failures_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_timeouts_open_breaker_then_probe() {
        let config = AuditConfig {
            db_timeout_ms: 100,
            ..Default::default()
        };
        let h = harness(config, false);
        h.store.set_write_delay(Duration::from_secs(1));

        for _ in 0..5 {
            h.pipeline.submit(event("/api/v1/clients", 201)).await;
        }
        assert_eq!(h.pipeline.breaker().state(), BreakerState::Open);

        // Open circuit skips straight to the fallback write
        h.store.set_write_delay(Duration::ZERO);
        h.pipeline.submit(event("/api/v1/clients", 201)).await;
        assert_eq!(h.pipeline.breaker().state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(h.pipeline.breaker().state(), BreakerState::HalfOpen);
        h.pipeline.submit(event("/api/v1/clients", 201)).await;
        assert_eq!(h.pipeline.breaker().state(), BreakerState::Closed);

        let stats = h.pipeline.stats().await;
        assert_eq!(stats.direct_writes, 1);
        assert!(h.pipeline.chain().verify_chain(100).await.unwrap().valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_storage_is_bounded_in_every_tier() {
        let config = AuditConfig {
            db_timeout_ms: 100,
            alert_threshold: 1,
            ..Default::default()
        };
        let h = harness(config, false);
        h.store.set_write_delay(Duration::from_secs(24 * 60 * 60));

        let started = tokio::time::Instant::now();
        h.pipeline.submit(event("/api/v1/clients", 201)).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        let stats = h.pipeline.stats().await;
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.fallback_writes, 0);
        assert_eq!(h.sink.count(), 1);

        // The chain lock was released with the abandoned write
        h.store.set_write_delay(Duration::ZERO);
        h.pipeline.submit(event("/api/v1/clients", 201)).await;
        assert_eq!(h.store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_the_chain_lock_is_not_a_storage_failure() {
        let config = AuditConfig {
            db_timeout_ms: 100,
            ..Default::default()
        };
        let h = harness(config, false);
        h.store.set_write_delay(Duration::from_millis(80));

        // Six writers queue behind each other for well over the timeout
        let submits = (0..6).map(|_| h.pipeline.submit(event("/api/v1/clients", 201)));
        futures::future::join_all(submits).await;

        let stats = h.pipeline.stats().await;
        assert_eq!(stats.direct_writes, 6);
        assert_eq!(stats.fallback_writes, 0);
        assert_eq!(stats.breaker.window_failures, 0);
        assert_eq!(stats.breaker.state, BreakerState::Closed);
        assert!(h.pipeline.chain().verify_chain(10).await.unwrap().valid);
    }
}
