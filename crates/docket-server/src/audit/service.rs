//! The audit service handle shared by the middleware, routes and callers
//!
//! [`AuditService`] is cheap to clone. Build it once at startup with
//! [`AuditService::builder`], then call [`AuditService::start`] to launch the
//! queue workers and the retention sweeper.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::alert::{AlertSink, LogAlertSink};
use super::hash_chain::HashChain;
use super::models::{
    AuditFilter, AuditHealth, AuditPage, AuditRecord, ChainVerification, NewAuditEvent,
    DEFAULT_VERIFY_LIMIT,
};
use super::pipeline::{DeliveryPipeline, DeliveryStats};
use super::queue::{AuditJob, JobQueue};
use super::retention::RetentionSweeper;
use super::store::AuditStore;
use super::worker::WorkerPool;
use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};

/// Records examined by the health check's integrity spot check
pub const HEALTH_VERIFY_LIMIT: i64 = 100;

struct Inner {
    config: AuditConfig,
    store: Arc<dyn AuditStore>,
    pipeline: Arc<DeliveryPipeline>,
    /// Submissions handed off by [`AuditService::spawn_log_event`]
    in_flight: TaskTracker,
}

#[derive(Clone)]
pub struct AuditService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AuditService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditService")
            .field("pipeline", &self.inner.pipeline)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct AuditServiceBuilder {
    config: Option<AuditConfig>,
    store: Option<Arc<dyn AuditStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl AuditServiceBuilder {
    pub fn config(mut self, config: AuditConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Durable queue for tier 1; without it every event is written directly
    pub fn queue(mut self, queue: Option<Arc<dyn JobQueue>>) -> Self {
        self.queue = queue;
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn build(self) -> AuditResult<AuditService> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .store
            .ok_or_else(|| AuditError::Configuration("audit service requires a store".to_string()))?;
        let sink = self.alert_sink.unwrap_or_else(|| Arc::new(LogAlertSink));

        let chain = Arc::new(HashChain::new(store.clone()));
        let pipeline = Arc::new(DeliveryPipeline::new(&config, chain, self.queue, sink));

        Ok(AuditService {
            inner: Arc::new(Inner {
                config,
                store,
                pipeline,
                in_flight: TaskTracker::new(),
            }),
        })
    }
}

/// Background tasks started by [`AuditService::start`]
#[derive(Debug)]
pub struct AuditRuntime {
    workers: Option<WorkerPool>,
    sweeper: JoinHandle<()>,
    cancel: CancellationToken,
    in_flight: TaskTracker,
}

impl AuditRuntime {
    pub fn worker_count(&self) -> usize {
        self.workers.as_ref().map_or(0, WorkerPool::len)
    }

    /// Stop background tasks within `grace`
    ///
    /// Events still being submitted from the request path are awaited first,
    /// so they can land in the queue before the workers stop. Whatever is
    /// left of `grace` goes to the queue workers.
    pub async fn shutdown(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;

        self.in_flight.close();
        if tokio::time::timeout(grace, self.in_flight.wait()).await.is_err() {
            warn!(
                pending = self.in_flight.len(),
                "Audit submissions still in flight at shutdown, abandoning them"
            );
        }

        self.cancel.cancel();
        if let Some(workers) = self.workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            workers.shutdown(remaining).await;
        }
        if let Err(err) = self.sweeper.await {
            warn!(error = %err, "Audit retention sweeper ended abnormally");
        }
        info!("Audit runtime stopped");
    }
}

impl AuditService {
    pub fn builder() -> AuditServiceBuilder {
        AuditServiceBuilder::default()
    }

    pub fn config(&self) -> &AuditConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &Arc<DeliveryPipeline> {
        &self.inner.pipeline
    }

    /// Spawn queue workers (when a queue is attached) and the retention sweeper
    pub fn start(&self) -> AuditRuntime {
        let cancel = CancellationToken::new();
        let config = &self.inner.config;

        let workers = self.inner.pipeline.queue().map(|queue| {
            WorkerPool::spawn(
                config.worker_concurrency,
                self.inner.pipeline.clone(),
                queue.clone(),
                config.queue_poll_interval(),
                cancel.child_token(),
            )
        });

        let sweeper = RetentionSweeper::new(self.inner.store.clone(), config);
        let sweeper = tokio::spawn(sweeper.run(cancel.child_token()));

        AuditRuntime {
            workers,
            sweeper,
            cancel,
            in_flight: self.inner.in_flight.clone(),
        }
    }

    /// Record an event; never fails and never panics into the caller
    pub async fn log_event(&self, event: NewAuditEvent) {
        self.inner.pipeline.submit(event).await;
    }

    /// Hand an event to a tracked background task and return immediately
    ///
    /// [`AuditRuntime::shutdown`] waits for these tasks. Outside a tokio
    /// runtime the event is dropped with a warning.
    pub fn spawn_log_event(&self, event: NewAuditEvent) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(action = %event.action, "No async runtime available, audit event dropped");
                return;
            },
        };
        let service = self.clone();
        self.inner
            .in_flight
            .spawn_on(async move { service.log_event(event).await }, &handle);
    }

    pub async fn find(&self, filter: &AuditFilter, page: i64, limit: i64) -> AuditResult<AuditPage> {
        filter.validate()?;
        let (page, limit) = super::models::resolve_paging(Some(page), Some(limit))?;
        self.inner.store.find(filter, page, limit).await
    }

    /// Verify the latest `limit` records, default [`DEFAULT_VERIFY_LIMIT`]
    pub async fn verify_chain(&self, limit: Option<i64>) -> AuditResult<ChainVerification> {
        self.inner
            .pipeline
            .chain()
            .verify_chain(limit.unwrap_or(DEFAULT_VERIFY_LIMIT))
            .await
    }

    pub async fn health_check(&self) -> AuditHealth {
        let timeout = self.inner.config.db_timeout();
        let store = &self.inner.store;

        let storage_writable = matches!(
            tokio::time::timeout(timeout, store.probe_write()).await,
            Ok(Ok(()))
        );

        let since = Utc::now() - ChronoDuration::hours(24);
        let recent_activity = matches!(
            tokio::time::timeout(timeout, store.count_since(since)).await,
            Ok(Ok(count)) if count > 0
        );

        let integrity_ok = match self
            .verify_chain(Some(HEALTH_VERIFY_LIMIT))
            .await
            .and_then(ChainVerification::into_result)
        {
            Ok(_) => true,
            Err(AuditError::ChainIntegrityViolation { record_id, kind }) => {
                error!(record_id = %record_id, kind = %kind, "Audit chain integrity violation");
                false
            },
            Err(err) => {
                warn!(error = %err, "Audit integrity spot check could not run");
                false
            },
        };

        let health = AuditHealth {
            storage_writable,
            recent_activity,
            integrity_ok,
        };
        if !health.is_healthy() {
            warn!(?health, "Audit subsystem unhealthy");
        }
        health
    }

    /// Mark a record resolved; repeated calls keep the first timestamp
    pub async fn resolve(&self, id: Uuid) -> AuditResult<AuditRecord> {
        self.inner.store.resolve(id, Utc::now()).await
    }

    pub async fn stats(&self) -> DeliveryStats {
        self.inner.pipeline.stats().await
    }

    /// Most recent jobs that exhausted their retries, empty without a queue
    pub async fn failed_jobs(&self, limit: i64) -> AuditResult<Vec<AuditJob>> {
        let (_, limit) = super::models::resolve_paging(None, Some(limit))?;
        match self.inner.pipeline.queue() {
            Some(queue) => queue.failed_jobs(limit).await,
            None => Ok(Vec::new()),
        }
    }

    /// Run one retention sweep now
    pub async fn purge_expired(&self) -> AuditResult<u64> {
        RetentionSweeper::new(self.inner.store.clone(), &self.inner.config)
            .sweep_once(Utc::now())
            .await
    }
}
