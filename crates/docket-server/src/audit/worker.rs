//! Queue workers
//!
//! Each [`QueueWorker`] is one tokio task that reserves a job, appends its
//! payload to the chain and then completes or fails the job. Idle workers
//! sleep for the poll interval. Cancellation is checked between jobs, never
//! in the middle of one.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::DeliveryPipeline;
use super::queue::{log_outcome, AuditJob, JobOutcome, JobQueue};

/// What one poll of the queue did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Delivered,
    Retrying,
    Failed,
}

pub struct QueueWorker {
    id: usize,
    pipeline: Arc<DeliveryPipeline>,
    queue: Arc<dyn JobQueue>,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        id: usize,
        pipeline: Arc<DeliveryPipeline>,
        queue: Arc<dyn JobQueue>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            pipeline,
            queue,
            poll_interval,
        }
    }

    /// Reserve and deliver at most one job
    pub async fn poll_once(&self) -> PollOutcome {
        let job = match self.queue.reserve().await {
            Ok(Some(job)) => job,
            Ok(None) => return PollOutcome::Idle,
            Err(err) => {
                warn!(worker = self.id, error = %err, "Failed to reserve audit job");
                return PollOutcome::Idle;
            },
        };

        self.deliver(job).await
    }

    async fn deliver(&self, job: AuditJob) -> PollOutcome {
        match self.pipeline.append_bounded(job.payload.clone()).await {
            Ok(record) => {
                if let Err(err) = self.queue.complete(job.id).await {
                    // Record is stored; a redelivery would only duplicate it
                    warn!(worker = self.id, job_id = %job.id, error = %err, "Failed to complete audit job");
                }
                debug!(
                    worker = self.id,
                    job_id = %job.id,
                    record_id = %record.id,
                    "Delivered queued audit event"
                );
                PollOutcome::Delivered
            },
            Err(err) => {
                let message = err.to_string();
                match self.queue.fail(&job, &message, self.pipeline.retry_policy()).await {
                    Ok(outcome) => {
                        log_outcome(&job, &message, outcome);
                        match outcome {
                            JobOutcome::Retrying { .. } => PollOutcome::Retrying,
                            JobOutcome::Failed => {
                                self.pipeline.alarm().record_failure(&message);
                                PollOutcome::Failed
                            },
                        }
                    },
                    Err(fail_err) => {
                        error!(
                            worker = self.id,
                            job_id = %job.id,
                            error = %fail_err,
                            "Failed to record audit job failure"
                        );
                        PollOutcome::Retrying
                    },
                }
            },
        }
    }

    /// Poll until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        debug!(worker = self.id, "Audit queue worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.poll_once().await == PollOutcome::Idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {},
                }
            }
        }
        debug!(worker = self.id, "Audit queue worker stopped");
    }
}

/// Running set of queue workers
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(
        concurrency: usize,
        pipeline: Arc<DeliveryPipeline>,
        queue: Arc<dyn JobQueue>,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handles = (0..concurrency)
            .map(|id| {
                let worker = QueueWorker::new(id, pipeline.clone(), queue.clone(), poll_interval);
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect();

        info!(concurrency, "Started audit queue workers");
        Self { handles, cancel }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop polling and wait up to `grace` for in-flight jobs
    ///
    /// Workers still busy after the grace period are aborted; their jobs stay
    /// `running` and are picked up again once the lease expires.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();

        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(grace, futures::future::join_all(self.handles)).await {
            Ok(_) => info!("Audit queue workers drained"),
            Err(_) => {
                warn!(grace_secs = grace.as_secs(), "Audit queue workers did not drain in time, aborting");
                for handle in aborts {
                    handle.abort();
                }
            },
        }
    }
}
