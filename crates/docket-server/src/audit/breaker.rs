//! Circuit breaker guarding direct audit writes
//!
//! A rolling window of time buckets counts successes and failures. The
//! circuit opens when, with at least `volume_threshold` calls in the window,
//! the error percentage reaches `error_threshold_percent`. After
//! `reset_timeout` a single probe is let through: success closes the circuit,
//! failure reopens it. Each call is bounded by `call_timeout`, and a timeout
//! counts as a failure.
//!
//! Time comes from `tokio::time`, so paused-clock tests drive the state
//! machine deterministically.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult};

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls are rejected without touching storage
    Open,
    /// One probe call decides between closed and open
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub error_threshold_percent: u8,
    pub volume_threshold: u32,
    pub reset_timeout: Duration,
    pub rolling_window: Duration,
    pub buckets: u32,
    pub call_timeout: Duration,
}

impl From<&AuditConfig> for BreakerConfig {
    fn from(config: &AuditConfig) -> Self {
        Self {
            error_threshold_percent: config.breaker_error_percent,
            volume_threshold: config.breaker_volume_threshold,
            reset_timeout: Duration::from_secs(config.breaker_reset_secs),
            rolling_window: Duration::from_secs(config.breaker_window_secs),
            buckets: config.breaker_buckets,
            call_timeout: config.db_timeout(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&AuditConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    successes: u32,
    failures: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    buckets: VecDeque<Bucket>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    times_opened: u64,
}

/// Snapshot for stats endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub window_successes: u32,
    pub window_failures: u32,
    pub times_opened: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission for one call
///
/// A half-open permit dropped before it is settled, e.g. because the caller
/// cancelled the call, hands the half-open slot back.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    half_open: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self) -> bool {
        self.settled = true;
        self.half_open
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.half_open && !self.settled {
            let mut inner = self.breaker.lock();
            if inner.state == BreakerState::HalfOpen {
                inner.probe_in_flight = false;
            }
            debug!("Half-open call abandoned, slot released");
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                buckets: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
                times_opened: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, applying the open-to-half-open timeout
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.check_timeout(&mut inner, Instant::now());
        inner.state
    }

    pub fn stats(&self) -> BreakerStats {
        let now = Instant::now();
        let mut inner = self.lock();
        self.check_timeout(&mut inner, now);
        self.evict(&mut inner, now);
        let (successes, failures) = totals(&inner);
        BreakerStats {
            state: inner.state,
            window_successes: successes,
            window_failures: failures,
            times_opened: inner.times_opened,
        }
    }

    /// Run `operation` under the breaker and the per-call timeout
    pub async fn call<F, T>(&self, operation: F) -> AuditResult<T>
    where
        F: Future<Output = AuditResult<T>>,
    {
        let permit = self.acquire()?;

        let result = match tokio::time::timeout(self.config.call_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(AuditError::StorageTimeout(self.config.call_timeout)),
        };

        match result {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            },
            Err(err) => {
                self.on_failure(permit, &err);
                Err(err)
            },
        }
    }

    fn acquire(&self) -> AuditResult<Permit<'_>> {
        let mut inner = self.lock();
        self.check_timeout(&mut inner, Instant::now());

        let half_open = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => return Err(AuditError::BreakerOpen),
            BreakerState::HalfOpen if inner.probe_in_flight => return Err(AuditError::BreakerOpen),
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                debug!("Circuit breaker letting probe call through");
                true
            },
        };

        Ok(Permit {
            breaker: self,
            half_open,
            settled: false,
        })
    }

    fn on_success(&self, mut permit: Permit<'_>) {
        let half_open = permit.settle();
        let now = Instant::now();
        let mut inner = self.lock();
        if half_open {
            info!("Circuit breaker closing after successful probe");
            inner.state = BreakerState::Closed;
            inner.probe_in_flight = false;
            inner.opened_at = None;
            inner.buckets.clear();
        } else {
            self.current_bucket(&mut inner, now).successes += 1;
        }
    }

    fn on_failure(&self, mut permit: Permit<'_>, err: &AuditError) {
        let half_open = permit.settle();
        let now = Instant::now();
        let mut inner = self.lock();
        if half_open {
            warn!(error = %err, "Circuit breaker re-opening after failed probe");
            inner.probe_in_flight = false;
            self.trip(&mut inner, now);
            return;
        }

        self.current_bucket(&mut inner, now).failures += 1;
        if inner.state != BreakerState::Closed {
            return;
        }
        let (successes, failures) = totals(&inner);
        let total = successes + failures;
        if total >= self.config.volume_threshold
            && u64::from(failures) * 100
                >= u64::from(total) * u64::from(self.config.error_threshold_percent)
        {
            warn!(
                failures,
                total,
                threshold_percent = self.config.error_threshold_percent,
                error = %err,
                "Circuit breaker opening due to failures"
            );
            self.trip(&mut inner, now);
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(now);
        inner.times_opened += 1;
    }

    fn check_timeout(&self, inner: &mut Inner, now: Instant) {
        if inner.state != BreakerState::Open {
            return;
        }
        if let Some(opened_at) = inner.opened_at {
            if now.duration_since(opened_at) >= self.config.reset_timeout {
                info!("Circuit breaker half-open, next call is a probe");
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = false;
            }
        }
    }

    fn bucket_width(&self) -> Duration {
        self.config.rolling_window / self.config.buckets.max(1)
    }

    fn evict(&self, inner: &mut Inner, now: Instant) {
        let window = self.config.rolling_window;
        while inner
            .buckets
            .front()
            .is_some_and(|b| now.duration_since(b.started) >= window)
        {
            inner.buckets.pop_front();
        }
    }

    fn current_bucket<'a>(&self, inner: &'a mut Inner, now: Instant) -> &'a mut Bucket {
        self.evict(inner, now);
        let width = self.bucket_width();
        let fresh = inner
            .buckets
            .back()
            .map_or(true, |b| now.duration_since(b.started) >= width);
        if fresh {
            inner.buckets.push_back(Bucket {
                started: now,
                successes: 0,
                failures: 0,
            });
        }
        let last = inner.buckets.len() - 1;
        &mut inner.buckets[last]
    }
}

fn totals(inner: &Inner) -> (u32, u32) {
    inner
        .buckets
        .iter()
        .fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            error_threshold_percent: 50,
            volume_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            buckets: 10,
            call_timeout: Duration::from_secs(5),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> AuditError {
        breaker
            .call(async { Err::<(), _>(AuditError::StorageUnavailable("down".into())) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) -> AuditResult<()> {
        breaker.call(async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_closed_below_volume_threshold() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_error_percentage() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..3 {
            succeed(&breaker).await.unwrap();
        }
        fail(&breaker).await;
        fail(&breaker).await;
        // 2 of 5 is 40%
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker).await;
        // 3 of 6 is 50%
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_fails_fast_without_running_operation() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            fail(&breaker).await;
        }

        let mut ran = false;
        let result = breaker
            .call(async {
                ran = true;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AuditError::BreakerOpen)));
        assert!(!ran);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().window_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.stats().times_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            let err = breaker
                .call(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
                .unwrap_err();
            assert!(matches!(err, AuditError::StorageTimeout(_)));
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_leave_the_window() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..4 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.stats().window_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_probe_at_a_time() {
        let breaker = std::sync::Arc::new(CircuitBreaker::new(config()));
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let slow = {
            let breaker = breaker.clone();
            tokio::spawn(async move {
                breaker
                    .call(async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert!(matches!(succeed(&breaker).await, Err(AuditError::BreakerOpen)));
        slow.await.unwrap().unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_half_open_call_releases_slot() {
        let breaker = CircuitBreaker::new(config());
        for _ in 0..5 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        // The caller gives up before storage answers
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(std::future::pending::<AuditResult<()>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
