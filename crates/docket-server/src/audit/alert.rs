//! Alerting on exhausted audit delivery
//!
//! Every write that made it through none of the delivery tiers is recorded in
//! a rolling window. Reaching the threshold within the window raises one
//! critical alert and resets the window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::error;

use crate::config::AuditConfig;

/// Tracing target for delivery alerts, for routing to paging systems
pub const ALERT_TARGET: &str = "docket::audit::alert";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditAlert {
    pub failures: u32,
    #[serde(with = "duration_secs")]
    pub window: Duration,
    pub last_error: String,
    pub raised_at: DateTime<Utc>,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }
}

/// Receiver for critical delivery alerts
pub trait AlertSink: Send + Sync {
    fn critical(&self, alert: &AuditAlert);
}

/// Sink that relies on the structured `error!` event alone
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn critical(&self, _alert: &AuditAlert) {}
}

pub struct FailureAlarm {
    threshold: u32,
    window: Duration,
    failures: Mutex<VecDeque<Instant>>,
    alerts_emitted: AtomicU64,
    sink: Arc<dyn AlertSink>,
}

impl FailureAlarm {
    pub fn new(threshold: u32, window: Duration, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
            failures: Mutex::new(VecDeque::new()),
            alerts_emitted: AtomicU64::new(0),
            sink,
        }
    }

    pub fn from_config(config: &AuditConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self::new(config.alert_threshold, config.alert_window(), sink)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.failures.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evict(&self, failures: &mut VecDeque<Instant>, now: Instant) {
        while failures
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            failures.pop_front();
        }
    }

    /// Count one exhausted write; returns the alert if this one raised it
    pub fn record_failure(&self, last_error: &str) -> Option<AuditAlert> {
        let now = Instant::now();
        let count = {
            let mut failures = self.lock();
            self.evict(&mut failures, now);
            failures.push_back(now);
            let count = u32::try_from(failures.len()).unwrap_or(u32::MAX);
            if count < self.threshold {
                return None;
            }
            failures.clear();
            count
        };

        let alert = AuditAlert {
            failures: count,
            window: self.window,
            last_error: last_error.to_string(),
            raised_at: Utc::now(),
        };
        self.alerts_emitted.fetch_add(1, Ordering::Relaxed);

        error!(
            target: ALERT_TARGET,
            failures = alert.failures,
            window_secs = alert.window.as_secs(),
            last_error = %alert.last_error,
            "CRITICAL: audit records are being lost, every delivery tier failed"
        );
        self.sink.critical(&alert);

        Some(alert)
    }

    pub fn failures_in_window(&self) -> u32 {
        let now = Instant::now();
        let mut failures = self.lock();
        self.evict(&mut failures, now);
        u32::try_from(failures.len()).unwrap_or(u32::MAX)
    }

    pub fn alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FailureAlarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureAlarm")
            .field("threshold", &self.threshold)
            .field("window", &self.window)
            .field("alerts_emitted", &self.alerts_emitted())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;

    /// Sink that keeps every alert it receives
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) alerts: Mutex<Vec<AuditAlert>>,
    }

    impl RecordingSink {
        pub(crate) fn count(&self) -> usize {
            self.alerts.lock().unwrap().len()
        }
    }

    impl AlertSink for RecordingSink {
        fn critical(&self, alert: &AuditAlert) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_alert_at_threshold_then_reset() {
        let sink = Arc::new(RecordingSink::default());
        let alarm = FailureAlarm::new(3, Duration::from_secs(300), sink.clone());

        assert!(alarm.record_failure("a").is_none());
        assert!(alarm.record_failure("b").is_none());
        let alert = alarm.record_failure("c").unwrap();
        assert_eq!(alert.failures, 3);
        assert_eq!(alert.last_error, "c");

        assert_eq!(sink.count(), 1);
        assert_eq!(alarm.alerts_emitted(), 1);
        assert_eq!(alarm.failures_in_window(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let sink = Arc::new(RecordingSink::default());
        let alarm = FailureAlarm::new(3, Duration::from_secs(300), sink.clone());

        alarm.record_failure("a");
        alarm.record_failure("b");
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(alarm.failures_in_window(), 0);

        assert!(alarm.record_failure("c").is_none());
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_alert_serializes_window_in_seconds() {
        let alert = AuditAlert {
            failures: 10,
            window: Duration::from_secs(300),
            last_error: "down".to_string(),
            raised_at: Utc::now(),
        };
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["window"], 300);
    }
}
