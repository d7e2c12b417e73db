//! Storage abstraction for audit records
//!
//! [`AuditStore`] is the only component that touches persisted audit bytes.
//! [`PgAuditStore`](super::queries::PgAuditStore) backs production;
//! [`MemoryAuditStore`] backs tests and database-less local runs and mirrors
//! the Postgres uniqueness rules on `sequence` and `previous_hash`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{AuditFilter, AuditPage, AuditRecord, Pagination};
use crate::error::{AuditError, AuditResult};

/// Latest link of the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTail {
    pub hash: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist a fully chained record
    async fn insert(&self, record: &AuditRecord) -> AuditResult<()>;

    /// Most recent record in chain order, if any
    async fn tail(&self) -> AuditResult<Option<ChainTail>>;

    /// Filtered page, newest first; `page` and `limit` are already validated
    async fn find(&self, filter: &AuditFilter, page: i64, limit: i64) -> AuditResult<AuditPage>;

    /// The most recent `limit` records, oldest first
    async fn chain_window(&self, limit: i64) -> AuditResult<Vec<AuditRecord>>;

    async fn count_since(&self, since: DateTime<Utc>) -> AuditResult<i64>;

    /// Set `resolved_at` unless already set; returns the stored record
    async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> AuditResult<AuditRecord>;

    /// Whether the store currently accepts writes
    async fn probe_write(&self) -> AuditResult<()>;

    /// Delete up to `batch` records created before `cutoff`, oldest first
    async fn purge_older_than(&self, cutoff: DateTime<Utc>, batch: i64) -> AuditResult<u64>;
}

/// In-process store with failure injection
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    insert_attempts: AtomicU64,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `StorageUnavailable`
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Delay every write, e.g. to trip storage timeouts
    pub fn set_write_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.write_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of `insert` calls, successful or not
    pub fn insert_attempts(&self) -> u64 {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// All records in chain order
    pub async fn snapshot(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Mutate a stored record in place, bypassing every invariant
    ///
    /// Exists to simulate tampering; returns false for unknown ids.
    pub async fn tamper<F>(&self, id: Uuid, edit: F) -> bool
    where
        F: FnOnce(&mut AuditRecord),
    {
        let mut records = self.records.write().await;
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                edit(record);
                true
            },
            None => false,
        }
    }

    /// Remove a stored record, bypassing retention rules
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.id != id);
        records.len() != before
    }

    async fn before_write(&self) -> AuditResult<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AuditError::StorageUnavailable("memory store is failing".to_string()));
        }
        Ok(())
    }
}

fn filter_matches(filter: &AuditFilter, record: &AuditRecord) -> bool {
    fn eq_id(expected: &Option<docket_common::ObjectId>, actual: &Option<String>) -> bool {
        expected
            .as_ref()
            .map_or(true, |id| actual.as_deref() == Some(id.as_str()))
    }

    eq_id(&filter.actor_id, &record.actor_id)
        && eq_id(&filter.tenant_id, &record.tenant_id)
        && eq_id(&filter.resource_id, &record.resource_id)
        && filter.action.as_ref().map_or(true, |a| *a == record.action)
        && filter.resource.as_ref().map_or(true, |r| *r == record.resource)
        && filter.severity.map_or(true, |s| s == record.severity)
        && filter.category.map_or(true, |c| c == record.category)
        && filter.status_code.map_or(true, |s| s == record.status_code)
        && filter.from.map_or(true, |from| record.created_at >= from)
        && filter.to.map_or(true, |to| record.created_at <= to)
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, record: &AuditRecord) -> AuditResult<()> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        self.before_write().await?;

        let mut records = self.records.write().await;
        if records
            .iter()
            .any(|r| r.sequence == record.sequence || r.previous_hash == record.previous_hash)
        {
            return Err(AuditError::StorageUnavailable(format!(
                "duplicate chain position (sequence {})",
                record.sequence
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn tail(&self) -> AuditResult<Option<ChainTail>> {
        let records = self.records.read().await;
        Ok(records.iter().max_by_key(|r| r.sequence).map(|r| ChainTail {
            hash: r.hash.clone(),
            sequence: r.sequence,
            created_at: r.created_at,
        }))
    }

    async fn find(&self, filter: &AuditFilter, page: i64, limit: i64) -> AuditResult<AuditPage> {
        let records = self.records.read().await;
        let mut matched: Vec<&AuditRecord> =
            records.iter().filter(|r| filter_matches(filter, r)).collect();
        matched.sort_by(|a, b| (b.created_at, b.sequence).cmp(&(a.created_at, a.sequence)));

        let total = i64::try_from(matched.len()).unwrap_or(i64::MAX);
        let skip = usize::try_from((page - 1).saturating_mul(limit)).unwrap_or(usize::MAX);
        let take = usize::try_from(limit).unwrap_or(0);

        Ok(AuditPage {
            records: matched.into_iter().skip(skip).take(take).cloned().collect(),
            pagination: Pagination::new(page, limit, total),
        })
    }

    async fn chain_window(&self, limit: i64) -> AuditResult<Vec<AuditRecord>> {
        let mut records = self.records.read().await.clone();
        records.sort_by_key(|r| r.sequence);
        let keep = usize::try_from(limit).unwrap_or(0);
        let start = records.len().saturating_sub(keep);
        Ok(records.split_off(start))
    }

    async fn count_since(&self, since: DateTime<Utc>) -> AuditResult<i64> {
        let records = self.records.read().await;
        let count = records.iter().filter(|r| r.created_at >= since).count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }

    async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> AuditResult<AuditRecord> {
        self.before_write().await?;
        let mut records = self.records.write().await;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AuditError::NotFound(format!("audit record {id}")))?;
        if record.resolved_at.is_none() {
            record.resolved_at = Some(at);
        }
        Ok(record.clone())
    }

    async fn probe_write(&self) -> AuditResult<()> {
        self.before_write().await
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>, batch: i64) -> AuditResult<u64> {
        let mut records = self.records.write().await;
        let mut expired: Vec<(DateTime<Utc>, i64)> = records
            .iter()
            .filter(|r| r.created_at < cutoff)
            .map(|r| (r.created_at, r.sequence))
            .collect();
        expired.sort();
        expired.truncate(usize::try_from(batch).unwrap_or(0));

        let doomed: std::collections::HashSet<i64> = expired.into_iter().map(|(_, seq)| seq).collect();
        records.retain(|r| !doomed.contains(&r.sequence));
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use crate::audit::models::{Category, Severity};
    use chrono::Duration as ChronoDuration;
    use docket_common::ObjectId;

    pub(crate) fn record(sequence: i64, created_at: DateTime<Utc>) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            sequence,
            actor_id: Some("507f1f77bcf86cd799439011".to_string()),
            tenant_id: None,
            action: "create_clients".to_string(),
            resource: "clients".to_string(),
            resource_id: None,
            method: "POST".to_string(),
            endpoint: "/api/v1/clients".to_string(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: "test".to_string(),
            status_code: 201,
            request_body: None,
            response_data: None,
            error: None,
            severity: Severity::Low,
            category: Category::DataAccess,
            hash: format!("{sequence:064x}"),
            previous_hash: format!("{:064x}", sequence - 1),
            created_at,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn test_insert_enforces_unique_positions() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        store.insert(&record(1, now)).await.unwrap();

        let mut dup = record(2, now);
        dup.previous_hash = format!("{:064x}", 0);
        assert!(store.insert(&dup).await.is_err());
        assert!(store.insert(&record(1, now)).await.is_err());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_tail_tracks_highest_sequence() {
        let store = MemoryAuditStore::new();
        assert!(store.tail().await.unwrap().is_none());

        let now = Utc::now();
        store.insert(&record(1, now)).await.unwrap();
        store.insert(&record(2, now)).await.unwrap();
        let tail = store.tail().await.unwrap().unwrap();
        assert_eq!(tail.sequence, 2);
        assert_eq!(tail.hash, format!("{:064x}", 2));
    }

    #[tokio::test]
    async fn test_find_exact_match_and_newest_first() {
        let store = MemoryAuditStore::new();
        let base = Utc::now();
        for i in 1..=3 {
            let mut r = record(i, base + ChronoDuration::seconds(i));
            r.action = if i == 2 { "login_attempt_2fa" } else { "login_attempt" }.to_string();
            store.insert(&r).await.unwrap();
        }

        let filter = AuditFilter {
            action: Some("login_attempt".to_string()),
            ..Default::default()
        };
        let page = store.find(&filter, 1, 50).await.unwrap();
        assert_eq!(page.pagination.total, 2);
        assert_eq!(page.records[0].sequence, 3);
        assert_eq!(page.records[1].sequence, 1);
    }

    #[tokio::test]
    async fn test_find_by_actor_and_paging() {
        let store = MemoryAuditStore::new();
        let base = Utc::now();
        for i in 1..=5 {
            store.insert(&record(i, base + ChronoDuration::seconds(i))).await.unwrap();
        }
        let filter = AuditFilter {
            actor_id: Some(ObjectId::parse("507f1f77bcf86cd799439011").unwrap()),
            ..Default::default()
        };
        let page = store.find(&filter, 2, 2).await.unwrap();
        assert_eq!(page.pagination, Pagination::new(2, 2, 5));
        assert_eq!(
            page.records.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![3, 2]
        );
    }

    #[tokio::test]
    async fn test_chain_window_returns_latest_oldest_first() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        for i in 1..=5 {
            store.insert(&record(i, now)).await.unwrap();
        }
        let window = store.chain_window(3).await.unwrap();
        assert_eq!(window.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let store = MemoryAuditStore::new();
        let r = record(1, Utc::now());
        store.insert(&r).await.unwrap();

        let first = Utc::now();
        let resolved = store.resolve(r.id, first).await.unwrap();
        assert_eq!(resolved.resolved_at, Some(first));

        let again = store.resolve(r.id, first + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(again.resolved_at, Some(first));

        assert!(matches!(
            store.resolve(Uuid::new_v4(), first).await,
            Err(AuditError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_respects_cutoff_and_batch() {
        let store = MemoryAuditStore::new();
        let now = Utc::now();
        for i in 1..=4 {
            store.insert(&record(i, now - ChronoDuration::days(10 - i))).await.unwrap();
        }
        store.insert(&record(5, now)).await.unwrap();

        let cutoff = now - ChronoDuration::days(1);
        assert_eq!(store.purge_older_than(cutoff, 3).await.unwrap(), 3);
        assert_eq!(store.purge_older_than(cutoff, 3).await.unwrap(), 1);
        assert_eq!(store.purge_older_than(cutoff, 3).await.unwrap(), 0);
        assert_eq!(store.snapshot().await[0].sequence, 5);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryAuditStore::new();
        store.set_failing(true);
        assert!(store.probe_write().await.is_err());
        assert!(store.insert(&record(1, Utc::now())).await.is_err());
        assert_eq!(store.insert_attempts(), 1);

        store.set_failing(false);
        assert!(store.probe_write().await.is_ok());
    }
}
