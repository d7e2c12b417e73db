//! Tamper-evident hash chain over audit records
//!
//! Every record commits to its predecessor:
//!
//! ```text
//! hash = SHA256(canonical_json({actorId, action, createdAt, previousHash, resource}))
//! ```
//!
//! `createdAt` is RFC 3339 in UTC with millisecond precision. The first record
//! links to [`GENESIS_HASH`].
//!
//! All delivery tiers append through one [`HashChain`], whose mutex makes the
//! read-tail/stamp/insert sequence a single critical section within the
//! process. Across replicas the `UNIQUE(sequence)` and `UNIQUE(previous_hash)`
//! constraints make a racing insert fail instead of forking the chain.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{
    AuditRecord, BrokenLink, ChainVerification, PendingRecord, MAX_VERIFY_LIMIT,
};
use super::store::AuditStore;
use crate::error::{AuditError, AuditResult, ViolationKind};

/// `previous_hash` of the first record ever written
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Hash of the chained fields of one record
pub fn compute_hash(
    actor_id: Option<&str>,
    action: &str,
    resource: &str,
    created_at: DateTime<Utc>,
    previous_hash: &str,
) -> String {
    let document = json!({
        "actorId": actor_id,
        "action": action,
        "resource": resource,
        "createdAt": created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "previousHash": previous_hash,
    });
    docket_common::digest::digest_canonical(&document)
}

/// Recompute a stored record's hash from its content
pub fn record_hash(record: &AuditRecord) -> String {
    compute_hash(
        record.actor_id.as_deref(),
        &record.action,
        &record.resource,
        record.created_at,
        &record.previous_hash,
    )
}

/// Single writer of the audit chain
pub struct HashChain {
    store: Arc<dyn AuditStore>,
    lock: Mutex<()>,
}

impl HashChain {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Stamp chain fields onto `pending` and persist it
    ///
    /// Holds the chain lock from the tail read through the insert. The guard
    /// drops on every exit, including cancellation by a caller's timeout.
    pub async fn append(&self, pending: PendingRecord) -> AuditResult<AuditRecord> {
        self.writer().await.append(pending).await
    }

    /// Wait for the chain lock
    ///
    /// A timeout wrapped around [`ChainWriter::append`] covers storage only,
    /// not the wait behind other appends.
    pub async fn writer(&self) -> ChainWriter<'_> {
        ChainWriter {
            store: &self.store,
            _guard: self.lock.lock().await,
        }
    }

    /// Walk the latest `limit` records oldest-first and check every link
    ///
    /// The first record of the window is the anchor: its own hash is checked
    /// but its `previous_hash` is trusted, since its predecessor may have
    /// expired. Read-only.
    pub async fn verify_chain(&self, limit: i64) -> AuditResult<ChainVerification> {
        if !(1..=MAX_VERIFY_LIMIT).contains(&limit) {
            return Err(AuditError::Validation(format!(
                "verification limit must be between 1 and {MAX_VERIFY_LIMIT}"
            )));
        }

        let window = self.store.chain_window(limit).await?;
        let verification = verify_records(&window);

        if !verification.valid {
            warn!(
                record_id = ?verification.corrupted_record_id,
                kind = ?verification.kind,
                records_checked = verification.records_checked,
                "Audit chain verification failed"
            );
        }

        Ok(verification)
    }
}

/// Exclusive handle on the chain tail, held until dropped
pub struct ChainWriter<'a> {
    store: &'a Arc<dyn AuditStore>,
    _guard: MutexGuard<'a, ()>,
}

impl ChainWriter<'_> {
    pub async fn append(&self, pending: PendingRecord) -> AuditResult<AuditRecord> {
        let tail = self.store.tail().await?;
        let (previous_hash, sequence, floor) = match tail {
            Some(tail) => (tail.hash, tail.sequence + 1, Some(tail.created_at)),
            None => (GENESIS_HASH.to_string(), 1, None),
        };

        let created_at = stamp(Utc::now(), floor);
        let hash = compute_hash(
            pending.actor_id.as_deref(),
            &pending.action,
            &pending.resource,
            created_at,
            &previous_hash,
        );
        let record = pending.into_record(Uuid::new_v4(), sequence, created_at, previous_hash, hash);

        self.store.insert(&record).await?;

        debug!(
            record_id = %record.id,
            sequence = record.sequence,
            action = %record.action,
            "Appended audit record to chain"
        );

        Ok(record)
    }
}

/// Verify an oldest-first run of records
pub fn verify_records(records: &[AuditRecord]) -> ChainVerification {
    let mut previous: Option<&AuditRecord> = None;
    let mut checked = 0u64;

    for record in records {
        checked += 1;

        if let Some(prev) = previous {
            if record.previous_hash != prev.hash {
                return ChainVerification {
                    valid: false,
                    records_checked: checked,
                    corrupted_record_id: Some(record.id),
                    broken_chain: Some(BrokenLink {
                        expected_previous_hash: prev.hash.clone(),
                        actual_previous_hash: record.previous_hash.clone(),
                    }),
                    kind: Some(ViolationKind::ChainBreak),
                };
            }
        }

        if record_hash(record) != record.hash {
            return ChainVerification {
                valid: false,
                records_checked: checked,
                corrupted_record_id: Some(record.id),
                broken_chain: None,
                kind: Some(ViolationKind::HashMismatch),
            };
        }

        previous = Some(record);
    }

    ChainVerification::intact(checked)
}

// Millisecond precision survives a Postgres round trip; never go backwards
fn stamp(now: DateTime<Utc>, floor: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(3);
    match floor {
        Some(floor) if floor > now => floor,
        _ => now,
    }
}
