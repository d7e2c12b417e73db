//! Postgres queries for audit records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{types::Json, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::models::{AuditFilter, AuditPage, AuditRecord, ErrorInfo, Pagination};
use super::store::{AuditStore, ChainTail};
use crate::error::{AuditError, AuditResult};

const RECORD_COLUMNS: &str = r#"
    id, sequence, actor_id, tenant_id, action, resource, resource_id,
    method, endpoint, ip_address, user_agent, status_code,
    request_body, response_data, error, severity, category,
    hash, previous_hash, created_at, resolved_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    sequence: i64,
    actor_id: Option<String>,
    tenant_id: Option<String>,
    action: String,
    resource: String,
    resource_id: Option<String>,
    method: String,
    endpoint: String,
    ip_address: String,
    user_agent: String,
    status_code: i32,
    request_body: Option<JsonValue>,
    response_data: Option<JsonValue>,
    error: Option<Json<ErrorInfo>>,
    severity: String,
    category: String,
    hash: String,
    previous_hash: String,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = AuditError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(AuditRecord {
            id: row.id,
            sequence: row.sequence,
            actor_id: row.actor_id,
            tenant_id: row.tenant_id,
            action: row.action,
            resource: row.resource,
            resource_id: row.resource_id,
            method: row.method,
            endpoint: row.endpoint,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            status_code: u16::try_from(row.status_code).map_err(|_| {
                AuditError::StorageUnavailable(format!(
                    "record {} has out-of-range status {}",
                    row.id, row.status_code
                ))
            })?,
            request_body: row.request_body,
            response_data: row.response_data,
            error: row.error.map(|Json(e)| e),
            severity: row.severity.parse()?,
            category: row.category.parse()?,
            hash: row.hash,
            previous_hash: row.previous_hash,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

fn into_records(rows: Vec<AuditRow>) -> AuditResult<Vec<AuditRecord>> {
    rows.into_iter().map(AuditRecord::try_from).collect()
}

/// Bind value for a dynamically built WHERE clause
#[derive(Debug, Clone)]
enum FilterArg {
    Text(String),
    Int(i32),
    Time(DateTime<Utc>),
}

/// Build ` WHERE ...` with `$1..$n` placeholders for every set field
fn filter_clause(filter: &AuditFilter) -> (String, Vec<FilterArg>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();

    let mut push = |column: &str, op: &str, arg: FilterArg| {
        args.push(arg);
        conditions.push(format!("{column} {op} ${}", args.len()));
    };

    if let Some(ref id) = filter.actor_id {
        push("actor_id", "=", FilterArg::Text(id.to_string()));
    }
    if let Some(ref id) = filter.tenant_id {
        push("tenant_id", "=", FilterArg::Text(id.to_string()));
    }
    if let Some(ref action) = filter.action {
        push("action", "=", FilterArg::Text(action.clone()));
    }
    if let Some(ref resource) = filter.resource {
        push("resource", "=", FilterArg::Text(resource.clone()));
    }
    if let Some(ref id) = filter.resource_id {
        push("resource_id", "=", FilterArg::Text(id.to_string()));
    }
    if let Some(severity) = filter.severity {
        push("severity", "=", FilterArg::Text(severity.as_str().to_string()));
    }
    if let Some(category) = filter.category {
        push("category", "=", FilterArg::Text(category.as_str().to_string()));
    }
    if let Some(status) = filter.status_code {
        push("status_code", "=", FilterArg::Int(i32::from(status)));
    }
    if let Some(from) = filter.from {
        push("created_at", ">=", FilterArg::Time(from));
    }
    if let Some(to) = filter.to {
        push("created_at", "<=", FilterArg::Time(to));
    }

    if conditions.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), args)
    }
}

macro_rules! bind_args {
    ($query:expr, $args:expr) => {{
        let mut query = $query;
        for arg in $args {
            query = match arg {
                FilterArg::Text(v) => query.bind(v.clone()),
                FilterArg::Int(v) => query.bind(*v),
                FilterArg::Time(v) => query.bind(*v),
            };
        }
        query
    }};
}

/// Postgres-backed [`AuditStore`]
#[derive(Debug, Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, record: &AuditRecord) -> AuditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (
                id, sequence, actor_id, tenant_id, action, resource, resource_id,
                method, endpoint, ip_address, user_agent, status_code,
                request_body, response_data, error, severity, category,
                hash, previous_hash, created_at, resolved_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(record.id)
        .bind(record.sequence)
        .bind(&record.actor_id)
        .bind(&record.tenant_id)
        .bind(&record.action)
        .bind(&record.resource)
        .bind(&record.resource_id)
        .bind(&record.method)
        .bind(&record.endpoint)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(i32::from(record.status_code))
        .bind(&record.request_body)
        .bind(&record.response_data)
        .bind(record.error.as_ref().map(Json))
        .bind(record.severity.as_str())
        .bind(record.category.as_str())
        .bind(&record.hash)
        .bind(&record.previous_hash)
        .bind(record.created_at)
        .bind(record.resolved_at)
        .execute(&self.pool)
        .await?;

        debug!(
            record_id = %record.id,
            sequence = record.sequence,
            action = %record.action,
            "Inserted audit record"
        );

        Ok(())
    }

    async fn tail(&self) -> AuditResult<Option<ChainTail>> {
        let row: Option<(String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT hash, sequence, created_at FROM audit_records ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(hash, sequence, created_at)| ChainTail {
            hash,
            sequence,
            created_at,
        }))
    }

    async fn find(&self, filter: &AuditFilter, page: i64, limit: i64) -> AuditResult<AuditPage> {
        let (where_clause, args) = filter_clause(filter);
        let offset = (page - 1).saturating_mul(limit);

        let count_sql = format!("SELECT COUNT(*) FROM audit_records{where_clause}");
        let total: i64 = bind_args!(sqlx::query_scalar(&count_sql), &args)
            .fetch_one(&self.pool)
            .await?;

        let list_sql = format!(
            "SELECT {RECORD_COLUMNS} FROM audit_records{where_clause} \
             ORDER BY created_at DESC, sequence DESC LIMIT ${} OFFSET ${}",
            args.len() + 1,
            args.len() + 2
        );
        let rows: Vec<AuditRow> = bind_args!(sqlx::query_as(&list_sql), &args)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        debug!(count = rows.len(), total, page, limit, "Queried audit records");

        Ok(AuditPage {
            records: into_records(rows)?,
            pagination: Pagination::new(page, limit, total),
        })
    }

    async fn chain_window(&self, limit: i64) -> AuditResult<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM (\
                SELECT * FROM audit_records ORDER BY sequence DESC LIMIT $1\
             ) AS latest ORDER BY sequence ASC"
        );
        let rows: Vec<AuditRow> = sqlx::query_as(&sql).bind(limit).fetch_all(&self.pool).await?;
        into_records(rows)
    }

    async fn count_since(&self, since: DateTime<Utc>) -> AuditResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM audit_records WHERE created_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> AuditResult<AuditRecord> {
        let sql = format!(
            "UPDATE audit_records SET resolved_at = COALESCE(resolved_at, $2) \
             WHERE id = $1 RETURNING {RECORD_COLUMNS}"
        );
        let row: Option<AuditRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| AuditError::NotFound(format!("audit record {id}")))?
            .try_into()
    }

    async fn probe_write(&self) -> AuditResult<()> {
        let writable: bool = sqlx::query_scalar(
            "SELECT NOT pg_is_in_recovery() \
             AND has_table_privilege('audit_records', 'INSERT')",
        )
        .fetch_one(&self.pool)
        .await?;

        if writable {
            Ok(())
        } else {
            Err(AuditError::StorageUnavailable(
                "audit_records is not writable by this connection".to_string(),
            ))
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>, batch: i64) -> AuditResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM audit_records
            WHERE id IN (
                SELECT id FROM audit_records
                WHERE created_at < $1
                ORDER BY created_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(batch)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::models::{Category, Severity};
    use docket_common::ObjectId;

    #[test]
    fn test_filter_clause_empty() {
        let (clause, args) = filter_clause(&AuditFilter::default());
        assert!(clause.is_empty());
        assert!(args.is_empty());
    }

    #[test]
    fn test_filter_clause_numbers_placeholders_in_order() {
        let filter = AuditFilter {
            actor_id: Some(ObjectId::parse("507f1f77bcf86cd799439011").unwrap()),
            action: Some("login_attempt".to_string()),
            severity: Some(Severity::High),
            category: Some(Category::Auth),
            status_code: Some(401),
            from: Some(Utc::now()),
            ..Default::default()
        };
        let (clause, args) = filter_clause(&filter);
        assert_eq!(
            clause,
            " WHERE actor_id = $1 AND action = $2 AND severity = $3 AND category = $4 \
             AND status_code = $5 AND created_at >= $6"
        );
        assert_eq!(args.len(), 6);
        assert!(matches!(args[4], FilterArg::Int(401)));
    }

    #[test]
    fn test_filter_values_are_bound_not_interpolated() {
        let filter = AuditFilter {
            action: Some("x' OR '1'='1".to_string()),
            ..Default::default()
        };
        let (clause, _) = filter_clause(&filter);
        assert!(!clause.contains("OR '1'"));
    }
}
