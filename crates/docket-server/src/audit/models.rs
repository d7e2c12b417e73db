//! Audit data models

use chrono::{DateTime, Utc};
use docket_common::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{AuditError, AuditResult, ViolationKind};

// ============================================================================
// Audit Query Constants
// ============================================================================

/// Default number of audit records returned per page
pub const DEFAULT_AUDIT_PAGE_LIMIT: i64 = 50;

/// Maximum number of audit records that can be returned in a single page.
/// This prevents excessive memory usage and query timeouts.
pub const MAX_AUDIT_PAGE_LIMIT: i64 = 1000;

/// Longest stored `action`; longer values are cut on a char boundary
pub const MAX_ACTION_LEN: usize = 128;

/// Default window for `verify_chain`
pub const DEFAULT_VERIFY_LIMIT: i64 = 1000;

/// Upper bound for a single `verify_chain` walk
pub const MAX_VERIFY_LIMIT: i64 = 100_000;

/// Severity assigned at classification time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(AuditError::Validation(format!("unknown severity '{}'", clip(s)))),
        }
    }
}

/// Functional area an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Auth,
    UserManagement,
    TenantManagement,
    DataAccess,
    Security,
    System,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::UserManagement => "user_management",
            Self::TenantManagement => "tenant_management",
            Self::DataAccess => "data_access",
            Self::Security => "security",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Category {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "user_management" => Ok(Self::UserManagement),
            "tenant_management" => Ok(Self::TenantManagement),
            "data_access" => Ok(Self::DataAccess),
            "security" => Ok(Self::Security),
            "system" => Ok(Self::System),
            _ => Err(AuditError::Validation(format!("unknown category '{}'", clip(s)))),
        }
    }
}

/// Failure details attached to an audited operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A persisted, hash-chained audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Position in the chain, strictly increasing
    pub sequence: i64,
    pub actor_id: Option<String>,
    pub tenant_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub method: String,
    pub endpoint: String,
    pub ip_address: String,
    pub user_agent: String,
    pub status_code: u16,
    pub request_body: Option<JsonValue>,
    pub response_data: Option<JsonValue>,
    pub error: Option<ErrorInfo>,
    pub severity: Severity,
    pub category: Category,
    pub hash: String,
    pub previous_hash: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// A raw event as handed over by the middleware or a caller of `log_event`
///
/// Bodies are unprotected at this point; the delivery pipeline redacts and
/// truncates them before anything is queued or stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub actor_id: Option<ObjectId>,
    pub tenant_id: Option<ObjectId>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub method: String,
    pub endpoint: String,
    pub ip_address: String,
    pub user_agent: String,
    pub status_code: u16,
    pub request_body: Option<JsonValue>,
    pub response_data: Option<JsonValue>,
    pub error: Option<ErrorInfo>,
    /// Derived from `endpoint` when absent
    pub category: Option<Category>,
}

impl NewAuditEvent {
    /// Create a builder for constructing audit events
    pub fn builder() -> NewAuditEventBuilder {
        NewAuditEventBuilder::default()
    }
}

/// Builder for [`NewAuditEvent`]
#[derive(Debug, Clone, Default)]
pub struct NewAuditEventBuilder {
    actor_id: Option<ObjectId>,
    tenant_id: Option<ObjectId>,
    action: Option<String>,
    resource: Option<String>,
    resource_id: Option<String>,
    method: Option<String>,
    endpoint: Option<String>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    status_code: Option<u16>,
    request_body: Option<JsonValue>,
    response_data: Option<JsonValue>,
    error: Option<ErrorInfo>,
    category: Option<Category>,
}

impl NewAuditEventBuilder {
    pub fn actor_id(mut self, actor_id: Option<ObjectId>) -> Self {
        self.actor_id = actor_id;
        self
    }

    pub fn tenant_id(mut self, tenant_id: Option<ObjectId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn resource_id(mut self, resource_id: Option<String>) -> Self {
        self.resource_id = resource_id;
        self
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn ip_address(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn request_body(mut self, body: JsonValue) -> Self {
        self.request_body = Some(body);
        self
    }

    pub fn response_data(mut self, data: JsonValue) -> Self {
        self.response_data = Some(data);
        self
    }

    pub fn error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// Build the event; `action` and `resource` are required
    pub fn build(self) -> AuditResult<NewAuditEvent> {
        let action = self
            .action
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| AuditError::Validation("action is required".to_string()))?;
        let resource = self
            .resource
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| AuditError::Validation("resource is required".to_string()))?;

        Ok(NewAuditEvent {
            actor_id: self.actor_id,
            tenant_id: self.tenant_id,
            action,
            resource,
            resource_id: self.resource_id,
            method: self.method.unwrap_or_else(|| "INTERNAL".to_string()),
            endpoint: self.endpoint.unwrap_or_default(),
            ip_address: self.ip_address.unwrap_or_else(|| "unknown".to_string()),
            user_agent: self.user_agent.unwrap_or_default(),
            status_code: self.status_code.unwrap_or(200),
            request_body: self.request_body,
            response_data: self.response_data,
            error: self.error,
            category: self.category,
        })
    }
}

/// A protected, classified event waiting for its chain position
///
/// This is the queue payload; every delivery tier turns it into an
/// [`AuditRecord`] through the hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub actor_id: Option<String>,
    pub tenant_id: Option<String>,
    pub action: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub method: String,
    pub endpoint: String,
    pub ip_address: String,
    pub user_agent: String,
    pub status_code: u16,
    pub request_body: Option<JsonValue>,
    pub response_data: Option<JsonValue>,
    pub error: Option<ErrorInfo>,
    pub severity: Severity,
    pub category: Category,
}

impl PendingRecord {
    /// Attach chain fields and identity
    pub fn into_record(
        self,
        id: Uuid,
        sequence: i64,
        created_at: DateTime<Utc>,
        previous_hash: String,
        hash: String,
    ) -> AuditRecord {
        AuditRecord {
            id,
            sequence,
            actor_id: self.actor_id,
            tenant_id: self.tenant_id,
            action: self.action,
            resource: self.resource,
            resource_id: self.resource_id,
            method: self.method,
            endpoint: self.endpoint,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            status_code: self.status_code,
            request_body: self.request_body,
            response_data: self.response_data,
            error: self.error,
            severity: self.severity,
            category: self.category,
            hash,
            previous_hash,
            created_at,
            resolved_at: None,
        }
    }
}

/// Validated filter for audit queries
///
/// Every field is an exact match; there is no pattern syntax.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub actor_id: Option<ObjectId>,
    pub tenant_id: Option<ObjectId>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub resource_id: Option<ObjectId>,
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    pub status_code: Option<u16>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn validate(&self) -> AuditResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AuditError::Validation("'from' must not be after 'to'".to_string()));
            }
        }
        if let Some(status) = self.status_code {
            check_status(status)?;
        }
        for (name, value) in [("action", &self.action), ("resource", &self.resource)] {
            if let Some(value) = value {
                if value.is_empty() || value.chars().count() > MAX_ACTION_LEN {
                    return Err(AuditError::Validation(format!(
                        "{name} must be 1 to {MAX_ACTION_LEN} characters"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Raw query-string parameters for `GET /audit/logs`
///
/// Everything arrives as text so malformed values surface as validation
/// errors with a message instead of extractor rejections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditLogParams {
    pub actor_id: Option<String>,
    pub tenant_id: Option<String>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub resource_id: Option<String>,
    pub severity: Option<String>,
    pub category: Option<String>,
    pub status_code: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

impl AuditLogParams {
    /// Parse into a filter plus optional page and limit
    pub fn into_query(self) -> AuditResult<(AuditFilter, Option<i64>, Option<i64>)> {
        let filter = AuditFilter {
            actor_id: parse_object_id("actor_id", self.actor_id)?,
            tenant_id: parse_object_id("tenant_id", self.tenant_id)?,
            action: self.action,
            resource: self.resource,
            resource_id: parse_object_id("resource_id", self.resource_id)?,
            severity: self.severity.as_deref().map(str::parse).transpose()?,
            category: self.category.as_deref().map(str::parse).transpose()?,
            status_code: self
                .status_code
                .as_deref()
                .map(|s| {
                    s.parse::<u16>().map_err(|_| {
                        AuditError::Validation(format!("status_code '{}' is not an integer", clip(s)))
                    })
                })
                .transpose()?,
            from: parse_time("from", self.from)?,
            to: parse_time("to", self.to)?,
        };
        filter.validate()?;

        let page = parse_int("page", self.page)?;
        let limit = parse_int("limit", self.limit)?;
        Ok((filter, page, limit))
    }
}

/// Normalize paging input: `page` >= 1, `limit` in 1..=[`MAX_AUDIT_PAGE_LIMIT`]
pub fn resolve_paging(page: Option<i64>, limit: Option<i64>) -> AuditResult<(i64, i64)> {
    let page = page.unwrap_or(1);
    if page < 1 {
        return Err(AuditError::Validation("page must be at least 1".to_string()));
    }
    let limit = limit.unwrap_or(DEFAULT_AUDIT_PAGE_LIMIT);
    if !(1..=MAX_AUDIT_PAGE_LIMIT).contains(&limit) {
        return Err(AuditError::Validation(format!(
            "limit must be between 1 and {MAX_AUDIT_PAGE_LIMIT}"
        )));
    }
    Ok((page, limit))
}

pub(crate) fn check_status(status: u16) -> AuditResult<()> {
    if !(100..=599).contains(&status) {
        return Err(AuditError::Validation(format!(
            "status_code must be between 100 and 599, got {status}"
        )));
    }
    Ok(())
}

fn parse_object_id(name: &str, raw: Option<String>) -> AuditResult<Option<ObjectId>> {
    raw.map(|s| {
        ObjectId::parse(&s).map_err(|_| {
            AuditError::Validation(format!("{name} must be a 24-character hex identifier"))
        })
    })
    .transpose()
}

fn parse_time(name: &str, raw: Option<String>) -> AuditResult<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| AuditError::Validation(format!("{name} must be an RFC 3339 timestamp")))
    })
    .transpose()
}

fn parse_int(name: &str, raw: Option<String>) -> AuditResult<Option<i64>> {
    raw.map(|s| {
        s.parse::<i64>()
            .map_err(|_| AuditError::Validation(format!("{name} must be an integer")))
    })
    .transpose()
}

// Keeps hostile input out of error messages
fn clip(s: &str) -> String {
    s.chars().take(32).collect()
}

/// Page bookkeeping for list responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

impl Pagination {
    pub fn new(page: i64, limit: i64, total: i64) -> Self {
        let pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
        Self {
            total,
            page,
            limit,
            pages,
        }
    }
}

/// One page of audit records, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub records: Vec<AuditRecord>,
    pub pagination: Pagination,
}

/// Linkage found where a record's predecessor was expected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub expected_previous_hash: String,
    pub actual_previous_hash: String,
}

/// Outcome of walking the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub records_checked: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrupted_record_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_chain: Option<BrokenLink>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ViolationKind>,
}

impl ChainVerification {
    pub fn intact(records_checked: u64) -> Self {
        Self {
            valid: true,
            records_checked,
            corrupted_record_id: None,
            broken_chain: None,
            kind: None,
        }
    }

    /// Convert a failed verification into an error
    pub fn into_result(self) -> AuditResult<Self> {
        match (self.valid, self.corrupted_record_id, self.kind) {
            (false, Some(record_id), Some(kind)) => {
                Err(AuditError::ChainIntegrityViolation { record_id, kind })
            },
            _ => Ok(self),
        }
    }
}

/// Result of the audit health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHealth {
    pub storage_writable: bool,
    /// At least one record in the last 24 hours
    pub recent_activity: bool,
    pub integrity_ok: bool,
}

impl AuditHealth {
    /// Quiet periods are not failures; only storage and integrity count
    pub fn is_healthy(&self) -> bool {
        self.storage_writable && self.integrity_ok
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const OID: &str = "507f1f77bcf86cd799439011";

    #[test]
    fn test_enum_round_trip_strings() {
        for severity in [Severity::Low, Severity::Medium, Severity::High, Severity::Critical] {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
        assert_eq!("user_management".parse::<Category>().unwrap(), Category::UserManagement);
        assert_eq!(
            serde_json::to_string(&Category::TenantManagement).unwrap(),
            r#""tenant_management""#
        );
    }

    #[test]
    fn test_unknown_enum_values_are_validation_errors() {
        assert!(matches!("urgent".parse::<Severity>(), Err(AuditError::Validation(_))));
        assert!(matches!("billing".parse::<Category>(), Err(AuditError::Validation(_))));
    }

    #[test]
    fn test_builder_requires_action_and_resource() {
        assert!(NewAuditEvent::builder().resource("clients").build().is_err());
        assert!(NewAuditEvent::builder().action("  ").resource("clients").build().is_err());

        let event = NewAuditEvent::builder()
            .action("login_attempt")
            .resource("auth")
            .status_code(401)
            .build()
            .unwrap();
        assert_eq!(event.ip_address, "unknown");
        assert_eq!(event.status_code, 401);
    }

    #[test]
    fn test_params_reject_operator_injection() {
        let params = AuditLogParams {
            actor_id: Some("{\"$ne\": null}".to_string()),
            ..Default::default()
        };
        assert!(matches!(params.into_query(), Err(AuditError::Validation(_))));
    }

    #[test]
    fn test_params_status_code_bounds() {
        for bad in ["99", "600", "abc", "-1"] {
            let params = AuditLogParams {
                status_code: Some(bad.to_string()),
                ..Default::default()
            };
            assert!(params.into_query().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_params_parse_full_filter() {
        let params = AuditLogParams {
            actor_id: Some(OID.to_uppercase()),
            action: Some("login_attempt".to_string()),
            severity: Some("high".to_string()),
            category: Some("auth".to_string()),
            status_code: Some("401".to_string()),
            from: Some("2026-01-01T00:00:00Z".to_string()),
            to: Some("2026-02-01T00:00:00Z".to_string()),
            page: Some("2".to_string()),
            limit: Some("25".to_string()),
            ..Default::default()
        };
        let (filter, page, limit) = params.into_query().unwrap();
        assert_eq!(filter.actor_id.unwrap().as_str(), OID);
        assert_eq!(filter.severity, Some(Severity::High));
        assert_eq!(filter.status_code, Some(401));
        assert_eq!((page, limit), (Some(2), Some(25)));
    }

    #[test]
    fn test_inverted_time_range_rejected() {
        let params = AuditLogParams {
            from: Some("2026-02-01T00:00:00Z".to_string()),
            to: Some("2026-01-01T00:00:00Z".to_string()),
            ..Default::default()
        };
        assert!(params.into_query().is_err());
    }

    #[test]
    fn test_resolve_paging() {
        assert_eq!(resolve_paging(None, None).unwrap(), (1, DEFAULT_AUDIT_PAGE_LIMIT));
        assert_eq!(resolve_paging(Some(3), Some(1000)).unwrap(), (3, 1000));
        assert!(resolve_paging(Some(0), None).is_err());
        assert!(resolve_paging(None, Some(1001)).is_err());
        assert!(resolve_paging(None, Some(0)).is_err());
    }

    #[test]
    fn test_pagination_pages() {
        assert_eq!(Pagination::new(1, 50, 0).pages, 0);
        assert_eq!(Pagination::new(1, 50, 50).pages, 1);
        assert_eq!(Pagination::new(1, 50, 51).pages, 2);
    }

    #[test]
    fn test_verification_into_result() {
        let id = Uuid::new_v4();
        let broken = ChainVerification {
            valid: false,
            records_checked: 3,
            corrupted_record_id: Some(id),
            broken_chain: None,
            kind: Some(ViolationKind::HashMismatch),
        };
        match broken.into_result() {
            Err(AuditError::ChainIntegrityViolation { record_id, kind }) => {
                assert_eq!(record_id, id);
                assert_eq!(kind, ViolationKind::HashMismatch);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert!(ChainVerification::intact(5).into_result().is_ok());
    }

    #[test]
    fn test_health_ignores_quiet_periods() {
        let health = AuditHealth {
            storage_writable: true,
            recent_activity: false,
            integrity_ok: true,
        };
        assert!(health.is_healthy());
    }
}
