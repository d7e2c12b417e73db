//! Audit routes
//!
//! Read access to the trail plus operator endpoints. Mounted under
//! `/api/v1/audit` by the server; requests to these routes are themselves
//! audited like any other API call.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::models::{resolve_paging, AuditLogParams, DEFAULT_AUDIT_PAGE_LIMIT};
use super::service::AuditService;
use crate::api::ApiResponse;
use crate::error::{ApiResult, AppError};

/// Create audit routes
pub fn audit_routes() -> Router<AuditService> {
    Router::new()
        .route("/logs", get(list_logs))
        .route("/logs/:id/resolve", post(resolve_log))
        .route("/verify", get(verify_chain))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/jobs/failed", get(failed_jobs))
        .route("/retention/purge", post(purge_expired))
}

/// List audit records
///
/// GET /logs?actor_id=..&action=login_attempt&severity=high&page=1&limit=50
async fn list_logs(
    State(service): State<AuditService>,
    Query(params): Query<AuditLogParams>,
) -> ApiResult<Response> {
    let (filter, page, limit) = params.into_query()?;
    let (page, limit) = resolve_paging(page, limit)?;
    let records = service.find(&filter, page, limit).await?;
    Ok(ApiResponse::success(records).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct LimitParams {
    limit: Option<String>,
}

impl LimitParams {
    fn parse(self) -> Result<Option<i64>, AppError> {
        self.limit
            .map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .map_err(|_| AppError::BadRequest(format!("limit '{raw}' is not an integer")))
            })
            .transpose()
    }
}

/// Verify the most recent part of the chain
///
/// GET /verify?limit=1000
async fn verify_chain(
    State(service): State<AuditService>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Response> {
    let limit = params.parse()?;
    let verification = service.verify_chain(limit).await?;
    Ok(ApiResponse::success(verification).into_response())
}

/// Audit subsystem health
///
/// GET /health, 503 when storage is not writable or the chain is broken
async fn health(State(service): State<AuditService>) -> Response {
    let health = service.health_check().await;
    if health.is_healthy() {
        ApiResponse::success(health).into_response()
    } else {
        ApiResponse::degraded(health).with_status(StatusCode::SERVICE_UNAVAILABLE)
    }
}

/// Delivery backlog and failure counters
///
/// GET /stats
async fn stats(State(service): State<AuditService>) -> Response {
    ApiResponse::success(service.stats().await).into_response()
}

/// Queued events that exhausted their delivery attempts
///
/// GET /jobs/failed?limit=50
async fn failed_jobs(
    State(service): State<AuditService>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Response> {
    let limit = params.parse()?.unwrap_or(DEFAULT_AUDIT_PAGE_LIMIT);
    let jobs = service.failed_jobs(limit).await?;
    Ok(ApiResponse::success(jobs).into_response())
}

/// Run a retention sweep now instead of waiting for the schedule
///
/// POST /retention/purge
async fn purge_expired(State(service): State<AuditService>) -> ApiResult<Response> {
    let purged = service.purge_expired().await?;
    Ok(ApiResponse::success(json!({ "purged": purged })).into_response())
}

/// Mark a record as resolved
///
/// POST /logs/:id/resolve
async fn resolve_log(
    State(service): State<AuditService>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::BadRequest(format!("'{id}' is not a valid record id")))?;
    let record = service.resolve(id).await?;
    Ok(ApiResponse::success(record).into_response())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::audit::models::NewAuditEvent;
    use crate::audit::service::tests::memory_service;
    use crate::audit::store::MemoryAuditStore;
    use axum::body::Body;
    use axum::http::Request;
    use docket_common::ObjectId;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> (Router, AuditService, Arc<MemoryAuditStore>) {
        let (service, store) = memory_service();
        (audit_routes().with_state(service.clone()), service, store)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn seed(service: &AuditService, action: &str, status: u16) {
        let event = NewAuditEvent::builder()
            .actor_id(Some(ObjectId::parse("507f1f77bcf86cd799439011").unwrap()))
            .action(action)
            .resource("auth")
            .method("POST")
            .endpoint("/api/v1/auth/login")
            .status_code(status)
            .build()
            .unwrap();
        service.log_event(event).await;
    }

    #[tokio::test]
    async fn test_list_logs_filters_and_pages() {
        let (app, service, _) = app();
        seed(&service, "login_attempt", 401).await;
        seed(&service, "login_attempt_2fa", 200).await;

        let (status, body) = call(app, "GET", "/logs?action=login_attempt&limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["pagination"]["total"], 1);
        assert_eq!(body["data"]["records"][0]["severity"], "high");
    }

    #[tokio::test]
    async fn test_list_logs_rejects_malformed_filters() {
        for uri in [
            "/logs?severity=urgent",
            "/logs?actor_id=not-an-id",
            "/logs?status_code=abc",
            "/logs?limit=5000",
            "/logs?page=0",
        ] {
            let (app, _, _) = app();
            let (status, body) = call(app, "GET", uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body["success"], false);
        }
    }

    #[tokio::test]
    async fn test_verify_reports_tampering() {
        let (app, service, store) = app();
        for _ in 0..3 {
            seed(&service, "login_attempt", 200).await;
        }
        let victim = store.snapshot().await[2].id;
        store.tamper(victim, |r| r.resource = "billing".to_string()).await;

        let (status, body) = call(app, "GET", "/verify?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["valid"], false);
        assert_eq!(body["data"]["corrupted_record_id"], victim.to_string());
        assert_eq!(body["data"]["kind"], "hash_mismatch");
    }

    #[tokio::test]
    async fn test_verify_rejects_bad_limit() {
        let (app, _, _) = app();
        let (status, _) = call(app, "GET", "/verify?limit=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_returns_503_when_storage_fails() {
        let (app, _, store) = app();
        let (status, _) = call(app.clone(), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);

        store.set_failing(true);
        let (status, body) = call(app, "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["data"]["storage_writable"], false);
    }

    #[tokio::test]
    async fn test_resolve_route() {
        let (app, service, store) = app();
        seed(&service, "login_attempt", 401).await;
        let id = store.snapshot().await[0].id;

        let (status, body) = call(app.clone(), "POST", &format!("/logs/{id}/resolve")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["resolved_at"].is_string());

        let (status, _) = call(app.clone(), "POST", &format!("/logs/{}/resolve", Uuid::new_v4())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(app, "POST", "/logs/nope/resolve").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_route() {
        let (app, service, _) = app();
        seed(&service, "login_attempt", 200).await;
        let (status, body) = call(app, "GET", "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["direct_writes"], 1);
        assert_eq!(body["data"]["breaker"]["state"], "closed");
    }

    #[tokio::test]
    async fn test_failed_jobs_route() {
        let (app, _, _) = app();
        let (status, body) = call(app.clone(), "GET", "/jobs/failed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], serde_json::json!([]));

        let (status, _) = call(app.clone(), "GET", "/jobs/failed?limit=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app, "GET", "/jobs/failed?limit=5000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_purge_route_removes_expired_records() {
        let (app, service, store) = app();
        for _ in 0..2 {
            seed(&service, "login_attempt", 200).await;
        }
        let old = store.snapshot().await[0].id;
        store
            .tamper(old, |r| r.created_at = chrono::Utc::now() - chrono::Duration::days(3000))
            .await;

        let (status, body) = call(app, "POST", "/retention/purge").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["purged"], 1);
        assert_eq!(store.len().await, 1);
    }
}
