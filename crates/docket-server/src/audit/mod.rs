//! Audit logging module
//!
//! Tamper-evident audit trail for every API exchange of the service.
//!
//! # Architecture
//!
//! - **Capture**: [`AuditLayer`] observes each request/response exchange and
//!   emits one [`NewAuditEvent`] without touching the response
//! - **Protection**: bodies are redacted and size-bounded before they are
//!   queued or stored ([`redaction`])
//! - **Classification**: category from the path, severity from category and
//!   status ([`classification`])
//! - **Delivery**: durable queue, then a circuit-breaker guarded direct
//!   write, then a last plain write; total failures raise an alert
//!   ([`pipeline`])
//! - **Integrity**: every record is hash-chained to its predecessor under a
//!   single lock ([`hash_chain`])
//! - **Storage**: [`AuditStore`] with Postgres and in-memory backends,
//!   filtered queries and retention ([`store`], [`queries`], [`retention`])
//!
//! # Usage
//!
//! ```no_run
//! use axum::Router;
//! use docket_server::audit::{self, AuditService, PgAuditStore};
//! use sqlx::PgPool;
//! use std::sync::Arc;
//!
//! # async fn example(pool: PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let service = AuditService::builder()
//!     .store(Arc::new(PgAuditStore::new(pool)))
//!     .build()?;
//!
//! let app: Router = Router::new()
//!     .nest("/api/v1/audit", audit::audit_routes().with_state(service.clone()))
//!     .layer(audit::AuditLayer::new(service));
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Manual Audit Logging
//!
//! ```no_run
//! use docket_server::audit::{AuditService, NewAuditEvent};
//!
//! # async fn example(service: AuditService) -> Result<(), Box<dyn std::error::Error>> {
//! let event = NewAuditEvent::builder()
//!     .action("export_case_bundle")
//!     .resource("cases")
//!     .endpoint("jobs/export")
//!     .build()?;
//!
//! service.log_event(event).await;
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod breaker;
pub mod classification;
pub mod hash_chain;
mod middleware;
pub mod models;
pub mod pipeline;
pub mod queries;
pub mod queue;
pub mod redaction;
pub mod retention;
mod routes;
pub mod service;
pub mod store;
pub mod worker;


pub use alert::{AlertSink, AuditAlert, LogAlertSink};
pub use breaker::{BreakerState, CircuitBreaker};
pub use hash_chain::{HashChain, GENESIS_HASH};
pub use middleware::{AuditContext, AuditLayer, AuditMiddleware};
pub use models::{
    AuditFilter, AuditHealth, AuditPage, AuditRecord, Category, ChainVerification, ErrorInfo,
    NewAuditEvent, Pagination, Severity,
};
pub use pipeline::{resolve_queue, DeliveryStats};
pub use queries::PgAuditStore;
pub use queue::{JobQueue, MemoryJobQueue, PgJobQueue, RetryPolicy};
pub use redaction::Redactor;
pub use routes::audit_routes;
pub use service::{AuditRuntime, AuditService};
pub use store::{AuditStore, MemoryAuditStore};
