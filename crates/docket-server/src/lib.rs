//! Docket Server Library
#![recursion_limit = "256"]
//!
//! HTTP backend for multi-tenant case management.
//!
//! # Overview
//!
//! - **API Endpoints**: RESTful API under `/api/v1`
//! - **Database Management**: PostgreSQL integration with SQLx
//! - **Configuration**: Environment-based configuration management
//! - **Middleware**: CORS, request tracing, and audit capture
//!
//! ## Audit Logging
//!
//! Every exchange under the API prefix is recorded by [`audit::AuditLayer`]:
//! - Actor and tenant (when known)
//! - Action, resource and resource id derived from the route
//! - Redacted, size-bounded request and response bodies
//! - Client IP, user agent and status code
//! - Category, severity and a hash link to the previous record
//!
//! Query and verify the trail via the `/api/v1/audit` endpoints.
//!
//! # Example
//!
//! ```no_run
//! use docket_server::audit::{AuditService, MemoryAuditStore};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = AuditService::builder()
//!     .store(Arc::new(MemoryAuditStore::new()))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod middleware;

// Re-export commonly used types
pub use error::{AppError, AuditError, AuditResult};
