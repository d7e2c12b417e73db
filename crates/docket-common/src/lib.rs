//! Docket Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, digests, and logging setup for the Docket workspace.
//!
//! # Overview
//!
//! This crate provides functionality used by every Docket workspace member:
//!
//! - **Error Handling**: Common error and result types
//! - **Digests**: Canonical JSON encoding and SHA-256 digests for the audit chain
//! - **Types**: Identifier shapes shared between the API and storage layers
//! - **Logging**: `tracing` subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use docket_common::digest::digest_canonical;
//! use serde_json::json;
//!
//! let hash = digest_canonical(&json!({"action": "create_users", "resource": "users"}));
//! assert_eq!(hash.len(), 64);
//! ```

pub mod digest;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{DocketError, Result};
pub use types::ObjectId;
