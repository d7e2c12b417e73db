//! Common types used across Docket
//!
//! The host application stores tenants, team members and clients in a
//! document database, so actor, tenant and resource identifiers arriving at
//! the audit subsystem are 12-byte ObjectIds rendered as 24 hex characters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DocketError;

/// Length of a hex-encoded ObjectId
pub const OBJECT_ID_HEX_LEN: usize = 24;

/// A validated, lowercase ObjectId string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    /// Parse an ObjectId, accepting either case and normalizing to lowercase
    pub fn parse(s: &str) -> Result<Self, DocketError> {
        if is_object_id(s) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(DocketError::InvalidIdentifier(format!(
                "'{}' is not a {}-character hex ObjectId",
                truncate_for_message(s),
                OBJECT_ID_HEX_LEN
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObjectId {
    type Err = DocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = DocketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether `s` has the shape of an ObjectId (24 hex characters)
pub fn is_object_id(s: &str) -> bool {
    s.len() == OBJECT_ID_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Whether `s` has the canonical 8-4-4-4-12 UUID shape
pub fn is_uuid_like(s: &str) -> bool {
    let groups: Vec<&str> = s.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8usize, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.bytes().all(|b| b.is_ascii_hexdigit()))
}

// Keeps hostile input out of error messages and logs
fn truncate_for_message(s: &str) -> String {
    const MAX: usize = 48;
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut end = MAX;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
