//! Severity and category assignment

use super::models::{Category, Severity};

/// Path segments that select a category, checked in order
const CATEGORY_KEYWORDS: &[(&[&str], Category)] = &[
    (&["auth"], Category::Auth),
    (&["users", "team-members"], Category::UserManagement),
    (&["tenants", "super-admin"], Category::TenantManagement),
    (&["security", "sessions"], Category::Security),
    (&["health", "monitoring"], Category::System),
];

/// Severity from category and response status; first matching rule wins
pub fn classify(category: Category, status_code: u16) -> Severity {
    let failed = status_code >= 400;
    match category {
        Category::Security if failed => Severity::Critical,
        Category::Auth if failed => Severity::High,
        _ if status_code >= 500 => Severity::High,
        _ if failed => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Category from a request path
///
/// Keywords match whole path segments, so `/api/v1/authors` is not `auth`.
pub fn categorize_path(path: &str) -> Category {
    let path = path.to_lowercase();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    CATEGORY_KEYWORDS
        .iter()
        .find(|(keywords, _)| segments.iter().any(|segment| keywords.contains(segment)))
        .map(|(_, category)| *category)
        .unwrap_or(Category::DataAccess)
}
