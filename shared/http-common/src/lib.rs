//! Shared HTTP utilities for the discussion-board workspace.
//!
//! Framework-agnostic helpers for shaping repository errors into status codes
//! and JSON bodies, plus timestamp formatting for response payloads. Keeping
//! the mapping here means every surface reports the error taxonomy the same
//! way, and backend failures never leak connection details to callers.

use chrono::{DateTime, SecondsFormat, Utc};
use domain::RepoError;

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// HTTP status for each error kind.
pub fn status_for(err: &RepoError) -> u16 {
    match err {
        RepoError::NotFound { .. } => 404,
        RepoError::CommentingDisabled | RepoError::TextTooLong { .. } => 422,
        RepoError::Cancelled => 504,
        RepoError::Backend(_) => 503,
    }
}

/// Caller-facing body for each error kind. Backend detail stays in the logs;
/// the body carries only a generic message.
pub fn error_body(err: &RepoError) -> serde_json::Value {
    match err {
        RepoError::NotFound { .. } => json_error_with_message("not_found", &err.to_string()),
        RepoError::CommentingDisabled => {
            json_error_with_message("commenting_disabled", &err.to_string())
        }
        RepoError::TextTooLong { .. } => {
            json_error_with_message("text_too_long", &err.to_string())
        }
        RepoError::Cancelled => {
            json_error_with_message("cancelled", "request cancelled or deadline exceeded")
        }
        RepoError::Backend(_) => {
            json_error_with_message("backend_unavailable", "storage backend unavailable")
        }
    }
}

/// Convert a UTC timestamp to RFC 3339 (seconds precision, `Z` suffix).
pub fn to_rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}
