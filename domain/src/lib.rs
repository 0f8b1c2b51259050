//! Domain library for the discussion-board service.
//!
//! This crate holds the entity types, ports (repository traits), error
//! definitions, the comment-thread assembler, and the in-memory backend.
//! Relational adapters and IO concerns beyond snapshot persistence live in
//! their own crates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A board member. Users are seeded at startup (in-memory) or pre-populated
/// externally (relational); there is no create/update path for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
}

/// A post on the board.
///
/// `comments` holds the assembled reply forest and is only populated by
/// `post_by_id`; list views and stored values keep it empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    pub text: String,
    pub created_by: User,
    pub created_at: DateTime<Utc>,
    pub commenting_enabled: bool,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

/// A comment on a post. `reply_to` is the parent comment id; `None` marks a
/// root comment. `replies` is only populated when a thread is materialized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub sender: User,
    pub reply_to: Option<String>,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub replies: Vec<Comment>,
}

/// Input data for creating a post. The commenting flag is recorded verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewPost {
    pub title: String,
    pub text: String,
    pub user_id: String,
    pub commenting_enabled: bool,
}

/// Input data for creating a comment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewComment {
    pub post_id: String,
    pub sender_id: String,
    pub text: String,
    pub reply_to: Option<String>,
}

/// Time source abstraction so creation stamps are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation used outside of tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Repository errors, surfaced verbatim to the caller; no local recovery.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RepoError {
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("commenting is not allowed on this post")]
    CommentingDisabled,

    #[error("comment text exceeds {max} characters")]
    TextTooLong { max: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("backend error: {0}")]
    Backend(String),
}

impl RepoError {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource,
            id: id.into(),
        }
    }
}

/// Repository port for posts. Both backends satisfy the same contract:
/// listings are creation-time descending with clamped windows, and
/// `post_by_id` carries the full assembled comment tree.
#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn list_posts(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError>;

    async fn post_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Post, RepoError>;

    async fn create_post(
        &self,
        ctx: &CancellationToken,
        input: NewPost,
    ) -> Result<Post, RepoError>;
}

/// Repository port for comments. `list_comments` is a flat listing across all
/// posts; `create_comment` runs the ordered reference checks before mutating.
#[async_trait]
pub trait CommentRepository: Send + Sync {
    async fn list_comments(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Comment>, RepoError>;

    async fn create_comment(
        &self,
        ctx: &CancellationToken,
        input: NewComment,
    ) -> Result<Comment, RepoError>;
}

/// Shared handles used by the facade; one backend is chosen at startup.
pub type PostRepo = Arc<dyn PostRepository>;
pub type CommentRepo = Arc<dyn CommentRepository>;

pub mod adapters;
pub mod assemble;
pub mod service;
pub mod validate;

pub use assemble::assemble_thread;
pub use service::Repository;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_formats_resource_and_id() {
        let err = RepoError::not_found("post", "42");
        assert_eq!(err.to_string(), "post 42 not found");
    }

    #[test]
    fn backend_error_keeps_detail_for_logs() {
        let err = RepoError::Backend("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
    }
}
