//! Repository facade: one capability surface over both backends.
//!
//! Composes a post repository and a comment repository chosen once at
//! startup; afterwards every call is plain delegation, so the query layer
//! never sees which backend it is talking to.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapters::memory_repo::{MemoryCommentRepo, MemoryPostRepo, MemoryStore};
use crate::{Comment, CommentRepo, NewComment, NewPost, Post, PostRepo, RepoError};

/// The five-operation surface consumed by the query-execution engine.
#[derive(Clone)]
pub struct Repository {
    posts: PostRepo,
    comments: CommentRepo,
}

impl Repository {
    pub fn new(posts: PostRepo, comments: CommentRepo) -> Self {
        Self { posts, comments }
    }

    /// Wire the in-memory backend over a shared store.
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self::new(
            Arc::new(MemoryPostRepo::new(store.clone())),
            Arc::new(MemoryCommentRepo::new(store)),
        )
    }

    pub async fn list_posts(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError> {
        self.posts.list_posts(ctx, limit, offset).await
    }

    pub async fn post_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Post, RepoError> {
        self.posts.post_by_id(ctx, id).await
    }

    pub async fn create_post(
        &self,
        ctx: &CancellationToken,
        input: NewPost,
    ) -> Result<Post, RepoError> {
        self.posts.create_post(ctx, input).await
    }

    pub async fn list_comments(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Comment>, RepoError> {
        self.comments.list_comments(ctx, limit, offset).await
    }

    pub async fn create_comment(
        &self,
        ctx: &CancellationToken,
        input: NewComment,
    ) -> Result<Comment, RepoError> {
        self.comments.create_comment(ctx, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    fn memory_repo() -> Repository {
        Repository::memory(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn seeded_user_creates_post_and_threaded_replies() {
        let repo = memory_repo();

        // Seed user "1" (Maxim) posts, comments, and replies to the comment.
        let post = repo
            .create_post(
                &ctx(),
                NewPost {
                    title: "p1".to_string(),
                    text: "body".to_string(),
                    user_id: "1".to_string(),
                    commenting_enabled: true,
                },
            )
            .await
            .expect("created");

        let c1 = repo
            .create_comment(
                &ctx(),
                NewComment {
                    post_id: post.id.clone(),
                    sender_id: "1".to_string(),
                    text: "hi".to_string(),
                    reply_to: None,
                },
            )
            .await
            .expect("created");

        let c2 = repo
            .create_comment(
                &ctx(),
                NewComment {
                    post_id: post.id.clone(),
                    sender_id: "1".to_string(),
                    text: "hello".to_string(),
                    reply_to: Some(c1.id.clone()),
                },
            )
            .await
            .expect("created");

        let fetched = repo.post_by_id(&ctx(), &post.id).await.expect("fetched");
        assert_eq!(fetched.comments.len(), 1);
        assert_eq!(fetched.comments[0].id, c1.id);
        assert_eq!(fetched.comments[0].text, "hi");
        let replies: Vec<_> = fetched.comments[0].replies.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(replies, vec![c2.id.as_str()]);
    }

    #[tokio::test]
    async fn facade_surfaces_backend_errors_verbatim() {
        let repo = memory_repo();
        let err = repo.post_by_id(&ctx(), "123").await.unwrap_err();
        assert_eq!(err, RepoError::not_found("post", "123"));
    }

    #[tokio::test]
    async fn fresh_store_lists_nothing() {
        let repo = memory_repo();
        assert!(repo.list_posts(&ctx(), 10, 0).await.expect("listed").is_empty());
        assert!(repo.list_comments(&ctx(), 10, 0).await.expect("listed").is_empty());
    }
}
