//! In-memory backend: volatile storage for development and testing.
//!
//! One reader/writer lock guards the three entity maps and the three id
//! counters as a unit. Reads take the read lock; each counter-bump-and-insert
//! pair takes the write lock. A create may release the lock between its
//! validation read and the write, so two concurrent creates are not a single
//! atomic transaction.
//!
//! The whole store serializes to a single snapshot artifact at shutdown and is
//! restored at startup; counters travel with it so id allocation stays
//! monotonic across restarts.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::assemble::assemble_thread;
use crate::validate;
use crate::{
    Clock, Comment, CommentRepository, NewComment, NewPost, Post, PostRepository, RepoError,
    SystemClock, User,
};

/// Users present in a fresh store. There is no user-creation path, so the
/// user counter starts past the seeded ids.
const SEED_USERS: &[(&str, &str)] = &[("1", "Maxim"), ("2", "Vika"), ("3", "Ruslan")];

/// Serializable image of the whole store: three maps plus three counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub posts: HashMap<String, Post>,
    pub comments: HashMap<String, Comment>,
    pub users: HashMap<String, User>,
    pub post_id_counter: u64,
    pub comment_id_counter: u64,
    pub user_id_counter: u64,
}

/// Shared in-memory storage. Maps and counters are never exposed directly;
/// all access goes through the repository operations or [`Snapshot`].
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
    clock: Box<dyn Clock>,
}

impl MemoryStore {
    /// Fresh store with the seed users and counters at their initial values.
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        let mut snapshot = Snapshot {
            user_id_counter: SEED_USERS.len() as u64,
            ..Snapshot::default()
        };
        for (id, username) in SEED_USERS {
            snapshot.users.insert(
                (*id).to_string(),
                User {
                    id: (*id).to_string(),
                    username: (*username).to_string(),
                },
            );
        }
        Self {
            inner: RwLock::new(snapshot),
            clock,
        }
    }

    /// Restore a store from a previously taken snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
            clock: Box::new(SystemClock),
        }
    }

    /// Copy of the current state, taken under the read lock.
    pub fn snapshot(&self) -> Result<Snapshot, RepoError> {
        Ok(self.read()?.clone())
    }

    /// Write the snapshot artifact atomically: serialize to a temp file next
    /// to `path`, then rename over it.
    pub fn save_to_file(&self, path: &Path) -> Result<(), RepoError> {
        let snapshot = self.snapshot()?;
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| RepoError::Backend(format!("snapshot encode: {e}")))?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| RepoError::Backend(format!("snapshot dir: {e}")))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).map_err(|e| RepoError::Backend(format!("snapshot write: {e}")))?;
        fs::rename(&tmp, path).map_err(|e| RepoError::Backend(format!("snapshot rename: {e}")))?;
        Ok(())
    }

    /// Read a snapshot artifact back. Callers treat any error as non-fatal
    /// and fall back to [`MemoryStore::new`].
    pub fn load_from_file(path: &Path) -> Result<Self, RepoError> {
        let data =
            fs::read(path).map_err(|e| RepoError::Backend(format!("snapshot read: {e}")))?;
        let snapshot: Snapshot = serde_json::from_slice(&data)
            .map_err(|e| RepoError::Backend(format!("snapshot decode: {e}")))?;
        Ok(Self::from_snapshot(snapshot))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Snapshot>, RepoError> {
        self.inner
            .read()
            .map_err(|_| RepoError::Backend("storage lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Snapshot>, RepoError> {
        self.inner
            .write()
            .map_err(|_| RepoError::Backend("storage lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory post repository.
pub struct MemoryPostRepo {
    store: Arc<MemoryStore>,
}

/// In-memory comment repository.
pub struct MemoryCommentRepo {
    store: Arc<MemoryStore>,
}

impl MemoryPostRepo {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

impl MemoryCommentRepo {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

// Ids are allocated numerically; ordering on the parsed value keeps ties in
// insertion order without leaking map iteration order.
fn id_ord(id: &str) -> u64 {
    id.parse().unwrap_or(0)
}

fn ensure_live(ctx: &CancellationToken) -> Result<(), RepoError> {
    if ctx.is_cancelled() {
        return Err(RepoError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl PostRepository for MemoryPostRepo {
    async fn list_posts(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError> {
        ensure_live(ctx)?;
        let mut posts: Vec<Post> = {
            let inner = self.store.read()?;
            inner.posts.values().cloned().collect()
        };
        posts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| id_ord(&a.id).cmp(&id_ord(&b.id)))
        });
        let window = validate::clamp_window(posts.len(), limit, offset);
        Ok(posts.drain(window).collect())
    }

    async fn post_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Post, RepoError> {
        ensure_live(ctx)?;
        let (mut post, mut thread) = {
            let inner = self.store.read()?;
            let post = inner
                .posts
                .get(id)
                .cloned()
                .ok_or_else(|| RepoError::not_found("post", id))?;
            let thread: Vec<Comment> = inner
                .comments
                .values()
                .filter(|c| c.post_id == id)
                .cloned()
                .collect();
            (post, thread)
        };
        thread.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| id_ord(&a.id).cmp(&id_ord(&b.id)))
        });
        post.comments = assemble_thread(thread);
        Ok(post)
    }

    async fn create_post(
        &self,
        ctx: &CancellationToken,
        input: NewPost,
    ) -> Result<Post, RepoError> {
        ensure_live(ctx)?;
        let user = {
            let inner = self.store.read()?;
            inner
                .users
                .get(&input.user_id)
                .cloned()
                .ok_or_else(|| RepoError::not_found("user", &input.user_id))?
        };

        let mut inner = self.store.write()?;
        inner.post_id_counter += 1;
        let id = inner.post_id_counter.to_string();
        let post = Post {
            id: id.clone(),
            title: input.title,
            text: input.text,
            created_by: user,
            created_at: self.store.clock.now(),
            commenting_enabled: input.commenting_enabled,
            comments: Vec::new(),
        };
        inner.posts.insert(id, post.clone());
        Ok(post)
    }
}

#[async_trait]
impl CommentRepository for MemoryCommentRepo {
    async fn list_comments(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Comment>, RepoError> {
        ensure_live(ctx)?;
        let mut comments: Vec<Comment> = {
            let inner = self.store.read()?;
            inner.comments.values().cloned().collect()
        };
        comments.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| id_ord(&a.id).cmp(&id_ord(&b.id)))
        });
        let window = validate::clamp_window(comments.len(), limit, offset);
        Ok(comments.drain(window).collect())
    }

    async fn create_comment(
        &self,
        ctx: &CancellationToken,
        input: NewComment,
    ) -> Result<Comment, RepoError> {
        ensure_live(ctx)?;
        // Reference checks in contract order: post, commenting flag, sender,
        // reply target. Each short-circuits before any mutation.
        let sender = {
            let inner = self.store.read()?;
            let post = inner
                .posts
                .get(&input.post_id)
                .ok_or_else(|| RepoError::not_found("post", &input.post_id))?;
            if !post.commenting_enabled {
                return Err(RepoError::CommentingDisabled);
            }
            let sender = inner
                .users
                .get(&input.sender_id)
                .cloned()
                .ok_or_else(|| RepoError::not_found("user", &input.sender_id))?;
            if let Some(reply_to) = &input.reply_to {
                let target = inner
                    .comments
                    .get(reply_to)
                    .ok_or_else(|| RepoError::not_found("comment", reply_to))?;
                validate::reply_target(&target.id, &target.post_id, &input.post_id)?;
            }
            sender
        };
        validate::comment_text(&input.text)?;

        let mut inner = self.store.write()?;
        inner.comment_id_counter += 1;
        let id = inner.comment_id_counter.to_string();
        let comment = Comment {
            id: id.clone(),
            post_id: input.post_id,
            sender,
            reply_to: input.reply_to,
            text: input.text,
            created_at: self.store.clock.now(),
            // Reply lists are reconstructed at read time by the assembler;
            // stored comments never hold materialized replies.
            replies: Vec::new(),
        };
        inner.comments.insert(id, comment.clone());
        Ok(comment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::MAX_COMMENT_LEN;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock advancing one second per reading, so creation order and
    /// timestamp order agree in tests.
    struct StepClock(AtomicI64);

    impl StepClock {
        fn new() -> Self {
            Self(AtomicI64::new(1_700_000_000))
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> DateTime<Utc> {
            let secs = self.0.fetch_add(1, Ordering::Relaxed);
            DateTime::from_timestamp(secs, 0).expect("valid timestamp")
        }
    }

    fn test_store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_clock(Box::new(StepClock::new())))
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    fn new_post(title: &str) -> NewPost {
        NewPost {
            title: title.to_string(),
            text: "body".to_string(),
            user_id: "1".to_string(),
            commenting_enabled: true,
        }
    }

    fn new_comment(post_id: &str, text: &str, reply_to: Option<&str>) -> NewComment {
        NewComment {
            post_id: post_id.to_string(),
            sender_id: "1".to_string(),
            text: text.to_string(),
            reply_to: reply_to.map(String::from),
        }
    }

    #[tokio::test]
    async fn create_post_rejects_unknown_user() {
        let repo = MemoryPostRepo::new(test_store());
        let err = repo
            .create_post(
                &ctx(),
                NewPost {
                    user_id: "99".to_string(),
                    ..new_post("p")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::not_found("user", "99"));
    }

    #[tokio::test]
    async fn create_post_records_flag_verbatim() {
        let repo = MemoryPostRepo::new(test_store());
        let post = repo
            .create_post(
                &ctx(),
                NewPost {
                    commenting_enabled: false,
                    ..new_post("closed")
                },
            )
            .await
            .expect("created");
        assert!(!post.commenting_enabled);
        assert!(post.comments.is_empty());
        assert_eq!(post.created_by.username, "Maxim");
    }

    #[tokio::test]
    async fn list_posts_is_creation_time_descending() {
        let store = test_store();
        let repo = MemoryPostRepo::new(store);
        for i in 0..3 {
            repo.create_post(&ctx(), new_post(&format!("p{i}")))
                .await
                .expect("created");
        }

        let posts = repo.list_posts(&ctx(), 10, 0).await.expect("listed");
        let titles: Vec<_> = posts.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["p2", "p1", "p0"]);
    }

    #[tokio::test]
    async fn list_posts_clamps_the_window() {
        let repo = MemoryPostRepo::new(test_store());
        for i in 0..5 {
            repo.create_post(&ctx(), new_post(&format!("p{i}")))
                .await
                .expect("created");
        }

        // window past the end truncates
        let tail = repo.list_posts(&ctx(), 10, 3).await.expect("listed");
        assert_eq!(tail.len(), 2);

        // offset at and past the end is empty, not an error
        assert!(repo.list_posts(&ctx(), 10, 5).await.expect("listed").is_empty());
        assert!(repo.list_posts(&ctx(), 10, 50).await.expect("listed").is_empty());
    }

    #[tokio::test]
    async fn post_ids_are_strictly_increasing() {
        let repo = MemoryPostRepo::new(test_store());
        let mut last = 0u64;
        for i in 0..5 {
            let post = repo
                .create_post(&ctx(), new_post(&format!("p{i}")))
                .await
                .expect("created");
            let id: u64 = post.id.parse().expect("numeric id");
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn id_allocation_stays_monotonic_across_snapshot_restore() {
        let store = test_store();
        let repo = MemoryPostRepo::new(store.clone());
        for i in 0..3 {
            repo.create_post(&ctx(), new_post(&format!("p{i}")))
                .await
                .expect("created");
        }

        let restored = Arc::new(MemoryStore::from_snapshot(
            store.snapshot().expect("snapshot"),
        ));
        let repo = MemoryPostRepo::new(restored);
        let post = repo.create_post(&ctx(), new_post("after")).await.expect("created");
        assert_eq!(post.id, "4");
    }

    #[tokio::test]
    async fn snapshot_file_roundtrip_preserves_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");

        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store.clone());
        let post = posts.create_post(&ctx(), new_post("p")).await.expect("created");
        comments
            .create_comment(&ctx(), new_comment(&post.id, "hi", None))
            .await
            .expect("created");
        store.save_to_file(&path).expect("saved");

        let restored = MemoryStore::load_from_file(&path).expect("loaded");
        let snapshot = restored.snapshot().expect("snapshot");
        assert_eq!(snapshot.posts.len(), 1);
        assert_eq!(snapshot.comments.len(), 1);
        assert_eq!(snapshot.users.len(), 3);
        assert_eq!(snapshot.post_id_counter, 1);
        assert_eq!(snapshot.comment_id_counter, 1);
        assert_eq!(snapshot.user_id_counter, 3);
    }

    #[tokio::test]
    async fn corrupt_snapshot_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("storage.json");
        fs::write(&path, b"{ not json").expect("written");
        assert!(MemoryStore::load_from_file(&path).is_err());
    }

    #[tokio::test]
    async fn post_by_id_assembles_the_full_tree() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store);

        let post = posts.create_post(&ctx(), new_post("p")).await.expect("created");
        let c1 = comments
            .create_comment(&ctx(), new_comment(&post.id, "hi", None))
            .await
            .expect("created");
        let c2 = comments
            .create_comment(&ctx(), new_comment(&post.id, "hello", Some(&c1.id)))
            .await
            .expect("created");
        let c3 = comments
            .create_comment(&ctx(), new_comment(&post.id, "deeper", Some(&c2.id)))
            .await
            .expect("created");

        let fetched = posts.post_by_id(&ctx(), &post.id).await.expect("fetched");
        assert_eq!(fetched.comments.len(), 1);
        let root = &fetched.comments[0];
        assert_eq!(root.id, c1.id);
        assert_eq!(root.replies.len(), 1);
        assert_eq!(root.replies[0].id, c2.id);
        assert_eq!(root.replies[0].replies[0].id, c3.id);
    }

    #[tokio::test]
    async fn post_by_id_is_idempotent() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store);

        let post = posts.create_post(&ctx(), new_post("p")).await.expect("created");
        let c1 = comments
            .create_comment(&ctx(), new_comment(&post.id, "a", None))
            .await
            .expect("created");
        comments
            .create_comment(&ctx(), new_comment(&post.id, "b", Some(&c1.id)))
            .await
            .expect("created");

        let first = posts.post_by_id(&ctx(), &post.id).await.expect("fetched");
        let second = posts.post_by_id(&ctx(), &post.id).await.expect("fetched");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn post_by_id_unknown_is_not_found() {
        let repo = MemoryPostRepo::new(test_store());
        let err = repo.post_by_id(&ctx(), "7").await.unwrap_err();
        assert_eq!(err, RepoError::not_found("post", "7"));
    }

    #[tokio::test]
    async fn list_view_never_carries_comment_trees() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store);

        let post = posts.create_post(&ctx(), new_post("p")).await.expect("created");
        comments
            .create_comment(&ctx(), new_comment(&post.id, "hi", None))
            .await
            .expect("created");

        let listed = posts.list_posts(&ctx(), 10, 0).await.expect("listed");
        assert!(listed[0].comments.is_empty());
    }

    #[tokio::test]
    async fn create_comment_validation_order_and_short_circuit() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store.clone());

        // Nonexistent post wins over an oversized body.
        let long = "x".repeat(MAX_COMMENT_LEN + 1);
        let err = comments
            .create_comment(&ctx(), new_comment("99", &long, None))
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::not_found("post", "99"));

        // Disabled post wins over an unknown sender.
        let closed = posts
            .create_post(
                &ctx(),
                NewPost {
                    commenting_enabled: false,
                    ..new_post("closed")
                },
            )
            .await
            .expect("created");
        let err = comments
            .create_comment(
                &ctx(),
                NewComment {
                    sender_id: "99".to_string(),
                    ..new_comment(&closed.id, "hi", None)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::CommentingDisabled);

        // Unknown sender on an open post.
        let open = posts.create_post(&ctx(), new_post("open")).await.expect("created");
        let err = comments
            .create_comment(
                &ctx(),
                NewComment {
                    sender_id: "99".to_string(),
                    ..new_comment(&open.id, "hi", None)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::not_found("user", "99"));

        // Unknown reply target.
        let err = comments
            .create_comment(&ctx(), new_comment(&open.id, "hi", Some("42")))
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::not_found("comment", "42"));

        // Oversized body once the references resolve.
        let err = comments
            .create_comment(&ctx(), new_comment(&open.id, &long, None))
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::TextTooLong { max: MAX_COMMENT_LEN });

        // None of the failures left state behind.
        let snapshot = store.snapshot().expect("snapshot");
        assert_eq!(snapshot.comments.len(), 0);
        assert_eq!(snapshot.comment_id_counter, 0);
    }

    #[tokio::test]
    async fn reply_target_from_another_post_is_rejected() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store);

        let p1 = posts.create_post(&ctx(), new_post("p1")).await.expect("created");
        let p2 = posts.create_post(&ctx(), new_post("p2")).await.expect("created");
        let other = comments
            .create_comment(&ctx(), new_comment(&p1.id, "on p1", None))
            .await
            .expect("created");

        let err = comments
            .create_comment(&ctx(), new_comment(&p2.id, "cross", Some(&other.id)))
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::not_found("comment", &other.id));
    }

    #[tokio::test]
    async fn disabled_post_leaves_storage_unchanged() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store.clone());

        let post = posts
            .create_post(
                &ctx(),
                NewPost {
                    commenting_enabled: false,
                    ..new_post("closed")
                },
            )
            .await
            .expect("created");

        let before = store.snapshot().expect("snapshot").comments.len();
        let err = comments
            .create_comment(&ctx(), new_comment(&post.id, "nope", None))
            .await
            .unwrap_err();
        assert_eq!(err, RepoError::CommentingDisabled);
        let after = store.snapshot().expect("snapshot").comments.len();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn list_comments_is_flat_and_descending() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store);

        let p1 = posts.create_post(&ctx(), new_post("p1")).await.expect("created");
        let p2 = posts.create_post(&ctx(), new_post("p2")).await.expect("created");
        let c1 = comments
            .create_comment(&ctx(), new_comment(&p1.id, "first", None))
            .await
            .expect("created");
        let c2 = comments
            .create_comment(&ctx(), new_comment(&p2.id, "second", None))
            .await
            .expect("created");
        let c3 = comments
            .create_comment(&ctx(), new_comment(&p1.id, "third", Some(&c1.id)))
            .await
            .expect("created");

        let listed = comments.list_comments(&ctx(), 10, 0).await.expect("listed");
        let ids: Vec<_> = listed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![c3.id.as_str(), c2.id.as_str(), c1.id.as_str()]);
        assert!(listed.iter().all(|c| c.replies.is_empty()));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_every_operation() {
        let store = test_store();
        let posts = MemoryPostRepo::new(store.clone());
        let comments = MemoryCommentRepo::new(store);

        let cancelled = CancellationToken::new();
        cancelled.cancel();

        assert_eq!(
            posts.list_posts(&cancelled, 10, 0).await.unwrap_err(),
            RepoError::Cancelled
        );
        assert_eq!(
            posts.post_by_id(&cancelled, "1").await.unwrap_err(),
            RepoError::Cancelled
        );
        assert_eq!(
            posts.create_post(&cancelled, new_post("p")).await.unwrap_err(),
            RepoError::Cancelled
        );
        assert_eq!(
            comments.list_comments(&cancelled, 10, 0).await.unwrap_err(),
            RepoError::Cancelled
        );
        assert_eq!(
            comments
                .create_comment(&cancelled, new_comment("1", "hi", None))
                .await
                .unwrap_err(),
            RepoError::Cancelled
        );
    }
}
