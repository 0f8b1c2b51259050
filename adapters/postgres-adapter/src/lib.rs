//! postgres-adapter — PostgreSQL implementation of the repository ports.
//!
//! The pool is treated as an opaque SQL executor: the host constructs it from
//! its own configuration and hands it in. One statement per logical step, no
//! explicit multi-statement transactions; each statement races the caller's
//! cancellation token. Ids are backend-native `BIGSERIAL` surrogate keys and
//! creation stamps come from the database, so the contract matches the
//! in-memory backend observably.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use domain::{
    assemble_thread, validate, Comment, CommentRepository, NewComment, NewPost, Post,
    PostRepository, RepoError, Repository, User,
};

pub use sqlx::PgPool;

/// Open a connection pool. Host/port/credentials/SSL mode all come in via the
/// URL; this crate never parses connection configuration itself.
pub async fn connect(database_url: &str) -> Result<PgPool, RepoError> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(backend_error)
}

/// Create tables if they are absent and seed the well-known users
/// idempotently. Production deployments pre-populate users externally; the
/// seed keeps local runs aligned with the in-memory backend.
pub async fn init_schema(pool: &PgPool) -> Result<(), RepoError> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            username TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS posts (
            id BIGSERIAL PRIMARY KEY,
            title TEXT NOT NULL,
            text TEXT NOT NULL,
            created_by BIGINT NOT NULL REFERENCES users(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            commenting_enabled BOOLEAN NOT NULL DEFAULT TRUE
        );
        CREATE TABLE IF NOT EXISTS comments (
            id BIGSERIAL PRIMARY KEY,
            post_id BIGINT NOT NULL REFERENCES posts(id),
            sender BIGINT NOT NULL REFERENCES users(id),
            reply_to BIGINT REFERENCES comments(id),
            text TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        CREATE INDEX IF NOT EXISTS idx_comments_post_id ON comments(post_id);
        CREATE INDEX IF NOT EXISTS idx_comments_reply_to ON comments(reply_to);

        INSERT INTO users (id, username)
        VALUES (1, 'Maxim'), (2, 'Vika'), (3, 'Ruslan')
        ON CONFLICT (id) DO NOTHING;
        SELECT setval('users_id_seq', GREATEST((SELECT MAX(id) FROM users), 1));
        "#,
    )
    .execute(pool)
    .await
    .map_err(backend_error)?;
    Ok(())
}

/// Wire the relational backend behind the facade.
pub fn repository(pool: PgPool) -> Repository {
    Repository::new(
        Arc::new(PgPostRepo::new(pool.clone())),
        Arc::new(PgCommentRepo::new(pool)),
    )
}

#[derive(Debug, sqlx::FromRow)]
struct PostRow {
    id: i64,
    title: String,
    text: String,
    created_at: DateTime<Utc>,
    commenting_enabled: bool,
    user_id: i64,
    username: String,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Post {
            id: row.id.to_string(),
            title: row.title,
            text: row.text,
            created_by: User {
                id: row.user_id.to_string(),
                username: row.username,
            },
            created_at: row.created_at,
            commenting_enabled: row.commenting_enabled,
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommentRow {
    id: i64,
    post_id: i64,
    reply_to: Option<i64>,
    text: String,
    created_at: DateTime<Utc>,
    sender_id: i64,
    username: String,
}

impl From<CommentRow> for Comment {
    fn from(row: CommentRow) -> Self {
        Comment {
            id: row.id.to_string(),
            post_id: row.post_id.to_string(),
            sender: User {
                id: row.sender_id.to_string(),
                username: row.username,
            },
            reply_to: row.reply_to.map(|id| id.to_string()),
            text: row.text,
            created_at: row.created_at,
            replies: Vec::new(),
        }
    }
}

/// Relational post repository.
pub struct PgPostRepo {
    pool: PgPool,
}

/// Relational comment repository.
pub struct PgCommentRepo {
    pool: PgPool,
}

impl PgPostRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgCommentRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// Ids are numeric surrogate keys; a string that does not parse cannot
// reference a row, so it resolves to NotFound rather than a driver error.
fn parse_id(resource: &'static str, id: &str) -> Result<i64, RepoError> {
    id.parse().map_err(|_| RepoError::not_found(resource, id))
}

fn backend_error(err: sqlx::Error) -> RepoError {
    tracing::error!(error = %err, "postgres statement failed");
    RepoError::Backend(err.to_string())
}

/// Race a statement against the caller's cancellation token.
async fn guard<T, F>(ctx: &CancellationToken, statement: F) -> Result<T, RepoError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(RepoError::Cancelled),
        res = statement => res.map_err(backend_error),
    }
}

const POST_FIELDS: &str = "p.id, p.title, p.text, p.created_at, p.commenting_enabled, \
                           u.id AS user_id, u.username";

#[async_trait]
impl PostRepository for PgPostRepo {
    async fn list_posts(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Post>, RepoError> {
        let query = format!(
            "SELECT {POST_FIELDS} FROM posts p JOIN users u ON p.created_by = u.id \
             ORDER BY p.created_at DESC, p.id LIMIT $1 OFFSET $2"
        );
        let rows: Vec<PostRow> = guard(
            ctx,
            sqlx::query_as(&query)
                .bind(limit as i64)
                .bind(offset as i64)
                .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(Post::from).collect())
    }

    async fn post_by_id(&self, ctx: &CancellationToken, id: &str) -> Result<Post, RepoError> {
        let post_id = parse_id("post", id)?;

        let query = format!(
            "SELECT {POST_FIELDS} FROM posts p JOIN users u ON p.created_by = u.id \
             WHERE p.id = $1"
        );
        let row: Option<PostRow> = guard(
            ctx,
            sqlx::query_as(&query).bind(post_id).fetch_optional(&self.pool),
        )
        .await?;
        let mut post = Post::from(row.ok_or_else(|| RepoError::not_found("post", id))?);

        // Walk the whole thread from the post's roots in one round trip,
        // creation time ascending, then assemble the forest in memory.
        let rows: Vec<CommentRow> = guard(
            ctx,
            sqlx::query_as(
                r#"
                WITH RECURSIVE thread AS (
                    SELECT c.id, c.post_id, c.reply_to, c.sender, c.text, c.created_at
                    FROM comments c
                    WHERE c.post_id = $1 AND c.reply_to IS NULL
                    UNION ALL
                    SELECT c.id, c.post_id, c.reply_to, c.sender, c.text, c.created_at
                    FROM comments c
                    INNER JOIN thread t ON c.reply_to = t.id
                )
                SELECT t.id, t.post_id, t.reply_to, t.text, t.created_at,
                       u.id AS sender_id, u.username
                FROM thread t
                JOIN users u ON t.sender = u.id
                ORDER BY t.created_at, t.id
                "#,
            )
            .bind(post_id)
            .fetch_all(&self.pool),
        )
        .await?;

        post.comments = assemble_thread(rows.into_iter().map(Comment::from).collect());
        Ok(post)
    }

    async fn create_post(
        &self,
        ctx: &CancellationToken,
        input: NewPost,
    ) -> Result<Post, RepoError> {
        let user_id = parse_id("user", &input.user_id)?;

        let user: Option<(i64, String)> = guard(
            ctx,
            sqlx::query_as("SELECT id, username FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        let (user_id, username) =
            user.ok_or_else(|| RepoError::not_found("user", &input.user_id))?;

        let (id, created_at): (i64, DateTime<Utc>) = guard(
            ctx,
            sqlx::query_as(
                "INSERT INTO posts (title, text, created_by, commenting_enabled) \
                 VALUES ($1, $2, $3, $4) RETURNING id, created_at",
            )
            .bind(&input.title)
            .bind(&input.text)
            .bind(user_id)
            .bind(input.commenting_enabled)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(Post {
            id: id.to_string(),
            title: input.title,
            text: input.text,
            created_by: User {
                id: user_id.to_string(),
                username,
            },
            created_at,
            commenting_enabled: input.commenting_enabled,
            comments: Vec::new(),
        })
    }
}

#[async_trait]
impl CommentRepository for PgCommentRepo {
    async fn list_comments(
        &self,
        ctx: &CancellationToken,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Comment>, RepoError> {
        let rows: Vec<CommentRow> = guard(
            ctx,
            sqlx::query_as(
                "SELECT c.id, c.post_id, c.reply_to, c.text, c.created_at, \
                        u.id AS sender_id, u.username \
                 FROM comments c JOIN users u ON c.sender = u.id \
                 ORDER BY c.created_at DESC, c.id LIMIT $1 OFFSET $2",
            )
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(Comment::from).collect())
    }

    async fn create_comment(
        &self,
        ctx: &CancellationToken,
        input: NewComment,
    ) -> Result<Comment, RepoError> {
        let post_id = parse_id("post", &input.post_id)?;

        // Reference checks in contract order, one statement per step.
        let enabled: Option<(bool,)> = guard(
            ctx,
            sqlx::query_as("SELECT commenting_enabled FROM posts WHERE id = $1")
                .bind(post_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        let (enabled,) = enabled.ok_or_else(|| RepoError::not_found("post", &input.post_id))?;
        if !enabled {
            return Err(RepoError::CommentingDisabled);
        }

        let sender_id = parse_id("user", &input.sender_id)?;
        let sender: Option<(i64, String)> = guard(
            ctx,
            sqlx::query_as("SELECT id, username FROM users WHERE id = $1")
                .bind(sender_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        let (sender_id, username) =
            sender.ok_or_else(|| RepoError::not_found("user", &input.sender_id))?;

        let reply_to = match &input.reply_to {
            Some(reply_to) => {
                let target_id = parse_id("comment", reply_to)?;
                let target: Option<(i64,)> = guard(
                    ctx,
                    sqlx::query_as("SELECT post_id FROM comments WHERE id = $1")
                        .bind(target_id)
                        .fetch_optional(&self.pool),
                )
                .await?;
                let (target_post,) =
                    target.ok_or_else(|| RepoError::not_found("comment", reply_to))?;
                validate::reply_target(reply_to, &target_post.to_string(), &post_id.to_string())?;
                Some(target_id)
            }
            None => None,
        };

        validate::comment_text(&input.text)?;

        let (id, created_at): (i64, DateTime<Utc>) = guard(
            ctx,
            sqlx::query_as(
                "INSERT INTO comments (post_id, sender, reply_to, text) \
                 VALUES ($1, $2, $3, $4) RETURNING id, created_at",
            )
            .bind(post_id)
            .bind(sender_id)
            .bind(reply_to)
            .bind(&input.text)
            .fetch_one(&self.pool),
        )
        .await?;

        Ok(Comment {
            id: id.to_string(),
            post_id: input.post_id,
            sender: User {
                id: sender_id.to_string(),
                username,
            },
            reply_to: input.reply_to,
            text: input.text,
            created_at,
            replies: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_id_accepts_numeric_strings() {
        assert_eq!(parse_id("post", "42").expect("parsed"), 42);
    }

    #[test]
    fn parse_id_maps_garbage_to_not_found() {
        let err = parse_id("post", "abc").unwrap_err();
        assert_eq!(err, RepoError::not_found("post", "abc"));

        let err = parse_id("comment", "").unwrap_err();
        assert_eq!(err, RepoError::not_found("comment", ""));
    }

    #[tokio::test]
    async fn guard_prefers_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let res: Result<(), RepoError> = guard(&ctx, async { Ok(()) }).await;
        assert_eq!(res.unwrap_err(), RepoError::Cancelled);
    }
}
