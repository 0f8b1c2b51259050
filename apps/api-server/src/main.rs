//! api-server — HTTP host for the discussion-board repository layer.
//!
//! Thin JSON shim over the repository facade's five operations:
//! - Storage: in-memory (default, snapshot-persisted across restarts) or
//!   PostgreSQL when the `postgres` feature is enabled.
//! - Query/transport shaping beyond these handlers belongs to the consuming
//!   query engine; handlers only translate payloads and error kinds.
//!
//! Run:
//! ```bash
//! # in-memory backend, pretty logs (default); PORT optional
//! cargo run -p api-server
//!
//! # relational backend
//! STORAGE_PROVIDER=postgres \
//! DATABASE_URL=postgres://localhost/board \
//!   cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use domain::adapters::memory_repo::MemoryStore;
use domain::{Comment, NewComment, NewPost, Post, RepoError, Repository};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone)]
struct AppState {
    repo: Repository,
    request_timeout: Option<Duration>,
}

#[tokio::main]
async fn main() {
    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_volatile();

    let (repo, store) = build_backend(&cfg).await;
    let state = AppState {
        repo,
        request_timeout: cfg.request_timeout,
    };

    // Request ID header name
    let x_request_id = axum::http::HeaderName::from_static("x-request-id");

    let app = Router::new()
        .route("/api/posts", get(list_posts).post(create_post))
        .route("/api/posts/:id", get(post_by_id))
        .route("/api/comments", get(list_comments).post(create_comment))
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .with_state(state);

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    info!(%addr, "api-server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("bind port");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // The snapshot is the in-memory backend's only durability; write it before
    // the process goes away.
    if let Some(store) = store {
        match store.save_to_file(&cfg.snapshot_path) {
            Ok(()) => info!(path = %cfg.snapshot_path.display(), "snapshot saved"),
            Err(err) => error!(%err, "failed to save snapshot"),
        }
    }
    info!("server stopped");
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

// Construct the backend once at startup; everything after goes through the
// facade and never learns which one was chosen.
async fn build_backend(cfg: &config::Config) -> (Repository, Option<Arc<MemoryStore>>) {
    match cfg.storage_provider {
        #[cfg(feature = "postgres")]
        config::StorageProvider::Postgres => {
            // Validated in Config::from_env when the provider is postgres
            let url = cfg.database_url.as_deref().unwrap_or_default();
            let pool = match postgres_adapter::connect(url).await {
                Ok(pool) => pool,
                Err(err) => {
                    error!(%err, "failed to connect to postgres");
                    std::process::exit(1);
                }
            };
            if let Err(err) = postgres_adapter::init_schema(&pool).await {
                error!(%err, "failed to initialize schema");
                std::process::exit(1);
            }
            info!("storage backend: postgres");
            (postgres_adapter::repository(pool), None)
        }
        #[cfg(not(feature = "postgres"))]
        config::StorageProvider::Postgres => {
            eprintln!("api-server was built without the postgres feature");
            std::process::exit(1);
        }
        config::StorageProvider::Memory => {
            let store = match MemoryStore::load_from_file(&cfg.snapshot_path) {
                Ok(restored) => {
                    info!(path = %cfg.snapshot_path.display(), "snapshot restored");
                    Arc::new(restored)
                }
                Err(err) => {
                    warn!(%err, "no usable snapshot, starting from seeded state");
                    Arc::new(MemoryStore::new())
                }
            };
            info!("storage backend: memory");
            (Repository::memory(store.clone()), Some(store))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Per-request cancellation token; fires after the configured deadline.
fn request_ctx(timeout: Option<Duration>) -> CancellationToken {
    let ctx = CancellationToken::new();
    if let Some(after) = timeout {
        let token = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }
    ctx
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Deserialize)]
struct CreatePostReq {
    title: String,
    text: String,
    user_id: String,
    commenting_enabled: bool,
}

#[derive(Deserialize)]
struct CreateCommentReq {
    post_id: String,
    sender_id: String,
    text: String,
    #[serde(default)]
    reply_to: Option<String>,
}

#[derive(Serialize)]
struct UserOut {
    id: String,
    username: String,
}

#[derive(Serialize)]
struct PostOut {
    id: String,
    title: String,
    text: String,
    created_at: String,
    commenting_enabled: bool,
    created_by: UserOut,
    comments: Vec<CommentOut>,
}

#[derive(Serialize)]
struct CommentOut {
    id: String,
    post_id: String,
    sender: UserOut,
    reply_to: Option<String>,
    text: String,
    created_at: String,
    replies: Vec<CommentOut>,
}

fn post_out(post: &Post) -> PostOut {
    PostOut {
        id: post.id.clone(),
        title: post.title.clone(),
        text: post.text.clone(),
        created_at: http_common::to_rfc3339(post.created_at),
        commenting_enabled: post.commenting_enabled,
        created_by: UserOut {
            id: post.created_by.id.clone(),
            username: post.created_by.username.clone(),
        },
        comments: post.comments.iter().map(comment_out).collect(),
    }
}

fn comment_out(comment: &Comment) -> CommentOut {
    CommentOut {
        id: comment.id.clone(),
        post_id: comment.post_id.clone(),
        sender: UserOut {
            id: comment.sender.id.clone(),
            username: comment.sender.username.clone(),
        },
        reply_to: comment.reply_to.clone(),
        text: comment.text.clone(),
        created_at: http_common::to_rfc3339(comment.created_at),
        replies: comment.replies.iter().map(comment_out).collect(),
    }
}

fn error_response(err: &RepoError) -> Response {
    let status = StatusCode::from_u16(http_common::status_for(err))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(http_common::error_body(err))).into_response()
}

fn page_params(q: &ListQuery) -> Result<(usize, usize), Response> {
    let limit = match q.limit {
        Some(n) if (1..=500).contains(&n) => n,
        Some(_) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(http_common::json_error_with_message(
                    "invalid_request",
                    "limit must be between 1 and 500",
                )),
            )
                .into_response())
        }
        None => 50, // default
    };
    Ok((limit, q.offset.unwrap_or(0)))
}

async fn list_posts(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    let (limit, offset) = match page_params(&q) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = request_ctx(state.request_timeout);
    match state.repo.list_posts(&ctx, limit, offset).await {
        Ok(posts) => {
            let out: Vec<PostOut> = posts.iter().map(post_out).collect();
            (StatusCode::OK, Json(out)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn post_by_id(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let ctx = request_ctx(state.request_timeout);
    match state.repo.post_by_id(&ctx, &id).await {
        Ok(post) => (StatusCode::OK, Json(post_out(&post))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn create_post(
    State(state): State<AppState>,
    Json(req): Json<CreatePostReq>,
) -> Response {
    let ctx = request_ctx(state.request_timeout);
    let input = NewPost {
        title: req.title,
        text: req.text,
        user_id: req.user_id,
        commenting_enabled: req.commenting_enabled,
    };
    match state.repo.create_post(&ctx, input).await {
        Ok(post) => (StatusCode::CREATED, Json(post_out(&post))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn list_comments(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    let (limit, offset) = match page_params(&q) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let ctx = request_ctx(state.request_timeout);
    match state.repo.list_comments(&ctx, limit, offset).await {
        Ok(comments) => {
            let out: Vec<CommentOut> = comments.iter().map(comment_out).collect();
            (StatusCode::OK, Json(out)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn create_comment(
    State(state): State<AppState>,
    Json(req): Json<CreateCommentReq>,
) -> Response {
    let ctx = request_ctx(state.request_timeout);
    let input = NewComment {
        post_id: req.post_id,
        sender_id: req.sender_id,
        text: req.text,
        reply_to: req.reply_to,
    };
    match state.repo.create_comment(&ctx, input).await {
        Ok(comment) => (StatusCode::CREATED, Json(comment_out(&comment))).into_response(),
        Err(err) => error_response(&err),
    }
}
