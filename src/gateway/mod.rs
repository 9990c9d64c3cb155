//! JSON dashboard API. Every response is wrapped in [`ApiResponse`];
//! mutating routes (drop, apply, backup) are serialized through one
//! process-wide lock so two destructive operations can never interleave.

use crate::config::Config;
use crate::mysql::{self, MysqlInvoker};
use crate::{apply, backup, snapshot};
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Dashboard page size.
const DEFAULT_PAGE_SIZE: u32 = 5;
const MAX_PAGE_SIZE: u32 = 100;
/// No route accepts a meaningful body today; keep requests tiny.
const REQUEST_BODY_LIMIT: usize = 64 * 1024;
/// Apply and backup run inside the request; allow them to take a while.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);
/// Connectivity probe for /api/status; independent of the operation timeout.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub invoker: Arc<dyn MysqlInvoker>,
    /// Held for the duration of any mutating operation.
    op_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, invoker: Arc<dyn MysqlInvoker>) -> Self {
        Self {
            config,
            invoker,
            op_lock: Arc::new(Mutex::new(())),
        }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.mysql.command_timeout_secs)
    }
}

// ── Response envelope ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            count: None,
        })
    }

    pub fn ok_with_count(data: T, count: u64) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            count: Some(count),
        })
    }

    pub fn failure(
        status: StatusCode,
        message: impl Into<String>,
    ) -> (StatusCode, Json<ApiResponse<()>>) {
        (
            status,
            Json(ApiResponse::<()> {
                success: false,
                data: None,
                error: Some(message.into()),
                count: None,
            }),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct PaginationQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl PaginationQuery {
    fn window(&self) -> (usize, usize) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE) as usize;
        let offset = self.offset.unwrap_or(0) as usize;
        (limit, offset)
    }
}

// ── Router ────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/databases", get(databases_list))
        .route("/api/databases", delete(databases_drop))
        .route("/api/migrations", get(migrations_list))
        .route("/api/migrations/{name}/apply", post(migrations_apply))
        .route("/api/migrations/{name}", delete(migrations_delete))
        .route("/api/backups", get(backups_list))
        .route("/api/backups", post(backups_run))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(REQUEST_BODY_LIMIT))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// Loopback or unspecified binds are fine; anything else needs the explicit
/// opt-in because the API can drop every schema on the server.
pub fn is_public_bind(host: &str) -> bool {
    !matches!(host, "127.0.0.1" | "localhost" | "::1" | "[::1]")
}

fn ensure_bind_allowed(host: &str, allow_public: bool) -> Result<()> {
    if is_public_bind(host) && !allow_public {
        anyhow::bail!(
            "🛑 Refusing to bind to {host} — the dashboard can drop every schema on the server.\n\
             Fix: use --host 127.0.0.1 (default), or pass --allow-public / set\n\
             [gateway] allow_public_bind = true in config.toml (NOT recommended)."
        );
    }
    Ok(())
}

pub async fn run_gateway(
    host: &str,
    port: u16,
    config: Arc<Config>,
    invoker: Arc<dyn MysqlInvoker>,
) -> Result<()> {
    ensure_bind_allowed(host, config.gateway.allow_public_bind)?;

    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();
    let addr = format!("{host}:{actual_port}");

    println!("🗄️  schemadeck gateway listening on http://{addr}");
    println!("  GET    /health                       — component health");
    println!("  GET    /api/status                   — config + connectivity summary");
    println!("  GET    /api/databases                — list non-system schemas");
    println!("  DELETE /api/databases                — drop all non-system schemas");
    println!("  GET    /api/migrations               — list migration versions");
    println!("  POST   /api/migrations/:name/apply   — apply a version");
    println!("  DELETE /api/migrations/:name         — delete a version");
    println!("  GET    /api/backups                  — list backup folders");
    println!("  POST   /api/backups                  — run a mysqldump backup");
    println!("  Press Ctrl+C to stop.\n");

    crate::health::mark_component_ok("gateway");

    let state = AppState::new(config, invoker);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("gateway shutting down");
        })
        .await?;
    Ok(())
}

// ── Handlers ──────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(crate::health::snapshot_json())
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    version: String,
    mysql_user: String,
    mysql_host: String,
    mysql_port: u16,
    mysql_reachable: bool,
    migration_root: String,
    backup_root: String,
    migration_versions: usize,
    backup_folders: usize,
    max_parallel: usize,
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.config;

    let reachable = mysql::ping(state.invoker.as_ref(), PING_TIMEOUT)
        .await
        .is_ok();
    if reachable {
        crate::health::mark_component_ok("mysql");
    } else {
        crate::health::mark_component_error("mysql", "ping failed");
    }

    let migration_versions = snapshot::list_versions(&config.paths.migration_root)
        .map(|v| v.len())
        .unwrap_or(0);
    let backup_folders = backup::list_backups(&config.paths.backup_root)
        .map(|v| v.len())
        .unwrap_or(0);

    ApiResponse::ok(StatusPayload {
        version: env!("CARGO_PKG_VERSION").to_string(),
        mysql_user: config.mysql.username.clone(),
        mysql_host: config.mysql.host.clone(),
        mysql_port: config.mysql.port,
        mysql_reachable: reachable,
        migration_root: config.paths.migration_root.display().to_string(),
        backup_root: config.paths.backup_root.display().to_string(),
        migration_versions,
        backup_folders,
        max_parallel: config.apply.effective_parallel(),
    })
}

async fn databases_list(State(state): State<AppState>) -> impl IntoResponse {
    match mysql::list_databases(state.invoker.as_ref(), state.command_timeout()).await {
        Ok(all) => {
            let user: Vec<String> = all
                .into_iter()
                .filter(|db| !mysql::is_system_database(db))
                .collect();
            let count = user.len() as u64;
            ApiResponse::ok_with_count(user, count).into_response()
        }
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

async fn databases_drop(State(state): State<AppState>) -> impl IntoResponse {
    let Ok(_guard) = state.op_lock.try_lock() else {
        return busy_response();
    };
    match apply::drop_all_schemas(state.invoker.as_ref(), state.command_timeout()).await {
        Ok(dropped) => {
            let count = dropped.len() as u64;
            ApiResponse::ok_with_count(dropped, count).into_response()
        }
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

async fn migrations_list(
    State(state): State<AppState>,
    Query(page): Query<PaginationQuery>,
) -> impl IntoResponse {
    match snapshot::list_versions(&state.config.paths.migration_root) {
        Ok(versions) => {
            let total = versions.len() as u64;
            let (limit, offset) = page.window();
            let page: Vec<_> = versions.into_iter().skip(offset).take(limit).collect();
            ApiResponse::ok_with_count(page, total).into_response()
        }
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

async fn migrations_apply(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Ok(_guard) = state.op_lock.try_lock() else {
        return busy_response();
    };
    match apply::apply_version(state.invoker.clone(), &state.config, &name).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

async fn migrations_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let root = &state.config.paths.migration_root;
    let dir = match snapshot::version_dir(root, &name) {
        Ok(dir) => dir,
        Err(e) => {
            return ApiResponse::<()>::failure(StatusCode::BAD_REQUEST, e.to_string())
                .into_response()
        }
    };
    if !dir.is_dir() {
        return ApiResponse::<()>::failure(
            StatusCode::NOT_FOUND,
            format!("Migration version not found: {name}"),
        )
        .into_response();
    }
    match snapshot::delete_version(root, &name) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "deleted": name })).into_response(),
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

async fn backups_list(
    State(state): State<AppState>,
    Query(page): Query<PaginationQuery>,
) -> impl IntoResponse {
    match backup::list_backups(&state.config.paths.backup_root) {
        Ok(folders) => {
            let total = folders.len() as u64;
            let (limit, offset) = page.window();
            let page: Vec<_> = folders.into_iter().skip(offset).take(limit).collect();
            ApiResponse::ok_with_count(page, total).into_response()
        }
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

async fn backups_run(State(state): State<AppState>) -> impl IntoResponse {
    let Ok(_guard) = state.op_lock.try_lock() else {
        return busy_response();
    };
    match backup::backup_all(state.invoker.as_ref(), &state.config).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => {
            ApiResponse::<()>::failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
                .into_response()
        }
    }
}

fn busy_response() -> axum::response::Response {
    ApiResponse::<()>::failure(
        StatusCode::CONFLICT,
        "Another apply/backup operation is in progress",
    )
    .into_response()
}
