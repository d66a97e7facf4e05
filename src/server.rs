//! HTTP/JSON API surface.
//!
//! Thin handlers over the registry and executor: resolve, validate, run,
//! shape the response. Errors surface as `{title, detail}` bodies with the
//! matching status code.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::context::ServiceContext;
use crate::executor::{self, ExecOutcome, QueryRows};
use crate::registry::{Database, RegistryError};

/// Bounds on statements per request.
const MIN_QUERIES: usize = 1;
const MAX_QUERIES: usize = 16;

type AppState = Arc<ServiceContext>;

pub struct ApiError {
    status: StatusCode,
    title: String,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, title: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            title: title.to_string(),
            detail: detail.into(),
        }
    }

    fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "Database not found.",
            "Invalid database name provided.",
        )
    }

    fn conflict() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "Database already exists.",
            "A database with this name already exists.",
        )
    }

    fn invalid(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Invalid request.",
            detail,
        )
    }

    fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error.",
            detail,
        )
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound => ApiError::not_found(),
            RegistryError::Conflict => ApiError::conflict(),
            RegistryError::InvalidArgument(detail) => ApiError::invalid(detail),
            RegistryError::Internal(e) => ApiError::internal(format!("{:#}", e)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "title": self.title,
            "detail": self.detail,
        });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

#[derive(Serialize)]
struct DatabaseInfo {
    name: String,
    stage: u32,
    last_accessed_at: String,
    request_count: u32,
}

impl DatabaseInfo {
    fn from_record(database: &Database) -> Self {
        let state = database.state().read();
        Self {
            name: database.name().to_string(),
            stage: state.stage,
            last_accessed_at: state.last_accessed_at.to_rfc3339(),
            request_count: state.request_count,
        }
    }
}

#[derive(Serialize)]
struct ListDatabasesResponse {
    databases: Vec<DatabaseInfo>,
}

#[derive(Deserialize)]
struct CreateDatabaseRequest {
    name: String,
}

#[derive(Serialize)]
struct CreateDatabaseResponse {
    database: DatabaseInfo,
}

#[derive(Deserialize)]
struct StatementsRequest {
    queries: Vec<String>,
}

#[derive(Serialize)]
struct QueryResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<QueryRows>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ExecuteResult {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<ExecOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct StatementsResponse<T> {
    results: Vec<T>,
}

pub fn router(ctx: AppState) -> Router {
    let request_timeout = Duration::from_secs(ctx.config.server.read_timeout_secs);

    Router::new()
        .route("/health", get(health_check))
        .route("/databases", get(list_databases).post(create_database))
        .route("/databases/:name", axum::routing::delete(remove_database))
        .route("/databases/:name/query", post(run_query))
        .route("/databases/:name/execute", post(run_execute))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Bind and serve until the process exits.
pub async fn serve(ctx: AppState) -> Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.server.port);
    let app = router(Arc::clone(&ctx));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(
        port = ctx.config.server.port,
        name = %ctx.config.server.name,
        "Server listening"
    );

    axum::serve(listener, app).await.context("Server terminated")
}

async fn health_check(State(ctx): State<AppState>) -> Json<HealthResponse> {
    let version = ctx.config.server.version.clone();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: (!version.is_empty()).then_some(version),
    })
}

async fn list_databases(State(ctx): State<AppState>) -> Json<ListDatabasesResponse> {
    let databases = ctx
        .registry
        .snapshot()
        .iter()
        .map(|db| DatabaseInfo::from_record(db))
        .collect();
    Json(ListDatabasesResponse { databases })
}

async fn create_database(
    State(ctx): State<AppState>,
    Json(request): Json<CreateDatabaseRequest>,
) -> Result<Json<CreateDatabaseResponse>, ApiError> {
    let name = request.name;
    let stage = ctx.config.settings.default_creation_stage;

    let created = tokio::task::spawn_blocking({
        let ctx = Arc::clone(&ctx);
        move || ctx.registry.create(&ctx, &name, stage)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    Ok(Json(CreateDatabaseResponse {
        database: DatabaseInfo::from_record(&created),
    }))
}

async fn remove_database(
    State(ctx): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let database = ctx.registry.find_by_name(&name)?;

    tokio::task::spawn_blocking({
        let ctx = Arc::clone(&ctx);
        move || ctx.registry.delete(&ctx, &database)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::internal(format!("{:#}", e)))?;

    Ok(StatusCode::NO_CONTENT)
}

fn validate_statement_count(queries: &[String]) -> Result<(), ApiError> {
    if queries.len() < MIN_QUERIES || queries.len() > MAX_QUERIES {
        return Err(ApiError::invalid(format!(
            "expected between {} and {} queries, got {}",
            MIN_QUERIES,
            MAX_QUERIES,
            queries.len()
        )));
    }
    Ok(())
}

async fn run_query(
    State(ctx): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StatementsRequest>,
) -> Result<Json<StatementsResponse<QueryResult>>, ApiError> {
    validate_statement_count(&request.queries)?;
    let database = ctx.registry.find_by_name(&name)?;

    let outcomes = executor::run_queries(Arc::clone(&ctx), database, request.queries).await;

    let results = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(rows) => QueryResult {
                success: true,
                data: Some(rows),
                error: None,
            },
            Err(e) => QueryResult {
                success: false,
                data: None,
                error: Some(format!("{:#}", e)),
            },
        })
        .collect();

    Ok(Json(StatementsResponse { results }))
}

async fn run_execute(
    State(ctx): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<StatementsRequest>,
) -> Result<Json<StatementsResponse<ExecuteResult>>, ApiError> {
    validate_statement_count(&request.queries)?;
    let database = ctx.registry.find_by_name(&name)?;

    let outcomes = executor::run_executes(Arc::clone(&ctx), database, request.queries).await;

    let results = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(result) => ExecuteResult {
                success: true,
                data: Some(result),
                error: None,
            },
            Err(e) => ExecuteResult {
                success: false,
                data: None,
                error: Some(format!("{:#}", e)),
            },
        })
        .collect();

    Ok(Json(StatementsResponse { results }))
}
