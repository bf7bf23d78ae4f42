use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use wayfare_core::protocol::{
    Acknowledgement, MigrateRequest, MigrateResponse, PushRequest, PushResponse, ResolveRequest,
};

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{
    account_fingerprint, AccountRateLimiter, ProtectedEndpoint, RateLimitMetricsSnapshot,
};
use crate::store::{StoreStats, SyncStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    jwt_verifier: Arc<JwtVerifier>,
    store: Arc<SyncStore>,
    rate_limiter: Arc<AccountRateLimiter>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self {
            jwt_verifier: Arc::new(JwtVerifier::from_config(config.as_ref())),
            store: Arc::new(SyncStore::new()),
            rate_limiter: Arc::new(AccountRateLimiter::from_config(config.as_ref())),
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push_changes))
        .route("/sync/resolve", post(resolve_conflict))
        .route("/sync/migrate", post(migrate_dataset))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    store: StoreStats,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        store: state.store.stats().await,
        rate_limit: state.rate_limiter.metrics_snapshot().await,
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn push_changes(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::Push, &user.account_id)
        .await?;

    let received = request.changes.len();
    let response = state.store.push(&user.account_id, request).await?;
    tracing::info!(
        endpoint = "sync_push",
        account = account_fingerprint(&user.account_id),
        session = user.session_id.as_deref().unwrap_or("none"),
        received,
        applied = response.applied.len(),
        conflicts = response.conflicts.len(),
        server_changes = response.server_changes.len(),
        "Processed push"
    );
    Ok(Json(response))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<ResolveRequest>,
) -> Json<Acknowledgement> {
    tracing::info!(
        endpoint = "sync_resolve",
        account = account_fingerprint(&user.account_id),
        entity_type = %request.entity_type,
        resolution = %request.resolution,
        "Recorded conflict resolution"
    );
    state.store.record_resolution(&user.account_id, request).await;
    Json(Acknowledgement { ok: true })
}

async fn migrate_dataset(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<MigrateResponse>, AppError> {
    state
        .rate_limiter
        .check(ProtectedEndpoint::Migrate, &user.account_id)
        .await?;

    let received = request.len();
    let response = state.store.migrate(&user.account_id, request).await?;
    tracing::info!(
        endpoint = "sync_migrate",
        account = account_fingerprint(&user.account_id),
        received,
        imported = response.imported.total(),
        conflicts = response.conflicts.len(),
        "Imported local dataset"
    );
    Ok(Json(response))
}
