//! # yeelo_auth_api
//!
//! HTTP API library for the Yeelo auth service.

pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use yeelo_auth_core::auth::jwt::TokenService;
use yeelo_auth_core::auth::permissions::PermissionResolver;
use yeelo_auth_core::auth::refresh::RefreshTokenIssuer;
use yeelo_auth_core::store::AuthStore;

use crate::config::ApiConfig;
use crate::handlers::{admin, auth, health, jwks, metrics};

/// Route paths.
pub mod routes {
    pub const POST_REGISTER: &str = "/register";
    pub const POST_LOGIN: &str = "/login";
    pub const POST_VALIDATE: &str = "/validate";
    pub const POST_TOKEN_REFRESH: &str = "/token/refresh";
    pub const POST_LOGOUT: &str = "/logout";
    pub const GET_ME: &str = "/me";
    pub const POST_ADMIN_DEACTIVATE_USER: &str = "/admin/users/{id}/deactivate";
    pub const GET_ADMIN_USER_SESSIONS: &str = "/admin/users/{id}/sessions";
    pub const GET_JWKS: &str = "/.well-known/jwks.json";
    pub const GET_HEALTH: &str = "/health";
    pub const GET_METRICS: &str = "/metrics";
}

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Credential, token and session persistence.
    pub store: Arc<dyn AuthStore>,
    /// Access token signing and verification.
    pub tokens: TokenService,
    pub permissions: PermissionResolver,
    pub refresh: RefreshTokenIssuer,
    /// API configuration.
    pub config: ApiConfig,
    /// Prometheus handle rendered by `/metrics`; `None` when disabled.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn AuthStore>,
        tokens: TokenService,
        refresh: RefreshTokenIssuer,
        config: ApiConfig,
    ) -> Self {
        Self {
            permissions: PermissionResolver::new(store.clone()),
            store,
            tokens,
            refresh,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Run embedded database migrations.
///
/// Delegates to `yeelo_auth_core::migrate::migrate()` which owns the
/// migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    yeelo_auth_core::migrate::migrate(pool).await
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes (no auth required)
    let public = Router::new()
        .route(routes::POST_REGISTER, post(auth::register_handler))
        .route(routes::POST_LOGIN, post(auth::login_handler))
        .route(routes::POST_VALIDATE, post(auth::validate_handler))
        .route(routes::POST_TOKEN_REFRESH, post(auth::refresh_handler))
        .route(routes::POST_LOGOUT, post(auth::logout_handler))
        .route(routes::GET_JWKS, get(jwks::jwks_handler))
        .route(routes::GET_HEALTH, get(health::health_handler))
        .route(routes::GET_METRICS, get(metrics::metrics_handler));

    // Protected routes (require a bearer access token)
    let protected = Router::new()
        .route(routes::GET_ME, get(auth::me_handler))
        .route(
            routes::POST_ADMIN_DEACTIVATE_USER,
            post(admin::deactivate_user_handler),
        )
        .route(
            routes::GET_ADMIN_USER_SESSIONS,
            get(admin::list_sessions_handler),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        .route_layer(axum::middleware::from_fn(
            middleware::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
