//! Credential and token handlers.

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::Json;

use crate::AppState;
use crate::error::AppResult;
use crate::extract::{ApiJson, ClientInfo};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    AuthResponse, LoginRequest, LogoutResponse, RefreshRequest, RegisterRequest,
    TokenPairResponse, UserProfile, ValidateRequest, ValidateResponse,
};
use crate::services::auth;

/// `POST /register`: create an account and return its first token pair.
pub async fn register_handler(
    State(state): State<AppState>,
    ClientInfo(client): ClientInfo,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    let resp = auth::register(&state, body, client).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

/// `POST /login`: authenticate with email + password.
pub async fn login_handler(
    State(state): State<AppState>,
    ClientInfo(client): ClientInfo,
    ApiJson(body): ApiJson<LoginRequest>,
) -> AppResult<Json<AuthResponse>> {
    let resp = auth::login(&state, body, client).await?;
    Ok(Json(resp))
}

/// `POST /validate`: check an access token and return the live profile.
pub async fn validate_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<ValidateRequest>,
) -> AppResult<Json<ValidateResponse>> {
    let user = auth::validate(&state, body.token).await?;
    Ok(Json(ValidateResponse { valid: true, user }))
}

/// `POST /token/refresh`: exchange a refresh token for a new pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    ClientInfo(client): ClientInfo,
    ApiJson(body): ApiJson<RefreshRequest>,
) -> AppResult<Json<TokenPairResponse>> {
    let resp = auth::refresh(&state, body.refresh_token, client).await?;
    Ok(Json(resp))
}

/// `POST /logout`: revoke a refresh token.
pub async fn logout_handler(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<RefreshRequest>,
) -> AppResult<Json<LogoutResponse>> {
    let resp = auth::logout(&state, body.refresh_token).await?;
    Ok(Json(resp))
}

/// `GET /me`: profile of the bearer. Requires authentication.
pub async fn me_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>,
) -> AppResult<Json<UserProfile>> {
    let resp = auth::me(&state, &user).await?;
    Ok(Json(resp))
}
