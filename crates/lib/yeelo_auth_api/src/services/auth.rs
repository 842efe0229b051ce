//! Credential lifecycle: register, login, validate, refresh, logout and
//! administrative deactivation, orchestrated over the core services and the
//! [`AuthStore`](yeelo_auth_core::store::AuthStore).

use std::future::Future;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use yeelo_auth_core::auth::AuthError;
use yeelo_auth_core::auth::jwt::TokenService;
use yeelo_auth_core::auth::password::{hash_password, verify_password};
use yeelo_auth_core::auth::refresh::{RefreshTokenIssuer, hash_token};
use yeelo_auth_core::models::auth::{ClientContext, IssuedGrant, NewUser, User};

use crate::AppState;
use crate::config::MIN_PASSWORD_LEN;
use crate::error::{AppError, AppResult};
use crate::models::{
    AuthResponse, LoginRequest, LogoutResponse, RegisterRequest, SessionView, TokenPairResponse,
    UserProfile,
};

/// Run a store call under the configured timeout.
///
/// On expiry the in-flight future is dropped, which rolls back any open
/// transaction.
async fn bounded<T, F>(state: &AppState, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, AuthError>>,
{
    match tokio::time::timeout(state.config.store_timeout, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => {
            warn!(timeout_ms = state.config.store_timeout.as_millis() as u64, "store call timed out");
            Err(AppError::StoreTimeout)
        }
    }
}

/// Sign an access token for `user` and pair it with a fresh refresh token.
pub fn issue_grant(
    tokens: &TokenService,
    refresh: &RefreshTokenIssuer,
    user: &User,
    client: ClientContext,
) -> Result<IssuedGrant, AuthError> {
    let access = tokens.issue(user)?;
    Ok(IssuedGrant {
        access_token_hash: hash_token(&access.token),
        access_expires_at: access.claims.expires_at(),
        access_token: access.token,
        refresh: refresh.issue()?,
        client,
    })
}

async fn hash_blocking(password: String, cost: u32) -> AppResult<String> {
    tokio::task::spawn_blocking(move || hash_password(&password, cost))
        .await
        .map_err(|e| AppError::Internal(format!("hash task: {e}")))?
        .map_err(AppError::from)
}

async fn verify_blocking(password: String, hash: String) -> AppResult<bool> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AppError::Internal(format!("verify task: {e}")))?
        .map_err(AppError::from)
}

/// Trimmed, non-empty value of a required field.
fn required(value: Option<String>, field: &str) -> AppResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(format!("{field} is required")))
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

async fn profile(state: &AppState, user: &User) -> AppResult<UserProfile> {
    let permissions = bounded(state, state.permissions.resolve(user.id)).await?;
    Ok(UserProfile::new(user, permissions.into_vec()))
}

/// Create an account, sign its first token pair and record the session.
pub async fn register(
    state: &AppState,
    req: RegisterRequest,
    client: ClientContext,
) -> AppResult<AuthResponse> {
    let email = normalize_email(&required(req.email, "email")?);
    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::Validation("password is required".into()))?;
    let first_name = required(req.first_name, "firstName")?;
    let last_name = required(req.last_name, "lastName")?;

    if !email.contains('@') {
        return Err(AppError::Validation("email is not a valid address".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    let role = match req.role.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()) {
        Some(role) if state.config.is_registrable(&role) => role,
        Some(role) => {
            debug!(role = %role, "registration asked for a non-registrable role");
            return Err(AppError::Validation(format!("role '{role}' cannot be self-assigned")));
        }
        None => state.config.default_role.clone(),
    };

    let password_hash = hash_blocking(password, state.config.bcrypt_cost).await?;
    let new_user = NewUser {
        id: Uuid::now_v7(),
        email,
        password_hash,
        first_name,
        last_name,
        role,
    };
    let grant = issue_grant(&state.tokens, &state.refresh, &new_user.to_user(), client)?;
    let user = bounded(state, state.store.create_user(&new_user, &grant)).await?;
    info!(user_id = %user.id, email = %user.email, role = %user.role, "user registered");

    Ok(AuthResponse {
        message: "User registered successfully".into(),
        user: profile(state, &user).await?,
        access_token: grant.access_token,
        refresh_token: grant.refresh.token,
    })
}

/// Check a password and, if the account is active, start a new session.
pub async fn login(
    state: &AppState,
    req: LoginRequest,
    client: ClientContext,
) -> AppResult<AuthResponse> {
    let email = normalize_email(&required(req.email, "email")?);
    let password = req
        .password
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AppError::Validation("password is required".into()))?;

    let Some(credentials) = bounded(state, state.store.find_user_by_email(&email)).await? else {
        debug!(email = %email, "login for unknown email");
        return Err(AppError::InvalidCredentials);
    };

    if !verify_blocking(password, credentials.password_hash).await? {
        debug!(user_id = %credentials.user.id, "login with wrong password");
        return Err(AppError::InvalidCredentials);
    }

    let mut user = credentials.user;
    if !user.is_active {
        info!(user_id = %user.id, "login refused for deactivated account");
        return Err(AppError::AccountDeactivated);
    }

    let grant = issue_grant(&state.tokens, &state.refresh, &user, client)?;
    bounded(state, state.store.record_login(user.id, &grant)).await?;
    user.last_login_at = Some(Utc::now());
    info!(user_id = %user.id, "user logged in");

    Ok(AuthResponse {
        message: "Login successful".into(),
        user: profile(state, &user).await?,
        access_token: grant.access_token,
        refresh_token: grant.refresh.token,
    })
}

/// Verify an access token and load its subject.
///
/// Missing or deactivated subjects are reported exactly like a bad
/// signature.
pub async fn authenticate(state: &AppState, token: &str) -> AppResult<User> {
    let claims = state.tokens.verify(token)?;
    let user_id = claims.user_id().ok_or_else(|| {
        debug!(sub = %claims.sub, "access token subject is not a user id");
        AppError::InvalidToken
    })?;

    match bounded(state, state.store.find_user_by_id(user_id)).await? {
        Some(user) if user.is_active => Ok(user),
        Some(_) => {
            debug!(user_id = %user_id, "access token for deactivated account");
            Err(AppError::InvalidToken)
        }
        None => {
            debug!(user_id = %user_id, "access token for unknown account");
            Err(AppError::InvalidToken)
        }
    }
}

/// Validate an access token and return the live profile.
pub async fn validate(state: &AppState, token: Option<String>) -> AppResult<UserProfile> {
    let token = required(token, "token")?;
    let user = authenticate(state, &token).await?;
    profile(state, &user).await
}

/// Current profile of an already authenticated user.
pub async fn me(state: &AppState, user: &User) -> AppResult<UserProfile> {
    profile(state, user).await
}

/// Exchange a refresh token for a new pair. The presented token is consumed.
pub async fn refresh(
    state: &AppState,
    refresh_token: Option<String>,
    client: ClientContext,
) -> AppResult<TokenPairResponse> {
    let presented = required(refresh_token, "refreshToken")?;
    let issue = |user: &User| issue_grant(&state.tokens, &state.refresh, user, client.clone());

    let (user, grant) = bounded(
        state,
        state.store.rotate_refresh_token(&hash_token(&presented), &issue),
    )
    .await?;
    debug!(user_id = %user.id, "refresh token rotated");

    Ok(TokenPairResponse {
        access_token: grant.access_token,
        refresh_token: grant.refresh.token,
    })
}

/// Revoke a refresh token. Unknown or already revoked tokens are not an
/// error.
pub async fn logout(state: &AppState, refresh_token: Option<String>) -> AppResult<LogoutResponse> {
    let presented = required(refresh_token, "refreshToken")?;
    let revoked = bounded(
        state,
        state.store.revoke_refresh_token(&hash_token(&presented)),
    )
    .await?;
    debug!(revoked, "logout");
    Ok(LogoutResponse { success: true })
}

fn require_super_admin(caller: &User) -> AppResult<()> {
    if caller.is_super_admin {
        Ok(())
    } else {
        debug!(user_id = %caller.id, "admin route refused");
        Err(AppError::Forbidden("Super-admin privileges required".into()))
    }
}

/// Deactivate `target` and revoke its refresh tokens.
pub async fn deactivate_user(state: &AppState, caller: &User, target: Uuid) -> AppResult<()> {
    require_super_admin(caller)?;
    if !bounded(state, state.store.deactivate_user(target)).await? {
        return Err(AppError::NotFound(format!("user {target}")));
    }
    info!(user_id = %target, by = %caller.id, "user deactivated");
    Ok(())
}

/// Session registry rows of `target`.
pub async fn list_sessions(
    state: &AppState,
    caller: &User,
    target: Uuid,
) -> AppResult<Vec<SessionView>> {
    require_super_admin(caller)?;
    if bounded(state, state.store.find_user_by_id(target)).await?.is_none() {
        return Err(AppError::NotFound(format!("user {target}")));
    }
    let sessions = bounded(state, state.store.list_sessions(target)).await?;
    Ok(sessions.into_iter().map(SessionView::from).collect())
}
