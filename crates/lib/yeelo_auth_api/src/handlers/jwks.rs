//! Public key discovery.

use axum::Json;
use axum::extract::State;
use yeelo_auth_core::auth::keys::Jwks;

use crate::AppState;

/// `GET /.well-known/jwks.json`: the verification key set. No auth.
pub async fn jwks_handler(State(state): State<AppState>) -> Json<Jwks> {
    Json(state.tokens.keys().public_key_set())
}
