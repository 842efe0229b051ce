//! Authentication and authorization logic.
//!
//! Provides the signing key manager, access-token service, refresh-token
//! generation, password hashing and permission resolution shared by the
//! HTTP layer.

pub mod jwt;
pub mod keys;
pub mod password;
pub mod permissions;
pub mod refresh;

use thiserror::Error;

/// Longest accepted lifetime for access or refresh tokens, in days.
pub const MAX_TOKEN_LIFETIME_DAYS: i64 = 3650;

/// Authentication errors.
///
/// The credential and token variants are the closed set of kinds a caller
/// may observe. Internal causes are logged where they occur and never
/// carried in these variants.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Account already exists")]
    DuplicateAccount,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Expired or revoked refresh token")]
    ExpiredOrRevoked,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Key material error: {0}")]
    KeyMaterial(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
