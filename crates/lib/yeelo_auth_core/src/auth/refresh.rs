//! Opaque refresh token generation.
//!
//! Refresh tokens are 32 random bytes, base64url encoded. The store keeps
//! only their SHA-256 digest, so a leaked table cannot be replayed.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rng};
use sha2::{Digest, Sha256};

use super::{AuthError, MAX_TOKEN_LIFETIME_DAYS};
use crate::models::auth::IssuedRefreshToken;

/// Default refresh token lifetime in days.
pub const DEFAULT_REFRESH_TTL_DAYS: i64 = 30;

const REFRESH_TOKEN_BYTES: usize = 32;

/// Generate a cryptographically random, URL-safe token.
pub fn generate_refresh_token() -> String {
    let mut buf = [0u8; REFRESH_TOKEN_BYTES];
    rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// SHA-256 hex digest of a token, used as its storage key.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Issues refresh tokens with a fixed lifetime.
#[derive(Debug, Clone, Copy)]
pub struct RefreshTokenIssuer {
    ttl: Duration,
}

impl Default for RefreshTokenIssuer {
    fn default() -> Self {
        Self {
            ttl: Duration::days(DEFAULT_REFRESH_TTL_DAYS),
        }
    }
}

impl RefreshTokenIssuer {
    /// Lifetime must be between one day and [`MAX_TOKEN_LIFETIME_DAYS`].
    pub fn with_ttl_days(days: i64) -> Result<Self, AuthError> {
        if !(1..=MAX_TOKEN_LIFETIME_DAYS).contains(&days) {
            return Err(AuthError::Internal(format!(
                "refresh token lifetime must be 1..={MAX_TOKEN_LIFETIME_DAYS} days, got {days}"
            )));
        }
        Ok(Self {
            ttl: Duration::days(days),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A new token expiring `ttl` after now.
    pub fn issue(&self) -> Result<IssuedRefreshToken, AuthError> {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> Result<IssuedRefreshToken, AuthError> {
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| AuthError::Internal("refresh token expiry out of range".into()))?;
        let token = generate_refresh_token();
        Ok(IssuedRefreshToken {
            token_hash: hash_token(&token),
            token,
            expires_at,
        })
    }
}
