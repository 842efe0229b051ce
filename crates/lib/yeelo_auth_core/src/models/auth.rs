//! Authentication domain models.
//!
//! These are internal domain models, distinct from the HTTP request and
//! response shapes (which carry `#[serde(rename_all = "camelCase")]`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Domain user, without credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    /// Primary role label.
    pub role: String,
    pub is_active: bool,
    pub is_super_admin: bool,
    pub last_login_at: Option<DateTime<Utc>>,
}

impl User {
    /// Stored full name, else `first last`, else the email.
    pub fn display_name(&self) -> String {
        if let Some(full) = self.full_name.as_deref().map(str::trim)
            && !full.is_empty()
        {
            return full.to_string();
        }
        let combined = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or_default(),
            self.last_name.as_deref().unwrap_or_default()
        );
        let combined = combined.trim();
        if combined.is_empty() {
            self.email.clone()
        } else {
            combined.to_string()
        }
    }
}

/// User with password hash (for internal auth flows).
#[derive(Debug, Clone)]
pub struct UserCredentials {
    pub user: User,
    pub password_hash: String,
}

/// A user about to be created. The id is assigned before persistence so
/// the first token pair can be signed ahead of the insert.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
}

impl NewUser {
    /// The user as it reads back after a successful insert.
    pub fn to_user(&self) -> User {
        User {
            id: self.id,
            email: self.email.clone(),
            first_name: Some(self.first_name.clone()),
            last_name: Some(self.last_name.clone()),
            full_name: Some(format!("{} {}", self.first_name, self.last_name).trim().to_string()),
            role: self.role.clone(),
            is_active: true,
            is_super_admin: false,
            last_login_at: None,
        }
    }
}

/// JWT claims embedded in access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (user ID).
    pub sub: String,
    pub email: String,
    /// Primary role label at issuance.
    pub role: String,
    pub iss: String,
    pub aud: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Unique token id.
    pub jti: String,
}

impl TokenClaims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// A freshly generated refresh token. Only the digest is ever persisted.
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Where a request came from, recorded on the session row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything issued to a client by one login, registration or refresh:
/// the signed access token, its paired refresh token and the request
/// context to record against the session.
#[derive(Debug, Clone)]
pub struct IssuedGrant {
    pub access_token: String,
    pub access_token_hash: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh: IssuedRefreshToken,
    pub client: ClientContext,
}

/// Refresh token row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

impl RefreshTokenRecord {
    /// Whether this token may still be exchanged at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Session registry row, keyed by the access token digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub session_token_hash: String,
    pub user_id: Uuid,
    pub refresh_token_hash: Option<String>,
    /// Permissions resolved at issuance. Audit only.
    pub permissions: Vec<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// How a user came to hold a permission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionSource {
    Role(String),
    Direct,
}

/// One permission reachable by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionGrant {
    pub code: String,
    pub source: PermissionSource,
}
