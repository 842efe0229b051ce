//! Persistence for credentials, refresh tokens, sessions and the
//! role/permission graph.
//!
//! Every method that writes more than one row is a single unit of work: it
//! either fully commits or leaves no trace. Refresh-token consumption is a
//! conditional update, so concurrent rotations of the same token have
//! exactly one winner.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::AuthError;
use crate::models::auth::{
    IssuedGrant, NewUser, PermissionGrant, SessionRecord, User, UserCredentials,
};

/// Callback that signs a fresh grant for the owner of a rotated token.
///
/// Runs inside the rotation's unit of work, after the old token has been
/// consumed and before the new one is persisted.
pub type GrantIssuer<'a> = dyn Fn(&User) -> Result<IssuedGrant, AuthError> + Send + Sync + 'a;

#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Insert `user`, attach its role mapping when that role exists, and
    /// record `grant` (refresh token + session).
    ///
    /// Fails with [`AuthError::DuplicateAccount`] if the email is taken,
    /// compared case-insensitively.
    async fn create_user(&self, user: &NewUser, grant: &IssuedGrant) -> Result<User, AuthError>;

    /// Look up a user and password hash by (already normalised) email.
    async fn find_user_by_email(&self, email: &str)
    -> Result<Option<UserCredentials>, AuthError>;

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, AuthError>;

    /// Stamp `last_login_at` and record `grant`.
    async fn record_login(&self, user_id: Uuid, grant: &IssuedGrant) -> Result<(), AuthError>;

    /// Consume the refresh token whose digest is `presented_hash` and record
    /// the grant produced by `issue` in its place.
    ///
    /// Errors: [`AuthError::InvalidRefreshToken`] when the token is unknown
    /// or its owner is missing or inactive, [`AuthError::ExpiredOrRevoked`]
    /// when it was already consumed or has expired.
    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        issue: &GrantIssuer<'_>,
    ) -> Result<(User, IssuedGrant), AuthError>;

    /// Revoke one refresh token. Returns whether it was outstanding.
    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, AuthError>;

    /// Mark the user inactive and revoke all of their refresh tokens.
    /// Returns `false` if no such user exists.
    async fn deactivate_user(&self, user_id: Uuid) -> Result<bool, AuthError>;

    /// Every permission reachable by the user, one entry per grant path.
    async fn permission_grants(&self, user_id: Uuid) -> Result<Vec<PermissionGrant>, AuthError>;

    /// Sessions recorded for a user, most recent activity first.
    async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, AuthError>;
}
