//! PostgreSQL-backed [`AuthStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use tracing::warn;
use uuid::Uuid;

use super::{AuthStore, GrantIssuer};
use crate::auth::AuthError;
use crate::auth::permissions::PermissionSet;
use crate::models::auth::{
    IssuedGrant, NewUser, PermissionGrant, PermissionSource, SessionRecord, User, UserCredentials,
};

const USER_COLUMNS: &str = "id, email, first_name, last_name, full_name, role, is_active, \
                            is_super_admin, last_login_at";

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    full_name: Option<String>,
    role: String,
    is_active: bool,
    is_super_admin: bool,
    last_login_at: Option<DateTime<Utc>>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            full_name: row.full_name,
            role: row.role,
            is_active: row.is_active,
            is_super_admin: row.is_super_admin,
            last_login_at: row.last_login_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    #[sqlx(flatten)]
    user: UserRow,
    password_hash: String,
}

/// Contents of `user_sessions.session_data`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionData {
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_token_hash: String,
    user_id: Uuid,
    refresh_token_hash: Option<String>,
    session_data: Json<SessionData>,
    ip_address: Option<String>,
    user_agent: Option<String>,
    expires_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl From<SessionRow> for SessionRecord {
    fn from(row: SessionRow) -> Self {
        SessionRecord {
            session_token_hash: row.session_token_hash,
            user_id: row.user_id,
            refresh_token_hash: row.refresh_token_hash,
            permissions: row.session_data.0.permissions,
            ip_address: row.ip_address,
            user_agent: row.user_agent,
            expires_at: row.expires_at,
            last_activity_at: row.last_activity_at,
        }
    }
}

/// [`AuthStore`] over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgAuthStore {
    pool: PgPool,
}

impl PgAuthStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn fetch_grants(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Vec<PermissionGrant>, AuthError> {
    let rows = sqlx::query_as::<_, (String, Option<String>)>(
        "SELECT p.code, r.name \
         FROM user_roles ur \
         JOIN roles r ON r.id = ur.role_id \
         JOIN role_permissions rp ON rp.role_id = ur.role_id \
         JOIN permissions p ON p.id = rp.permission_id \
         WHERE ur.user_id = $1 \
         UNION ALL \
         SELECT p.code, NULL \
         FROM user_permissions up \
         JOIN permissions p ON p.id = up.permission_id \
         WHERE up.user_id = $1",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(code, role)| PermissionGrant {
            code,
            source: role.map_or(PermissionSource::Direct, PermissionSource::Role),
        })
        .collect())
}

/// Persist the refresh token and upsert the session row of `grant`.
async fn insert_grant(
    conn: &mut PgConnection,
    user_id: Uuid,
    grant: &IssuedGrant,
) -> Result<(), AuthError> {
    sqlx::query(
        "INSERT INTO refresh_tokens (token_hash, user_id, expires_at, revoked) \
         VALUES ($1, $2, $3, FALSE)",
    )
    .bind(&grant.refresh.token_hash)
    .bind(user_id)
    .bind(grant.refresh.expires_at)
    .execute(&mut *conn)
    .await?;

    let permissions = PermissionSet::from_grants(fetch_grants(conn, user_id).await?).into_vec();

    sqlx::query(
        "INSERT INTO user_sessions \
           (session_token_hash, user_id, refresh_token_hash, session_data, ip_address, user_agent, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (session_token_hash) DO UPDATE SET \
           refresh_token_hash = EXCLUDED.refresh_token_hash, \
           session_data = EXCLUDED.session_data, \
           ip_address = EXCLUDED.ip_address, \
           user_agent = EXCLUDED.user_agent, \
           expires_at = EXCLUDED.expires_at, \
           last_activity_at = now()",
    )
    .bind(&grant.access_token_hash)
    .bind(user_id)
    .bind(&grant.refresh.token_hash)
    .bind(Json(SessionData { permissions }))
    .bind(grant.client.ip.as_deref())
    .bind(grant.client.user_agent.as_deref())
    .bind(grant.access_expires_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[async_trait]
impl AuthStore for PgAuthStore {
    async fn create_user(&self, user: &NewUser, grant: &IssuedGrant) -> Result<User, AuthError> {
        let mut tx = self.pool.begin().await?;

        let full_name = format!("{} {}", user.first_name, user.last_name);
        let inserted = sqlx::query_as::<_, UserRow>(&format!(
            "INSERT INTO users \
               (id, email, password_hash, full_name, first_name, last_name, role, is_active) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE) \
             ON CONFLICT DO NOTHING \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(full_name.trim())
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.role)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            return Err(AuthError::DuplicateAccount);
        };

        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) \
             SELECT $1, id FROM roles WHERE name = $2 \
             ON CONFLICT (user_id, role_id) DO NOTHING",
        )
        .bind(user.id)
        .bind(&user.role)
        .execute(&mut *tx)
        .await?;

        insert_grant(&mut tx, user.id, grant).await?;
        tx.commit().await?;
        Ok(row.into())
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, AuthError> {
        let row = sqlx::query_as::<_, CredentialRow>(&format!(
            "SELECT {USER_COLUMNS}, password_hash FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| UserCredentials {
            user: r.user.into(),
            password_hash: r.password_hash,
        }))
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, AuthError> {
        let row = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn record_login(&self, user_id: Uuid, grant: &IssuedGrant) -> Result<(), AuthError> {
        let mut tx = self.pool.begin().await?;
        let updated =
            sqlx::query("UPDATE users SET last_login_at = now(), updated_at = now() WHERE id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        if updated.rows_affected() == 0 {
            return Err(AuthError::NotFound(format!("user {user_id}")));
        }
        insert_grant(&mut tx, user_id, grant).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        issue: &GrantIssuer<'_>,
    ) -> Result<(User, IssuedGrant), AuthError> {
        let mut tx = self.pool.begin().await?;

        let consumed = sqlx::query_scalar::<_, Uuid>(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE token_hash = $1 AND revoked = FALSE AND expires_at > now() \
             RETURNING user_id",
        )
        .bind(presented_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user_id) = consumed else {
            tx.rollback().await?;
            let existing = sqlx::query_as::<_, (Uuid, bool)>(
                "SELECT user_id, revoked FROM refresh_tokens WHERE token_hash = $1",
            )
            .bind(presented_hash)
            .fetch_optional(&self.pool)
            .await?;
            return Err(match existing {
                None => AuthError::InvalidRefreshToken,
                Some((owner, true)) => {
                    warn!(user_id = %owner, "revoked refresh token presented again");
                    AuthError::ExpiredOrRevoked
                }
                Some(_) => AuthError::ExpiredOrRevoked,
            });
        };

        let owner = sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR SHARE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let user: User = match owner {
            Some(row) if row.is_active => row.into(),
            _ => {
                // Keep the consumption: an inactive owner never gets it back.
                tx.commit().await?;
                return Err(AuthError::InvalidRefreshToken);
            }
        };

        let grant = issue(&user)?;
        insert_grant(&mut tx, user.id, &grant).await?;
        tx.commit().await?;
        Ok((user, grant))
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, AuthError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE token_hash = $1 AND revoked = FALSE",
        )
        .bind(token_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_user(&self, user_id: Uuid) -> Result<bool, AuthError> {
        let mut tx = self.pool.begin().await?;
        let updated =
            sqlx::query("UPDATE users SET is_active = FALSE, updated_at = now() WHERE id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = now() \
             WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn permission_grants(&self, user_id: Uuid) -> Result<Vec<PermissionGrant>, AuthError> {
        let mut conn = self.pool.acquire().await?;
        fetch_grants(&mut conn, user_id).await
    }

    async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, AuthError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT session_token_hash, user_id, refresh_token_hash, session_data, \
                    ip_address, user_agent, expires_at, last_activity_at \
             FROM user_sessions \
             WHERE user_id = $1 \
             ORDER BY last_activity_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SessionRecord::from).collect())
    }
}
