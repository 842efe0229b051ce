//! In-process store for development and tests.
//!
//! Each operation runs under one short critical section, which gives it the
//! same all-or-nothing behaviour as a PostgreSQL transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use super::{AuthStore, GrantIssuer};
use crate::auth::AuthError;
use crate::auth::permissions::PermissionSet;
use crate::models::auth::{
    IssuedGrant, NewUser, PermissionGrant, PermissionSource, RefreshTokenRecord, SessionRecord,
    User, UserCredentials,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, UserCredentials>,
    /// role name → permission codes
    roles: BTreeMap<String, BTreeSet<String>>,
    user_roles: HashMap<Uuid, BTreeSet<String>>,
    user_permissions: HashMap<Uuid, BTreeSet<String>>,
    refresh_tokens: HashMap<String, RefreshTokenRecord>,
    sessions: HashMap<String, SessionRecord>,
}

impl MemoryState {
    fn email_taken(&self, email: &str) -> bool {
        self.users
            .values()
            .any(|c| c.user.email.eq_ignore_ascii_case(email))
    }

    fn grants(&self, user_id: Uuid) -> Vec<PermissionGrant> {
        let mut grants = Vec::new();
        for role in self.user_roles.get(&user_id).into_iter().flatten() {
            for code in self.roles.get(role).into_iter().flatten() {
                grants.push(PermissionGrant {
                    code: code.clone(),
                    source: PermissionSource::Role(role.clone()),
                });
            }
        }
        for code in self.user_permissions.get(&user_id).into_iter().flatten() {
            grants.push(PermissionGrant {
                code: code.clone(),
                source: PermissionSource::Direct,
            });
        }
        grants
    }

    fn record_grant(&mut self, user_id: Uuid, grant: &IssuedGrant, now: DateTime<Utc>) {
        self.refresh_tokens.insert(
            grant.refresh.token_hash.clone(),
            RefreshTokenRecord {
                token_hash: grant.refresh.token_hash.clone(),
                user_id,
                expires_at: grant.refresh.expires_at,
                revoked: false,
            },
        );
        let permissions = PermissionSet::from_grants(self.grants(user_id)).into_vec();
        self.sessions.insert(
            grant.access_token_hash.clone(),
            SessionRecord {
                session_token_hash: grant.access_token_hash.clone(),
                user_id,
                refresh_token_hash: Some(grant.refresh.token_hash.clone()),
                permissions,
                ip_address: grant.client.ip.clone(),
                user_agent: grant.client.user_agent.clone(),
                expires_at: grant.access_expires_at,
                last_activity_at: now,
            },
        );
    }

    fn user_mut(&mut self, user_id: Uuid) -> Result<&mut UserCredentials, AuthError> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| AuthError::NotFound(format!("user {user_id}")))
    }
}

/// [`AuthStore`] held entirely in memory.
pub struct MemoryAuthStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryAuthStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuthStore {
    /// An empty store with the `admin` and `customer` roles defined.
    pub fn new() -> Self {
        let store = Self {
            state: Mutex::new(MemoryState::default()),
        };
        store.add_role("admin");
        store.add_role("customer");
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, AuthError> {
        self.state
            .lock()
            .map_err(|_| AuthError::Internal("memory store lock poisoned".into()))
    }

    /// Define a role. No-op if it exists.
    pub fn add_role(&self, name: &str) {
        if let Ok(mut state) = self.lock() {
            state.roles.entry(name.to_string()).or_default();
        }
    }

    pub fn grant_role_permission(&self, role: &str, code: &str) -> Result<(), AuthError> {
        let mut state = self.lock()?;
        state
            .roles
            .get_mut(role)
            .ok_or_else(|| AuthError::NotFound(format!("role {role}")))?
            .insert(code.to_string());
        Ok(())
    }

    pub fn assign_role(&self, user_id: Uuid, role: &str) -> Result<(), AuthError> {
        let mut state = self.lock()?;
        if !state.roles.contains_key(role) {
            return Err(AuthError::NotFound(format!("role {role}")));
        }
        state.user_mut(user_id)?;
        state
            .user_roles
            .entry(user_id)
            .or_default()
            .insert(role.to_string());
        Ok(())
    }

    pub fn grant_user_permission(&self, user_id: Uuid, code: &str) -> Result<(), AuthError> {
        let mut state = self.lock()?;
        state.user_mut(user_id)?;
        state
            .user_permissions
            .entry(user_id)
            .or_default()
            .insert(code.to_string());
        Ok(())
    }

    pub fn set_super_admin(&self, user_id: Uuid, is_super_admin: bool) -> Result<(), AuthError> {
        let mut state = self.lock()?;
        state.user_mut(user_id)?.user.is_super_admin = is_super_admin;
        Ok(())
    }

    /// Insert an active user directly, without issuing tokens.
    pub fn seed_user(&self, email: &str, password_hash: &str, role: &str) -> Result<Uuid, AuthError> {
        let mut state = self.lock()?;
        let email = email.trim().to_lowercase();
        if state.email_taken(&email) {
            return Err(AuthError::DuplicateAccount);
        }
        let id = Uuid::now_v7();
        state.users.insert(
            id,
            UserCredentials {
                user: User {
                    id,
                    email,
                    first_name: None,
                    last_name: None,
                    full_name: None,
                    role: role.to_string(),
                    is_active: true,
                    is_super_admin: false,
                    last_login_at: None,
                },
                password_hash: password_hash.to_string(),
            },
        );
        if state.roles.contains_key(role) {
            state
                .user_roles
                .entry(id)
                .or_default()
                .insert(role.to_string());
        }
        Ok(id)
    }

    /// Current state of a refresh token, by digest.
    pub fn refresh_token(&self, token_hash: &str) -> Option<RefreshTokenRecord> {
        self.lock().ok()?.refresh_tokens.get(token_hash).cloned()
    }

    /// Move a refresh token's expiry, e.g. into the past.
    pub fn set_refresh_token_expiry(
        &self,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), AuthError> {
        let mut state = self.lock()?;
        state
            .refresh_tokens
            .get_mut(token_hash)
            .ok_or_else(|| AuthError::NotFound("refresh token".into()))?
            .expires_at = expires_at;
        Ok(())
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn create_user(&self, user: &NewUser, grant: &IssuedGrant) -> Result<User, AuthError> {
        let mut state = self.lock()?;
        if state.email_taken(&user.email) || state.users.contains_key(&user.id) {
            return Err(AuthError::DuplicateAccount);
        }
        let created = user.to_user();
        state.users.insert(
            user.id,
            UserCredentials {
                user: created.clone(),
                password_hash: user.password_hash.clone(),
            },
        );
        if state.roles.contains_key(&user.role) {
            state
                .user_roles
                .entry(user.id)
                .or_default()
                .insert(user.role.clone());
        }
        state.record_grant(user.id, grant, Utc::now());
        Ok(created)
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserCredentials>, AuthError> {
        let state = self.lock()?;
        Ok(state
            .users
            .values()
            .find(|c| c.user.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_by_id(&self, user_id: Uuid) -> Result<Option<User>, AuthError> {
        let state = self.lock()?;
        Ok(state.users.get(&user_id).map(|c| c.user.clone()))
    }

    async fn record_login(&self, user_id: Uuid, grant: &IssuedGrant) -> Result<(), AuthError> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.user_mut(user_id)?.user.last_login_at = Some(now);
        state.record_grant(user_id, grant, now);
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        issue: &GrantIssuer<'_>,
    ) -> Result<(User, IssuedGrant), AuthError> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let record = state
            .refresh_tokens
            .get_mut(presented_hash)
            .ok_or(AuthError::InvalidRefreshToken)?;
        if !record.is_usable(now) {
            if record.revoked {
                warn!(user_id = %record.user_id, "revoked refresh token presented again");
            }
            return Err(AuthError::ExpiredOrRevoked);
        }
        record.revoked = true;
        let user_id = record.user_id;

        let user = match state.users.get(&user_id) {
            Some(c) if c.user.is_active => c.user.clone(),
            _ => return Err(AuthError::InvalidRefreshToken),
        };

        let grant = match issue(&user) {
            Ok(grant) => grant,
            Err(e) => {
                if let Some(record) = state.refresh_tokens.get_mut(presented_hash) {
                    record.revoked = false;
                }
                return Err(e);
            }
        };
        state.record_grant(user_id, &grant, now);
        Ok((user, grant))
    }

    async fn revoke_refresh_token(&self, token_hash: &str) -> Result<bool, AuthError> {
        let mut state = self.lock()?;
        match state.refresh_tokens.get_mut(token_hash) {
            Some(record) if !record.revoked => {
                record.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_user(&self, user_id: Uuid) -> Result<bool, AuthError> {
        let mut state = self.lock()?;
        let Some(creds) = state.users.get_mut(&user_id) else {
            return Ok(false);
        };
        creds.user.is_active = false;
        for record in state.refresh_tokens.values_mut() {
            if record.user_id == user_id {
                record.revoked = true;
            }
        }
        Ok(true)
    }

    async fn permission_grants(&self, user_id: Uuid) -> Result<Vec<PermissionGrant>, AuthError> {
        Ok(self.lock()?.grants(user_id))
    }

    async fn list_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>, AuthError> {
        let state = self.lock()?;
        let mut sessions: Vec<SessionRecord> = state
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }
}
