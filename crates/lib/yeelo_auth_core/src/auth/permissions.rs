//! Permission resolution.
//!
//! A user's effective permissions are the union of everything granted to
//! each role they hold and everything granted to them directly. Grants are
//! additive only; there is no per-user deny.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use super::AuthError;
use crate::models::auth::PermissionGrant;
use crate::store::AuthStore;

/// Deduplicated set of permission codes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    /// Union the codes of all grants, regardless of source.
    pub fn from_grants<I>(grants: I) -> Self
    where
        I: IntoIterator<Item = PermissionGrant>,
    {
        Self(grants.into_iter().map(|g| g.code).collect())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0.into_iter().collect()
    }
}

/// Resolves live permission sets from the store. Never caches.
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn AuthStore>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, user_id: Uuid) -> Result<PermissionSet, AuthError> {
        let grants = self.store.permission_grants(user_id).await?;
        Ok(PermissionSet::from_grants(grants))
    }
}
