//! Access token signing and verification (RS256).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header, encode};
use tracing::debug;
use uuid::Uuid;

use super::AuthError;
use super::keys::KeyManager;
use crate::models::auth::{TokenClaims, User};

/// Default issuer claim.
pub const DEFAULT_ISSUER: &str = "urn:yeelo:auth";

/// Default audience claim.
pub const DEFAULT_AUDIENCE: &str = "yeelo-clients";

/// Default access token lifetime: 24 hours.
pub const DEFAULT_ACCESS_TTL_SECS: i64 = 24 * 60 * 60;

/// Issuer, audience and lifetime applied to every access token.
#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub issuer: String,
    pub audience: String,
    pub access_ttl: Duration,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TTL_SECS),
        }
    }
}

/// A signed access token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct SignedAccessToken {
    pub token: String,
    pub claims: TokenClaims,
}

/// Signs and verifies access tokens with the service keypair.
#[derive(Debug, Clone)]
pub struct TokenService {
    keys: Arc<KeyManager>,
    settings: TokenSettings,
}

impl TokenService {
    pub fn new(keys: Arc<KeyManager>, settings: TokenSettings) -> Self {
        Self { keys, settings }
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Sign an access token for `user`, valid from now.
    pub fn issue(&self, user: &User) -> Result<SignedAccessToken, AuthError> {
        self.issue_at(user, Utc::now())
    }

    /// Sign an access token as if issued at `now`.
    pub fn issue_at(&self, user: &User, now: DateTime<Utc>) -> Result<SignedAccessToken, AuthError> {
        let expires = now
            .checked_add_signed(self.settings.access_ttl)
            .ok_or_else(|| AuthError::Internal("access token expiry out of range".into()))?;
        let claims = TokenClaims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            role: user.role.clone(),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.key_id().to_string());

        let token = encode(&header, &claims, self.keys.encoding_key())
            .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))?;
        Ok(SignedAccessToken { token, claims })
    }

    /// Verify signature, issuer, audience and expiry.
    ///
    /// Every failure collapses into [`AuthError::InvalidToken`]; the reason
    /// is only logged.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let header = decode_header(token).map_err(|e| {
            debug!(error = %e, "access token header rejected");
            AuthError::InvalidToken
        })?;
        if let Some(kid) = header.kid.as_deref()
            && kid != self.keys.key_id()
        {
            debug!(kid, "access token signed with unknown key");
            return Err(AuthError::InvalidToken);
        }

        decode::<TokenClaims>(token, self.keys.decoding_key(), &self.validation())
            .map(|data| data.claims)
            .map_err(|e| {
                debug!(error = %e, "access token rejected");
                AuthError::InvalidToken
            })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(&[self.settings.issuer.as_str()]);
        validation.set_audience(&[self.settings.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud", "sub"]);
        validation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::keys::tests::{TEST_PKCS1_PEM, TEST_PKCS8_PEM};

    fn keys(pem: &str, kid: &str) -> Arc<KeyManager> {
        Arc::new(KeyManager::from_private_pem(pem, kid).unwrap())
    }

    fn service() -> TokenService {
        TokenService::new(keys(TEST_PKCS8_PEM, "test-kid"), TokenSettings::default())
    }

    fn user() -> User {
        User {
            id: Uuid::now_v7(),
            email: "a@x.com".into(),
            first_name: Some("A".into()),
            last_name: Some("X".into()),
            full_name: None,
            role: "customer".into(),
            is_active: true,
            is_super_admin: false,
            last_login_at: None,
        }
    }

    #[test]
    fn issue_then_verify_round_trips_subject() {
        let svc = service();
        let u = user();
        let signed = svc.issue(&u).unwrap();
        let claims = svc.verify(&signed.token).unwrap();
        assert_eq!(claims.user_id(), Some(u.id));
        assert_eq!(claims.email, "a@x.com");
        assert_eq!(claims.role, "customer");
        assert_eq!(claims.iss, DEFAULT_ISSUER);
        assert_eq!(claims.aud, DEFAULT_AUDIENCE);
        assert_eq!(claims.exp - claims.iat, DEFAULT_ACCESS_TTL_SECS);
    }

    #[test]
    fn header_carries_kid() {
        let signed = service().issue(&user()).unwrap();
        let header = decode_header(&signed.token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.kid.as_deref(), Some("test-kid"));
    }

    #[test]
    fn tokens_for_same_user_in_same_second_differ() {
        let svc = service();
        let u = user();
        let now = Utc::now();
        let a = svc.issue_at(&u, now).unwrap();
        let b = svc.issue_at(&u, now).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn expired_token_is_rejected_despite_valid_signature() {
        let svc = service();
        let signed = svc
            .issue_at(&user(), Utc::now() - Duration::hours(25))
            .unwrap();
        assert!(matches!(svc.verify(&signed.token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn expiry_past_the_calendar_is_an_error() {
        let svc = TokenService::new(
            keys(TEST_PKCS8_PEM, "test-kid"),
            TokenSettings {
                access_ttl: Duration::days(crate::auth::MAX_TOKEN_LIFETIME_DAYS),
                ..TokenSettings::default()
            },
        );
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert!(matches!(
            svc.issue_at(&user(), near_end),
            Err(AuthError::Internal(_))
        ));
    }

    #[test]
    fn wrong_issuer_or_audience_is_rejected() {
        let keys = keys(TEST_PKCS8_PEM, "test-kid");
        let other_issuer = TokenService::new(
            keys.clone(),
            TokenSettings {
                issuer: "urn:someone:else".into(),
                ..TokenSettings::default()
            },
        );
        let other_audience = TokenService::new(
            keys.clone(),
            TokenSettings {
                audience: "other-clients".into(),
                ..TokenSettings::default()
            },
        );
        let svc = TokenService::new(keys, TokenSettings::default());

        let t1 = other_issuer.issue(&user()).unwrap().token;
        let t2 = other_audience.issue(&user()).unwrap().token;
        assert!(matches!(svc.verify(&t1), Err(AuthError::InvalidToken)));
        assert!(matches!(svc.verify(&t2), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn token_from_another_key_is_rejected() {
        let foreign = TokenService::new(keys(TEST_PKCS1_PEM, "test-kid"), TokenSettings::default());
        let token = foreign.issue(&user()).unwrap().token;
        assert!(matches!(service().verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn tampered_or_garbage_tokens_are_rejected() {
        let svc = service();
        let token = svc.issue(&user()).unwrap().token;
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_payload = svc.issue(&user()).unwrap().token;
        parts[1] = forged_payload.split('.').nth(1).unwrap();
        let tampered = parts.join(".");

        assert!(matches!(svc.verify(&tampered), Err(AuthError::InvalidToken)));
        assert!(matches!(svc.verify("not.a.jwt"), Err(AuthError::InvalidToken)));
        assert!(matches!(svc.verify(""), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn published_key_set_verifies_tokens() {
        let svc = service();
        let token = svc.issue(&user()).unwrap().token;
        let set = svc.keys().public_key_set();
        let kid = decode_header(&token).unwrap().kid.unwrap();
        let key = set.find_by_kid(&kid).unwrap().decoding_key().unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[DEFAULT_AUDIENCE]);
        let data = decode::<TokenClaims>(&token, &key, &validation).unwrap();
        assert_eq!(data.claims.iss, DEFAULT_ISSUER);
    }
}
