//! Signing key management and the published key set.
//!
//! The service holds exactly one RS256 keypair for its lifetime. It is
//! either imported from configuration (so several instances sign with the
//! same key) or generated once at startup. The public half is exposed as a
//! JWKS document under `/.well-known/jwks.json`.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::AuthError;

/// Key identifier used when none is configured.
pub const DEFAULT_KEY_ID: &str = "yeelo-auth-1";

/// Modulus size for generated keys. Imported keys must be at least this big.
const RSA_KEY_BITS: usize = 2048;

/// Published set of verification keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Find a key by `kid`.
    pub fn find_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }
}

/// RSA public key in JWK form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub n: String,
    pub e: String,
}

impl Jwk {
    fn from_public_key(public_key: &RsaPublicKey, kid: &str) -> Self {
        Self {
            kty: "RSA".to_string(),
            alg: Some("RS256".to_string()),
            key_use: Some("sig".to_string()),
            kid: Some(kid.to_string()),
            n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
        }
    }

    /// Build a verification key from this JWK.
    pub fn decoding_key(&self) -> Result<DecodingKey, AuthError> {
        if self.kty != "RSA" {
            return Err(AuthError::KeyMaterial(format!(
                "unsupported key type '{}'",
                self.kty
            )));
        }
        DecodingKey::from_rsa_components(&self.n, &self.e)
            .map_err(|e| AuthError::KeyMaterial(format!("jwk components: {e}")))
    }
}

/// RSA private key in JWK form (RFC 7518 §6.3).
#[derive(Deserialize)]
struct PrivateJwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    n: String,
    e: String,
    d: String,
    p: String,
    q: String,
}

/// Where the active keypair came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Configured,
    Generated,
}

/// Externally supplied key material.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    pub key_id: String,
    /// PKCS#1 or PKCS#8 PEM.
    pub private_key_pem: Option<String>,
    /// RSA private JWK as JSON.
    pub private_jwk: Option<String>,
    /// Public JWK as JSON. When present it must match the private key.
    pub public_jwk: Option<String>,
    /// Refuse to start with a generated key.
    pub require_configured: bool,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key_id: DEFAULT_KEY_ID.to_string(),
            private_key_pem: None,
            private_jwk: None,
            public_jwk: None,
            require_configured: false,
        }
    }
}

/// Holds the service's signing keypair. Immutable once constructed.
pub struct KeyManager {
    kid: String,
    origin: KeyOrigin,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_jwk: Jwk,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("kid", &self.kid)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Resolve the keypair from configuration, generating one if allowed.
    ///
    /// Configured material that cannot be parsed is always an error, as is
    /// absent material when `require_configured` is set.
    pub fn ensure(config: &KeyConfig) -> Result<Self, AuthError> {
        if config.private_key_pem.is_some() && config.private_jwk.is_some() {
            return Err(AuthError::KeyMaterial(
                "configure either a PEM or a JWK private key, not both".into(),
            ));
        }

        let manager = if let Some(pem) = &config.private_key_pem {
            let manager = Self::from_private_pem(pem, &config.key_id)?;
            if let Some(public) = &config.public_jwk {
                manager.check_public_jwk(public)?;
            }
            manager
        } else if let Some(private) = &config.private_jwk {
            Self::from_private_jwk(private, config.public_jwk.as_deref(), &config.key_id)?
        } else if config.public_jwk.is_some() {
            return Err(AuthError::KeyMaterial(
                "a public JWK was configured without its private key".into(),
            ));
        } else if config.require_configured {
            return Err(AuthError::KeyMaterial(
                "no signing key configured and generation is disabled".into(),
            ));
        } else {
            warn!(
                kid = %config.key_id,
                "no signing key configured, generating an ephemeral keypair; \
                 tokens will not verify against other instances"
            );
            Self::generate(&config.key_id)?
        };

        info!(kid = %manager.kid, origin = ?manager.origin, "signing key ready");
        Ok(manager)
    }

    /// Generate a fresh RSA keypair.
    pub fn generate(kid: &str) -> Result<Self, AuthError> {
        let mut rng = rsa::rand_core::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| AuthError::KeyMaterial(format!("rsa keygen: {e}")))?;
        Self::from_private_key(&private_key, kid, KeyOrigin::Generated)
    }

    /// Import a PKCS#1 or PKCS#8 PEM private key.
    pub fn from_private_pem(pem: &str, kid: &str) -> Result<Self, AuthError> {
        let pem = pem.trim();
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| AuthError::KeyMaterial("private key is not an RSA PEM".into()))?;
        Self::from_private_key(&private_key, kid, KeyOrigin::Configured)
    }

    /// Import an RSA private JWK, optionally checked against its public JWK.
    ///
    /// The key id is taken from the public JWK, then the private JWK, then
    /// `fallback_kid`.
    pub fn from_private_jwk(
        private_json: &str,
        public_json: Option<&str>,
        fallback_kid: &str,
    ) -> Result<Self, AuthError> {
        let jwk: PrivateJwk = serde_json::from_str(private_json)
            .map_err(|e| AuthError::KeyMaterial(format!("private jwk: {e}")))?;
        if jwk.kty != "RSA" {
            return Err(AuthError::KeyMaterial(format!(
                "unsupported key type '{}'",
                jwk.kty
            )));
        }

        let private_key = RsaPrivateKey::from_components(
            decode_uint(&jwk.n)?,
            decode_uint(&jwk.e)?,
            decode_uint(&jwk.d)?,
            vec![decode_uint(&jwk.p)?, decode_uint(&jwk.q)?],
        )
        .map_err(|e| AuthError::KeyMaterial(format!("private jwk components: {e}")))?;

        let public = public_json.map(parse_public_jwk).transpose()?;
        let kid = public
            .as_ref()
            .and_then(|p| p.kid.clone())
            .or(jwk.kid)
            .unwrap_or_else(|| fallback_kid.to_string());

        let manager = Self::from_private_key(&private_key, &kid, KeyOrigin::Configured)?;
        if let Some(public) = public {
            manager.check_public(&public)?;
        }
        Ok(manager)
    }

    fn from_private_key(
        private_key: &RsaPrivateKey,
        kid: &str,
        origin: KeyOrigin,
    ) -> Result<Self, AuthError> {
        private_key
            .validate()
            .map_err(|e| AuthError::KeyMaterial(format!("invalid rsa key: {e}")))?;
        if private_key.size() * 8 < RSA_KEY_BITS {
            return Err(AuthError::KeyMaterial(format!(
                "rsa key must be at least {RSA_KEY_BITS} bits"
            )));
        }

        let pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AuthError::KeyMaterial(format!("pem export: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AuthError::KeyMaterial(format!("encoding key: {e}")))?;

        let public_jwk = Jwk::from_public_key(&RsaPublicKey::from(private_key), kid);
        let decoding_key = public_jwk.decoding_key()?;

        Ok(Self {
            kid: kid.to_string(),
            origin,
            encoding_key,
            decoding_key,
            public_jwk,
        })
    }

    fn check_public_jwk(&self, public_json: &str) -> Result<(), AuthError> {
        self.check_public(&parse_public_jwk(public_json)?)
    }

    fn check_public(&self, public: &Jwk) -> Result<(), AuthError> {
        let same_n = decode_uint(&public.n)? == decode_uint(&self.public_jwk.n)?;
        let same_e = decode_uint(&public.e)? == decode_uint(&self.public_jwk.e)?;
        if !(same_n && same_e) {
            return Err(AuthError::KeyMaterial(
                "public jwk does not match the private key".into(),
            ));
        }
        Ok(())
    }

    /// Key identifier placed in every token header.
    pub fn key_id(&self) -> &str {
        &self.kid
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// The public key set verifiers fetch.
    pub fn public_key_set(&self) -> Jwks {
        Jwks {
            keys: vec![self.public_jwk.clone()],
        }
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

fn parse_public_jwk(json: &str) -> Result<Jwk, AuthError> {
    serde_json::from_str(json).map_err(|e| AuthError::KeyMaterial(format!("public jwk: {e}")))
}

fn decode_uint(b64: &str) -> Result<BigUint, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(b64.trim_end_matches('='))
        .map_err(|_| AuthError::KeyMaterial("jwk value is not base64url".into()))?;
    Ok(BigUint::from_bytes_be(&bytes))
}
