//! API configuration.

use std::time::Duration;

use yeelo_auth_core::auth::MAX_TOKEN_LIFETIME_DAYS;
use yeelo_auth_core::auth::password::DEFAULT_BCRYPT_COST;

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Role given to self-registered users that do not ask for one.
pub const DEFAULT_ROLE: &str = "customer";

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Request-handling configuration. Token issuer, audience and lifetimes
/// live on the `TokenService` and `RefreshTokenIssuer`.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Upper bound on each store call made while serving a request.
    pub store_timeout: Duration,
    /// bcrypt cost for new password hashes.
    pub bcrypt_cost: u32,
    /// Roles a client may request on `POST /register`.
    pub registrable_roles: Vec<String>,
    /// Role assigned when registration does not name one.
    pub default_role: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
            registrable_roles: vec![DEFAULT_ROLE.to_string()],
            default_role: DEFAULT_ROLE.to_string(),
        }
    }
}

impl ApiConfig {
    pub fn is_registrable(&self, role: &str) -> bool {
        self.registrable_roles.iter().any(|r| r == role)
    }
}

/// Split a comma-separated role list, dropping blanks.
pub fn parse_role_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a lifetime such as `24h`, `15m`, `30s`, `7d` or a bare number of
/// seconds. At most [`MAX_TOKEN_LIFETIME_DAYS`].
pub fn parse_lifetime(raw: &str) -> Result<chrono::Duration, String> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => (&raw[..idx], Some(c)),
        Some(_) => (raw, None),
        None => return Err("empty lifetime".into()),
    };
    let value: i64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid lifetime '{raw}'"))?;
    if value <= 0 {
        return Err(format!("lifetime must be positive, got '{raw}'"));
    }
    let secs = match unit {
        None | Some('s') => Some(value),
        Some('m') => value.checked_mul(60),
        Some('h') => value.checked_mul(60 * 60),
        Some('d') => value.checked_mul(24 * 60 * 60),
        Some(other) => return Err(format!("unknown lifetime unit '{other}' in '{raw}'")),
    };
    secs.and_then(chrono::Duration::try_seconds)
        .filter(|ttl| *ttl <= chrono::Duration::days(MAX_TOKEN_LIFETIME_DAYS))
        .ok_or_else(|| {
            format!("lifetime '{raw}' is out of range (max {MAX_TOKEN_LIFETIME_DAYS}d)")
        })
}
