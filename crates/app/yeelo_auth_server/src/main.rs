//! Yeelo auth service binary.
//!
//! Loads configuration from flags and the environment (after `.env`),
//! initialises the signing key before accepting traffic, then serves the
//! auth API until interrupted.

use std::error::Error;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use yeelo_auth_api::config::{ApiConfig, parse_lifetime, parse_role_list};
use yeelo_auth_api::{AppState, router};
use yeelo_auth_core::auth::MAX_TOKEN_LIFETIME_DAYS;
use yeelo_auth_core::auth::jwt::{TokenService, TokenSettings};
use yeelo_auth_core::auth::keys::{DEFAULT_KEY_ID, KeyConfig, KeyManager};
use yeelo_auth_core::auth::password::DEFAULT_BCRYPT_COST;
use yeelo_auth_core::auth::refresh::{DEFAULT_REFRESH_TTL_DAYS, RefreshTokenIssuer};
use yeelo_auth_core::store::AuthStore;
use yeelo_auth_core::store::memory::MemoryAuthStore;
use yeelo_auth_core::store::postgres::PgAuthStore;

const DEFAULT_DB_PORT: u16 = 5433;

const DEFAULT_LOG_FILTER: &str = "info,yeelo_auth_api=debug,yeelo_auth_core=debug";

/// CLI arguments for the auth service.
#[derive(Parser, Debug)]
#[command(name = "yeelo_auth_server", about = "Yeelo auth service", version)]
struct Args {
    /// Address to listen on. Defaults to `0.0.0.0:$PORT`, else `0.0.0.0:3001`.
    #[arg(long, env = "BIND_ADDR")]
    bind_addr: Option<String>,

    #[arg(long, env = "PORT", hide = true)]
    port: Option<u16>,

    /// PostgreSQL connection URL. Composed from the `DB_*` settings if unset.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Database host. Falls back to `POSTGRES_HOST`, then `localhost`.
    #[arg(long, env = "DB_HOST")]
    db_host: Option<String>,

    /// Falls back to `POSTGRES_PORT`, then 5433.
    #[arg(long, env = "DB_PORT")]
    db_port: Option<u16>,

    /// Falls back to `POSTGRES_DB`, then `yeelo_homeopathy`.
    #[arg(long, env = "DB_NAME")]
    db_name: Option<String>,

    /// Falls back to `POSTGRES_USER`, then `postgres`.
    #[arg(long, env = "DB_USER")]
    db_user: Option<String>,

    /// Falls back to `POSTGRES_PASSWORD`, then `postgres`.
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    /// Maximum number of database connections in the pool.
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 20)]
    max_connections: u32,

    #[arg(long, env = "DB_ACQUIRE_TIMEOUT_MS", default_value_t = 2000)]
    db_acquire_timeout_ms: u64,

    #[arg(long, env = "DB_IDLE_TIMEOUT_SECS", default_value_t = 30)]
    db_idle_timeout_secs: u64,

    /// Upper bound on a single store call while serving a request.
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value_t = 5000)]
    store_timeout_ms: u64,

    #[arg(long, env = "JWT_ISSUER", default_value = yeelo_auth_core::auth::jwt::DEFAULT_ISSUER)]
    jwt_issuer: String,

    #[arg(long, env = "JWT_AUDIENCE", default_value = yeelo_auth_core::auth::jwt::DEFAULT_AUDIENCE)]
    jwt_audience: String,

    /// Access token lifetime, e.g. `24h`, `15m` or seconds.
    #[arg(long, env = "JWT_EXPIRES_IN", default_value = "24h")]
    jwt_expires_in: String,

    /// Refresh token lifetime in days. Falls back to `REFRESH_TTL_DAYS`,
    /// then 30.
    #[arg(
        long,
        env = "REFRESH_TOKEN_TTL_DAYS",
        value_parser = clap::value_parser!(i64).range(1..=MAX_TOKEN_LIFETIME_DAYS)
    )]
    refresh_token_ttl_days: Option<i64>,

    /// Key identifier published in the JWKS and token headers.
    #[arg(long, env = "JWT_KEY_ID", default_value = DEFAULT_KEY_ID)]
    jwt_key_id: String,

    /// RSA private key as PKCS#1 or PKCS#8 PEM.
    #[arg(long, env = "JWT_PRIVATE_KEY", hide_env_values = true)]
    jwt_private_key: Option<String>,

    /// File holding the PEM private key.
    #[arg(long, env = "JWT_PRIVATE_KEY_FILE", conflicts_with = "jwt_private_key")]
    jwt_private_key_file: Option<std::path::PathBuf>,

    /// RSA private key as a JWK.
    #[arg(long, env = "JWT_PRIVATE_JWK", hide_env_values = true)]
    jwt_private_jwk: Option<String>,

    /// Public JWK; checked against the private key.
    #[arg(long, env = "JWT_PUBLIC_JWK")]
    jwt_public_jwk: Option<String>,

    /// Refuse to start without configured key material.
    #[arg(long, env = "JWT_REQUIRE_KEY", default_value_t = false)]
    require_signing_key: bool,

    #[arg(
        long,
        env = "BCRYPT_COST",
        default_value_t = DEFAULT_BCRYPT_COST,
        value_parser = clap::value_parser!(u32).range(4..=31)
    )]
    bcrypt_cost: u32,

    /// Comma-separated roles clients may request on registration.
    #[arg(long, env = "REGISTRABLE_ROLES", default_value = "customer")]
    registrable_roles: String,

    #[arg(long, env = "DEFAULT_ROLE", default_value = "customer")]
    default_role: String,

    /// Keep everything in process memory instead of PostgreSQL.
    #[arg(long, env = "AUTH_IN_MEMORY", default_value_t = false)]
    in_memory: bool,

    /// Do not install the Prometheus recorder; `/metrics` answers 503.
    #[arg(long, env = "DISABLE_METRICS", default_value_t = false)]
    disable_metrics: bool,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// The flag value if given, else the legacy variable `alias` parsed as `T`.
fn or_alias<T>(
    flag: Option<T>,
    alias: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>, Box<dyn Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if flag.is_some() {
        return Ok(flag);
    }
    lookup(alias)
        .map(|raw| -> Result<T, Box<dyn Error>> {
            raw.trim()
                .parse()
                .map_err(|e| format!("{alias}: invalid value '{raw}': {e}").into())
        })
        .transpose()
}

impl Args {
    fn bind_addr(&self) -> String {
        match (&self.bind_addr, self.port) {
            (Some(addr), _) => addr.clone(),
            (None, Some(port)) => format!("0.0.0.0:{port}"),
            (None, None) => "0.0.0.0:3001".to_string(),
        }
    }

    fn database_url(&self) -> Result<String, Box<dyn Error>> {
        self.database_url_from(env_var)
    }

    /// Compose the URL from the `DB_*` flags, falling back to the
    /// `POSTGRES_*` variables read through `lookup`.
    fn database_url_from(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<String, Box<dyn Error>> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        let user = or_alias(self.db_user.clone(), "POSTGRES_USER", &lookup)?
            .unwrap_or_else(|| "postgres".to_string());
        let password = or_alias(self.db_password.clone(), "POSTGRES_PASSWORD", &lookup)?
            .unwrap_or_else(|| "postgres".to_string());
        let host = or_alias(self.db_host.clone(), "POSTGRES_HOST", &lookup)?
            .unwrap_or_else(|| "localhost".to_string());
        let port = or_alias(self.db_port, "POSTGRES_PORT", &lookup)?.unwrap_or(DEFAULT_DB_PORT);
        let name = or_alias(self.db_name.clone(), "POSTGRES_DB", &lookup)?
            .unwrap_or_else(|| "yeelo_homeopathy".to_string());
        Ok(format!("postgres://{user}:{password}@{host}:{port}/{name}"))
    }

    fn refresh_issuer(&self) -> Result<RefreshTokenIssuer, Box<dyn Error>> {
        self.refresh_issuer_from(env_var)
    }

    fn refresh_issuer_from(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<RefreshTokenIssuer, Box<dyn Error>> {
        let days = or_alias(self.refresh_token_ttl_days, "REFRESH_TTL_DAYS", &lookup)?
            .unwrap_or(DEFAULT_REFRESH_TTL_DAYS);
        Ok(RefreshTokenIssuer::with_ttl_days(days)?)
    }

    fn key_config(&self) -> Result<KeyConfig, Box<dyn Error>> {
        let private_key_pem = match (&self.jwt_private_key, &self.jwt_private_key_file) {
            (Some(pem), _) => Some(pem.clone()),
            (None, Some(path)) => Some(std::fs::read_to_string(path).map_err(|e| {
                format!("cannot read signing key {}: {e}", path.display())
            })?),
            (None, None) => None,
        };
        Ok(KeyConfig {
            key_id: self.jwt_key_id.clone(),
            private_key_pem,
            private_jwk: self.jwt_private_jwk.clone(),
            public_jwk: self.jwt_public_jwk.clone(),
            require_configured: self.require_signing_key,
        })
    }

    fn token_settings(&self) -> Result<TokenSettings, Box<dyn Error>> {
        Ok(TokenSettings {
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
            access_ttl: parse_lifetime(&self.jwt_expires_in)
                .map_err(|e| format!("JWT_EXPIRES_IN: {e}"))?,
        })
    }

    fn api_config(&self) -> Result<ApiConfig, Box<dyn Error>> {
        let registrable_roles = parse_role_list(&self.registrable_roles);
        if !registrable_roles.contains(&self.default_role) {
            return Err(format!(
                "default role '{}' is not in REGISTRABLE_ROLES",
                self.default_role
            )
            .into());
        }
        Ok(ApiConfig {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            bcrypt_cost: self.bcrypt_cost,
            registrable_roles,
            default_role: self.default_role.clone(),
        })
    }
}

async fn open_store(args: &Args) -> Result<Arc<dyn AuthStore>, Box<dyn Error>> {
    if args.in_memory {
        warn!("using the in-memory store; accounts are lost on exit");
        return Ok(Arc::new(MemoryAuthStore::new()));
    }

    let database_url = args.database_url()?;
    info!(
        max_connections = args.max_connections,
        "configuring connection pool"
    );
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_millis(args.db_acquire_timeout_ms))
        .idle_timeout(Duration::from_secs(args.db_idle_timeout_secs))
        .connect(&database_url)
        .await?;

    info!("running database migrations");
    yeelo_auth_api::migrate(&pool).await?;
    Ok(Arc::new(PgAuthStore::new(pool)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    let bind_addr = args.bind_addr();
    info!(addr = %bind_addr, in_memory = args.in_memory, "starting yeelo_auth_server");

    // Keys first: a bad key must stop the process before it takes traffic.
    let keys = Arc::new(KeyManager::ensure(&args.key_config()?)?);
    let tokens = TokenService::new(keys, args.token_settings()?);
    let refresh = args.refresh_issuer()?;
    let config = args.api_config()?;

    let store = open_store(&args).await?;

    let mut state = AppState::new(store, tokens, refresh, config);
    if args.disable_metrics {
        info!("metrics disabled");
    } else {
        state = state.with_metrics(PrometheusBuilder::new().install_recorder()?);
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %listener.local_addr()?, "auth API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
