//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `AUTHCORE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `AUTHCORE_` override YAML values
//! 3. **Deployment variables** - The short names operators already use (`JWT_SECRET`,
//!    `PASSWORD_PEPPER`, `ACCESS_EXPIRY`, `DATABASE_URL`, ...) override everything else
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `AUTHCORE_AUTH__TOKENS__ISSUER=my-app` sets the `auth.tokens.issuer` field.
//!
//! ## Deployment variables
//!
//! | Variable | Config key |
//! |---|---|
//! | `JWT_SECRET` | `auth.tokens.secret` |
//! | `ISSUER` | `auth.tokens.issuer` |
//! | `ACCESS_EXPIRY` | `auth.tokens.access_expiry` |
//! | `REFRESH_EXPIRY` | `auth.tokens.refresh_expiry` |
//! | `PASSWORD_PEPPER` | `auth.password.pepper` |
//! | `PASSWORD_HASH_COST` | `auth.password.argon2_iterations` |
//! | `DEFAULT_ROLE` | `auth.default_role` |
//! | `RATE_LIMIT_RPS` | `rate_limit.requests_per_second` |
//! | `RATE_LIMIT_BURST` | `rate_limit.burst` |
//! | `RATE_LIMIT_STORE` | `rate_limit.store` |
//! | `PERMISSION_CACHE_TTL` | `permission_cache.ttl` |
//! | `SHUTDOWN_GRACE` | `shutdown_grace` |
//! | `CORS_ORIGINS` | `security.cors.allowed_origins` |
//! | `CORS_METHODS` | `security.cors.allowed_methods` |
//! | `CORS_HEADERS` | `security.cors.allowed_headers` |
//! | `ENVIRONMENT` | `environment` |
//! | `DATABASE_URL` | `database.url` |
//! | `DATABASE_REPLICA_URL` | `database.replica_url` |
//!
//! List values use figment's array syntax: `CORS_ORIGINS="[https://a.example, https://b.example]"`.
//!
//! ## Usage
//!
//! ```no_run
//! use clap::Parser;
//! use authcore::config::{Args, Config};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let args = Args::parse();
//! let config = Config::load(&args)?;
//!
//! println!("Server will bind to {}:{}", config.host, config.port);
//! # Ok(())
//! # }
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::errors::Error;

/// Value shipped in example configs for the JWT secret. Refused at startup.
pub const PLACEHOLDER_JWT_SECRET: &str = "change-me-jwt-secret-change-me-jwt-secret";
/// Value shipped in example configs for the password pepper. Refused at startup.
pub const PLACEHOLDER_PEPPER: &str = "change-me-pepper";
/// Minimum JWT secret length in bytes (256 bits)
pub const MIN_JWT_SECRET_BYTES: usize = 32;
/// Argon2 reference minimums (OWASP): enforced in production
pub const MIN_ARGON2_MEMORY_KIB: u32 = 19456;
pub const MIN_ARGON2_ITERATIONS: u32 = 2;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "AUTHCORE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Deployment environment. Production turns on strict CSP/HSTS and cost minimums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Main application configuration.
///
/// This is the root configuration structure loaded from YAML and environment variables.
/// All fields have sensible defaults defined in the `Default` implementation, except the
/// secrets, whose defaults are placeholders that fail validation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    pub environment: Environment,
    /// Database connection settings
    pub database: DatabaseConfig,
    /// Email address of an administrator created on first startup (optional)
    pub admin_email: Option<String>,
    /// Password for the initial administrator (optional, usually set via environment)
    #[serde(skip_serializing)]
    pub admin_password: Option<String>,
    /// Authentication settings: tokens, passwords, sessions, lockout, email
    pub auth: AuthConfig,
    /// Where token blacklist entries, account locks and reset tokens are kept
    pub revocation: RevocationConfig,
    pub permission_cache: PermissionCacheConfig,
    pub rate_limit: RateLimitConfig,
    /// Security settings (CORS)
    pub security: SecurityConfig,
    pub health: HealthConfig,
    /// How long in-flight requests may take to drain after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
    /// Export traces over OTLP (configured through standard OTEL_* variables)
    pub enable_otel_export: bool,
}

/// Individual pool configuration with all SQLx parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection (seconds)
    pub acquire_timeout_secs: u64,
    /// Time before idle connections are closed (seconds, 0 = never)
    pub idle_timeout_secs: u64,
    /// Maximum lifetime of a connection (seconds, 0 = never)
    pub max_lifetime_secs: u64,
}

impl Default for PoolSettings {
    /// Production defaults: balanced for reliability and resource usage
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,  // 10 minutes
            max_lifetime_secs: 1800, // 30 minutes
        }
    }
}

/// PostgreSQL connection settings for the identity store and shared stores.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Connection string for the primary
    pub url: String,
    /// Optional read replica used for follower-OK reads (subject listing and counts)
    pub replica_url: Option<String>,
    pub pool: PoolSettings,
    /// Pool settings for the replica. Falls back to `pool` when unset
    pub replica_pool: Option<PoolSettings>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/authcore".to_string(),
            replica_url: None,
            pool: PoolSettings::default(),
            replica_pool: None,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub tokens: TokenConfig,
    pub password: PasswordConfig,
    /// Role assigned to newly created subjects
    pub default_role: String,
    /// Allow self-registration through `POST /auth/register`
    pub allow_registration: bool,
    /// How long password reset tokens are valid (at most 1 hour)
    #[serde(with = "humantime_serde")]
    pub reset_token_expiry: Duration,
    /// Every forgot-password call takes at least this long, whatever the input
    #[serde(with = "humantime_serde")]
    pub forgot_password_min_duration: Duration,
    pub sessions: SessionPolicyConfig,
    pub lockout: LockoutConfig,
    pub email: EmailConfig,
}

/// Signing and lifetime settings for access and refresh tokens.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    /// HMAC secret, at least 32 bytes
    #[serde(skip_serializing)]
    pub secret: String,
    /// Issuer label embedded in every token
    pub issuer: String,
    #[serde(with = "humantime_serde")]
    pub access_expiry: Duration,
    #[serde(with = "humantime_serde")]
    pub refresh_expiry: Duration,
}

/// Password hashing and strength rules.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordConfig {
    /// Deployment-wide secret appended to every password before hashing
    #[serde(skip_serializing)]
    pub pepper: String,
    /// Minimum password length (never below 8)
    pub min_length: usize,
    /// Maximum password length, bounds hashing cost
    pub max_length: usize,
    /// Argon2 memory cost in KiB (default: 19456 KiB = 19 MB)
    pub argon2_memory_kib: u32,
    /// Argon2 iterations, the deployment's hash cost factor
    pub argon2_iterations: u32,
    /// Argon2 parallelism (default: 1)
    pub argon2_parallelism: u32,
    /// Extra passwords to refuse, on top of the built-in list of common passwords
    pub blocklist: Vec<String>,
}

/// Session invalidation policies.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionPolicyConfig {
    /// Logout also mass-invalidates every other session of the subject
    pub logout_all_sessions: bool,
    /// Changing or resetting a password mass-invalidates existing sessions
    pub revoke_on_password_change: bool,
}

/// Account lockout after repeated failed logins.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockoutConfig {
    pub enabled: bool,
    /// Failed attempts per source and account that trigger a lock
    pub max_attempts: u32,
    /// Window in which failed attempts are counted
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How long the account stays locked
    #[serde(with = "humantime_serde")]
    pub lock_duration: Duration,
}

/// Email configuration for password resets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
// Note: Cannot use deny_unknown_fields here due to #[serde(flatten)] on transport
pub struct EmailConfig {
    /// Email transport method
    #[serde(flatten)]
    pub transport: EmailTransportConfig,
    /// Sender email address
    pub from_email: String,
    /// Sender display name
    pub from_name: String,
    /// Who to set the reply to field from
    pub reply_to: Option<String>,
    /// Page that accepts `?token=...` and calls `POST /auth/password/reset`
    pub reset_url: String,
}

/// Email transport configuration - either SMTP or file-based for testing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EmailTransportConfig {
    /// Send emails via SMTP server
    Smtp {
        /// SMTP server hostname
        host: String,
        /// SMTP server port
        port: u16,
        /// SMTP authentication username
        username: String,
        /// SMTP authentication password
        #[serde(skip_serializing)]
        password: String,
        /// Use TLS encryption
        use_tls: bool,
    },
    /// Write emails to files (for development/testing)
    File {
        /// Directory path where email files will be written
        path: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RevocationStoreKind {
    /// Process-local store. Correct for a single instance only
    #[default]
    Memory,
    /// Shared `revocations` table, visible to every instance
    Postgres,
    /// No store: revocation calls fail as unsupported, nothing is ever revoked
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RevocationConfig {
    pub store: RevocationStoreKind,
    /// How often expired entries (revocations, local reset tokens) are purged
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PermissionCacheConfig {
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub max_capacity: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStoreKind {
    /// Buckets in process memory
    #[default]
    Memory,
    /// Buckets in the shared database, for multi-instance deployments
    Shared,
}

/// Token-bucket rate limiting applied to every request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Sustained refill rate per key
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
    pub store: RateLimitStoreKind,
    /// Use the first `X-Forwarded-For` address as client identity. Only behind a trusted proxy
    pub trust_forwarded_headers: bool,
    /// Local buckets untouched for this long are dropped by the sweep
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Attempts per source on login and password reset within `auth_window`
    pub auth_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub auth_window: Duration,
}

/// Security configuration for CORS.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecurityConfig {
    /// CORS configuration for browser clients
    pub cors: CorsConfig,
}

/// CORS (Cross-Origin Resource Sharing) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests
    pub allowed_origins: Vec<CorsOrigin>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    /// Allow credentials (cookies, authorization headers) in CORS requests
    pub allow_credentials: bool,
    /// Cache preflight requests for this many seconds
    pub max_age: Option<u64>,
    /// Custom headers to expose to the browser (in addition to CORS-safelisted headers)
    pub exposed_headers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    /// Upper bound on any single health check (at most 1s)
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,
}

/// CORS origin specification.
///
/// Can be either a wildcard (`*`) to allow all origins, or a specific URL.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CorsOrigin {
    /// Allow all origins (`*`)
    #[serde(deserialize_with = "parse_wildcard")]
    Wildcard,
    /// Specific origin URL (e.g., `https://app.example.com`)
    #[serde(deserialize_with = "parse_url")]
    Url(Url),
}

fn parse_wildcard<'de, D>(deserializer: D) -> Result<(), D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    if s == "*" {
        Ok(())
    } else {
        Err(serde::de::Error::custom("Expected '*'"))
    }
}

fn parse_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: Environment::default(),
            database: DatabaseConfig::default(),
            admin_email: None,
            admin_password: None,
            auth: AuthConfig::default(),
            revocation: RevocationConfig::default(),
            permission_cache: PermissionCacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            security: SecurityConfig::default(),
            health: HealthConfig::default(),
            shutdown_grace: Duration::from_secs(30),
            log_format: LogFormat::default(),
            enable_otel_export: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: TokenConfig::default(),
            password: PasswordConfig::default(),
            default_role: "user".to_string(),
            allow_registration: true,
            reset_token_expiry: Duration::from_secs(60 * 60), // 1 hour
            forgot_password_min_duration: Duration::from_millis(250),
            sessions: SessionPolicyConfig::default(),
            lockout: LockoutConfig::default(),
            email: EmailConfig::default(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: PLACEHOLDER_JWT_SECRET.to_string(),
            issuer: "authcore".to_string(),
            access_expiry: Duration::from_secs(15 * 60),           // 15 minutes
            refresh_expiry: Duration::from_secs(168 * 60 * 60), // 7 days
        }
    }
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            pepper: PLACEHOLDER_PEPPER.to_string(),
            min_length: 8,
            max_length: 128,
            // 19 MB with 12 passes lands around a quarter second on a modern core
            argon2_memory_kib: 19456,
            argon2_iterations: 12,
            argon2_parallelism: 1,
            blocklist: Vec::new(),
        }
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            window: Duration::from_secs(15 * 60),
            lock_duration: Duration::from_secs(15 * 60),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            transport: EmailTransportConfig::default(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Account Security".to_string(),
            reply_to: None,
            reset_url: "http://localhost:3001/reset-password".to_string(),
        }
    }
}

impl Default for EmailTransportConfig {
    fn default() -> Self {
        Self::File {
            path: "./emails".to_string(),
        }
    }
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            store: RevocationStoreKind::default(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl Default for PermissionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            max_capacity: 100_000,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst: 20,
            store: RateLimitStoreKind::default(),
            trust_forwarded_headers: false,
            idle_timeout: Duration::from_secs(10 * 60),
            auth_attempts: 5,
            auth_window: Duration::from_secs(15 * 60),
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Url(
                Url::parse("http://localhost:3001").expect("static development origin parses"),
            )],
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"].map(String::from).to_vec(),
            allowed_headers: ["authorization", "content-type", "x-request-id", "x-correlation-id"]
                .map(String::from)
                .to_vec(),
            allow_credentials: true,
            max_age: Some(3600), // Cache preflight for 1 hour
            exposed_headers: vec!["x-request-id".to_string(), "x-correlation-id".to_string()],
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(1),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> Error {
    Error::BadRequest {
        message: format!("Invalid configuration: {message}"),
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let tokens = &self.auth.tokens;
        if tokens.secret == PLACEHOLDER_JWT_SECRET {
            return Err(invalid(
                "auth.tokens.secret is still the placeholder value. Set JWT_SECRET to a random value of at least 32 bytes.",
            ));
        }
        if tokens.secret.len() < MIN_JWT_SECRET_BYTES {
            return Err(invalid(format!(
                "auth.tokens.secret must be at least {MIN_JWT_SECRET_BYTES} bytes (got {})",
                tokens.secret.len()
            )));
        }
        if tokens.issuer.trim().is_empty() {
            return Err(invalid("auth.tokens.issuer cannot be empty"));
        }
        if tokens.access_expiry < Duration::from_secs(60) || tokens.access_expiry > Duration::from_secs(24 * 60 * 60) {
            return Err(invalid("auth.tokens.access_expiry must be between 1 minute and 24 hours"));
        }
        if tokens.refresh_expiry <= tokens.access_expiry {
            return Err(invalid("auth.tokens.refresh_expiry must be longer than access_expiry"));
        }

        let password = &self.auth.password;
        if password.pepper.is_empty() || password.pepper == PLACEHOLDER_PEPPER {
            return Err(invalid(
                "auth.password.pepper is missing or still the placeholder value. Set PASSWORD_PEPPER.",
            ));
        }
        if password.min_length < 8 {
            return Err(invalid("auth.password.min_length cannot be below 8"));
        }
        if password.min_length > password.max_length {
            return Err(invalid(format!(
                "Invalid password configuration: min_length ({}) cannot be greater than max_length ({})",
                password.min_length, password.max_length
            )));
        }
        if password.argon2_iterations < 1 || password.argon2_parallelism < 1 {
            return Err(invalid("argon2_iterations and argon2_parallelism must be at least 1"));
        }
        if password.argon2_memory_kib < 8 * password.argon2_parallelism {
            return Err(invalid("argon2_memory_kib must be at least 8 * argon2_parallelism"));
        }
        if self.environment.is_production()
            && (password.argon2_memory_kib < MIN_ARGON2_MEMORY_KIB || password.argon2_iterations < MIN_ARGON2_ITERATIONS)
        {
            return Err(invalid(format!(
                "argon2 cost below the production minimum (memory >= {MIN_ARGON2_MEMORY_KIB} KiB, iterations >= {MIN_ARGON2_ITERATIONS})"
            )));
        }

        if self.auth.default_role.trim().is_empty() {
            return Err(invalid("auth.default_role cannot be empty"));
        }
        if self.auth.reset_token_expiry.is_zero() || self.auth.reset_token_expiry > Duration::from_secs(60 * 60) {
            return Err(invalid("auth.reset_token_expiry must be positive and at most 1 hour"));
        }
        if self.auth.lockout.enabled && (self.auth.lockout.max_attempts == 0 || self.auth.lockout.window.is_zero()) {
            return Err(invalid("auth.lockout requires max_attempts > 0 and a non-zero window"));
        }

        if self.rate_limit.enabled && (self.rate_limit.requests_per_second <= 0.0 || self.rate_limit.burst == 0) {
            return Err(invalid("rate_limit.requests_per_second and rate_limit.burst must be positive"));
        }
        if self.rate_limit.enabled && (self.rate_limit.auth_attempts == 0 || self.rate_limit.auth_window.is_zero()) {
            return Err(invalid("rate_limit.auth_attempts and rate_limit.auth_window must be positive"));
        }

        if self.health.check_timeout.is_zero() || self.health.check_timeout > Duration::from_secs(1) {
            return Err(invalid("health.check_timeout must be positive and at most 1 second"));
        }

        // Validate CORS configuration
        let cors = &self.security.cors;
        if cors.allowed_origins.is_empty() {
            return Err(invalid("CORS allowed_origins cannot be empty. Add at least one allowed origin."));
        }
        let has_wildcard = cors.allowed_origins.iter().any(|origin| matches!(origin, CorsOrigin::Wildcard));
        if has_wildcard && cors.allow_credentials {
            return Err(invalid(
                "CORS cannot use wildcard origin '*' with allow_credentials=true. Specify explicit origins.",
            ));
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("AUTHCORE_").split("__"))
            .merge(deployment_env())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Short deployment variable names mapped onto nested config keys.
const DEPLOYMENT_VARIABLES: &[(&str, &str)] = &[
    ("JWT_SECRET", "auth.tokens.secret"),
    ("ISSUER", "auth.tokens.issuer"),
    ("ACCESS_EXPIRY", "auth.tokens.access_expiry"),
    ("REFRESH_EXPIRY", "auth.tokens.refresh_expiry"),
    ("PASSWORD_PEPPER", "auth.password.pepper"),
    ("PASSWORD_HASH_COST", "auth.password.argon2_iterations"),
    ("DEFAULT_ROLE", "auth.default_role"),
    ("RATE_LIMIT_RPS", "rate_limit.requests_per_second"),
    ("RATE_LIMIT_BURST", "rate_limit.burst"),
    ("RATE_LIMIT_STORE", "rate_limit.store"),
    ("PERMISSION_CACHE_TTL", "permission_cache.ttl"),
    ("SHUTDOWN_GRACE", "shutdown_grace"),
    ("CORS_ORIGINS", "security.cors.allowed_origins"),
    ("CORS_METHODS", "security.cors.allowed_methods"),
    ("CORS_HEADERS", "security.cors.allowed_headers"),
    ("ENVIRONMENT", "environment"),
    ("DATABASE_URL", "database.url"),
    ("DATABASE_REPLICA_URL", "database.replica_url"),
];

fn deployment_env() -> Env {
    let names: Vec<&str> = DEPLOYMENT_VARIABLES.iter().map(|(name, _)| *name).collect();
    Env::raw().only(&names).map(|key| {
        DEPLOYMENT_VARIABLES
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, path)| (*path).into())
            .unwrap_or_else(|| key.into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.auth.tokens.secret = SECRET.to_string();
        config.auth.password.pepper = "pepper-for-tests".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.auth.tokens.access_expiry, Duration::from_secs(15 * 60));
        assert_eq!(config.auth.tokens.refresh_expiry, Duration::from_secs(168 * 3600));
        assert_eq!(config.permission_cache.ttl, Duration::from_secs(300));
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.auth.password.argon2_iterations, 12);
        assert_eq!(config.auth.lockout.max_attempts, 5);
        assert_eq!(config.rate_limit.auth_attempts, 5);
        assert_eq!(config.rate_limit.auth_window, Duration::from_secs(15 * 60));
        assert!(!config.auth.sessions.logout_all_sessions);
        assert!(!config.auth.sessions.revoke_on_password_change);
    }

    #[test]
    fn test_yaml_and_prefixed_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
port: 8080
auth:
  tokens:
    secret: "0123456789abcdef0123456789abcdef"
    access_expiry: "10m"
  password:
    pepper: "pepper-from-yaml"
    min_length: 12
"#,
            )?;

            jail.set_env("AUTHCORE_HOST", "127.0.0.1");
            jail.set_env("AUTHCORE_AUTH__TOKENS__ISSUER", "shop-api");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args)?;

            assert_eq!(config.host, "127.0.0.1");
            assert_eq!(config.port, 8080);
            assert_eq!(config.auth.tokens.issuer, "shop-api");
            assert_eq!(config.auth.tokens.access_expiry, Duration::from_secs(600));
            assert_eq!(config.auth.password.min_length, 12);
            assert_eq!(config.auth.password.max_length, 128); // still default

            Ok(())
        });
    }

    #[test]
    fn test_deployment_variables() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "")?;
            jail.set_env("JWT_SECRET", SECRET);
            jail.set_env("PASSWORD_PEPPER", "pepper-from-env");
            jail.set_env("ACCESS_EXPIRY", "5m");
            jail.set_env("REFRESH_EXPIRY", "24h");
            jail.set_env("PASSWORD_HASH_COST", "4");
            jail.set_env("DEFAULT_ROLE", "viewer");
            jail.set_env("RATE_LIMIT_RPS", "2.5");
            jail.set_env("RATE_LIMIT_BURST", "7");
            jail.set_env("RATE_LIMIT_STORE", "shared");
            jail.set_env("PERMISSION_CACHE_TTL", "1m");
            jail.set_env("SHUTDOWN_GRACE", "10s");
            jail.set_env("ENVIRONMENT", "staging");
            jail.set_env("CORS_ORIGINS", "[https://shop.example.com, https://admin.example.com]");
            jail.set_env("DATABASE_URL", "postgres://db.internal/auth");

            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };
            let config = Config::load(&args)?;

            assert_eq!(config.auth.tokens.secret, SECRET);
            assert_eq!(config.auth.password.pepper, "pepper-from-env");
            assert_eq!(config.auth.tokens.access_expiry, Duration::from_secs(300));
            assert_eq!(config.auth.tokens.refresh_expiry, Duration::from_secs(24 * 3600));
            assert_eq!(config.auth.password.argon2_iterations, 4);
            assert_eq!(config.auth.default_role, "viewer");
            assert_eq!(config.rate_limit.requests_per_second, 2.5);
            assert_eq!(config.rate_limit.burst, 7);
            assert_eq!(config.rate_limit.store, RateLimitStoreKind::Shared);
            assert_eq!(config.permission_cache.ttl, Duration::from_secs(60));
            assert_eq!(config.shutdown_grace, Duration::from_secs(10));
            assert_eq!(config.environment, Environment::Staging);
            assert_eq!(config.security.cors.allowed_origins.len(), 2);
            assert_eq!(config.database.url, "postgres://db.internal/auth");

            Ok(())
        });
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "not_a_setting: true\n")?;
            let args = Args {
                config: "test.yaml".to_string(),
                validate: false,
            };
            assert!(Config::load(&args).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_placeholder_secret() {
        let mut config = valid_config();
        config.auth.tokens.secret = PLACEHOLDER_JWT_SECRET.to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("placeholder"));
    }

    #[test]
    fn test_validation_rejects_short_secret() {
        let mut config = valid_config();
        config.auth.tokens.secret = "too-short".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("at least 32 bytes"));
    }

    #[test]
    fn test_validation_rejects_placeholder_pepper() {
        let mut config = valid_config();
        config.auth.password.pepper = PLACEHOLDER_PEPPER.to_string();
        assert!(config.validate().unwrap_err().to_string().contains("pepper"));

        config.auth.password.pepper = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_refresh_must_outlive_access() {
        let mut config = valid_config();
        config.auth.tokens.refresh_expiry = config.auth.tokens.access_expiry;
        assert!(config.validate().unwrap_err().to_string().contains("refresh_expiry"));
    }

    #[test]
    fn test_validation_reset_token_expiry_capped() {
        let mut config = valid_config();
        config.auth.reset_token_expiry = Duration::from_secs(2 * 60 * 60);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_production_cost_minimum() {
        let mut config = valid_config();
        config.auth.password.argon2_memory_kib = 1024;
        config.auth.password.argon2_iterations = 1;
        assert!(config.validate().is_ok());

        config.environment = Environment::Production;
        assert!(config.validate().unwrap_err().to_string().contains("production minimum"));
    }

    #[test]
    fn test_validation_cors_wildcard_with_credentials() {
        let mut config = valid_config();
        config.security.cors.allowed_origins = vec![CorsOrigin::Wildcard];
        config.security.cors.allow_credentials = true;
        assert!(config.validate().is_err());

        config.security.cors.allow_credentials = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_health_timeout_bounded() {
        let mut config = valid_config();
        config.health.check_timeout = Duration::from_secs(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(valid_config().validate().is_ok());
    }
}
