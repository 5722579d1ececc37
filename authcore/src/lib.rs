//! # authcore: authentication and authorization core
//!
//! `authcore` owns the credential and session lifecycle of a multi-tenant backend:
//! password hashing, JWT access and refresh tokens with rotation and revocation,
//! role-based authorization with a live permission cache, rate limiting, login lockout
//! and the health contract with the host. Domain CRUD lives elsewhere; it reaches this
//! crate through the request pipeline and the [`auth::gate`] route layers.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum). Persistence goes through
//! two seams: [`identity::IdentityStore`] for subjects and roles, and
//! [`auth::revocation::RevocationStore`] for shared expiring state (revoked tokens,
//! reset tokens, lockouts). Both have PostgreSQL and in-memory implementations; the
//! in-memory ones are correct for a single instance and back every test.
//!
//! ### Request Flow
//!
//! A request passes the layers in [`middleware`] outermost first: request ids, tracing,
//! the access log, panic recovery, security headers, CORS and the rate limiter. Routes
//! that need a caller add [`auth::middleware::require_auth`], which validates the bearer
//! token and attaches an [`auth::principal::Principal`]. Authorization gates then consult
//! the [`auth::permission_cache::PermissionCache`], so a role change applies on the very
//! next request rather than when the token expires.
//!
//! ### Core Components
//!
//! The **authentication service** ([`auth::service`]) composes passwords, tokens, the
//! reset-token store and the login throttle into registration, login, refresh, logout
//! and the password reset flow.
//!
//! The **API layer** ([`api`]) exposes `/auth/*` and `/admin/*` over the services, with an
//! OpenAPI document at `/openapi.json`. Health probes live at `/health/live` and
//! `/health/ready` ([`health`]) and are not rate limited.
//!
//! **Background services** sweep expired reset tokens, revocations, idle rate-limit
//! buckets and stale lockout counters. They stop with the [`Application`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use authcore::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = authcore::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     authcore::telemetry::init_telemetry(config.log_format, config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod email;
pub mod errors;
pub mod health;
pub mod identity;
pub mod limits;
pub mod middleware;
mod openapi;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use axum::{
    Router,
    extract::{MatchedPath, Request},
    http::{HeaderName, HeaderValue, Method, header},
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use bon::Builder;
pub use config::Config;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    sensitive_headers::{SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer},
    trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tower::ServiceBuilder;
use tracing::{Level, Span, debug, info, info_span, instrument, warn};

use crate::{
    api::handlers,
    auth::{
        lockout::LoginThrottle,
        middleware::require_auth,
        password::PasswordService,
        permission_cache::PermissionCache,
        reset_tokens::ResetTokenStore,
        revocation::{MemoryRevocationStore, RevocationStore},
        roles::RoleManager,
        service::{AuthService, CreateSubject},
        tokens::TokenService,
    },
    config::{CorsConfig, CorsOrigin, RateLimitStoreKind, RevocationStoreKind},
    db::{
        errors::DbError,
        handlers::{rate_limits::PgBucketStore, revocations::PgRevocationStore},
        pools::DbPools,
    },
    email::{EmailService, ResetNotifier},
    health::{
        HealthCheck, HealthRegistry,
        checks::{EmailCheck, IdentityStoreCheck, PermissionCacheCheck, RevocationStoreCheck},
    },
    identity::{IdentityStore, SubjectUpdate, memory::MemoryIdentityStore, postgres::PgIdentityStore},
    limits::{MemoryBucketStore, RateLimitStore, RateLimiter},
    middleware::RequestIds,
    types::{abbrev_uuid, normalize_email},
};

pub use types::{RoleId, SubjectId};

/// Application state shared across all request handlers.
///
/// Everything inside is cheap to clone: services hold their stores behind `Arc`s.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .auth(auth)
///     .roles(roles)
///     .health(health)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub auth: AuthService,
    pub roles: RoleManager,
    /// `None` when rate limiting is disabled
    pub rate_limiter: Option<RateLimiter>,
    pub health: HealthRegistry,
}

/// The backing stores a deployment runs on.
#[derive(Clone, Builder)]
pub struct Stores {
    pub identity: Arc<dyn IdentityStore>,
    /// `None` disables token revocation
    pub revocation: Option<Arc<dyn RevocationStore>>,
    pub buckets: Arc<dyn RateLimitStore>,
    pub notifier: Option<Arc<dyn ResetNotifier>>,
}

impl Stores {
    /// Process-local stores for a single instance. A `postgres` revocation store falls back
    /// to memory here.
    pub fn in_memory(config: &Config) -> anyhow::Result<Self> {
        let revocation: Option<Arc<dyn RevocationStore>> = match config.revocation.store {
            RevocationStoreKind::Disabled => None,
            RevocationStoreKind::Memory | RevocationStoreKind::Postgres => Some(Arc::new(MemoryRevocationStore::default())),
        };
        Ok(Self {
            identity: Arc::new(MemoryIdentityStore::new()),
            revocation,
            buckets: Arc::new(MemoryBucketStore::new()),
            notifier: Some(Arc::new(EmailService::new(&config.auth.email)?)),
        })
    }

    /// Stores selected by configuration, with identity always in PostgreSQL.
    pub fn from_config(config: &Config, pools: &DbPools) -> anyhow::Result<Self> {
        let revocation: Option<Arc<dyn RevocationStore>> = match config.revocation.store {
            RevocationStoreKind::Memory => Some(Arc::new(MemoryRevocationStore::default())),
            RevocationStoreKind::Postgres => Some(Arc::new(PgRevocationStore::new(pools.write().clone()))),
            RevocationStoreKind::Disabled => {
                warn!("Token revocation is disabled: logout cannot invalidate issued tokens");
                None
            }
        };
        let buckets: Arc<dyn RateLimitStore> = match config.rate_limit.store {
            RateLimitStoreKind::Memory => Arc::new(MemoryBucketStore::new()),
            RateLimitStoreKind::Shared => Arc::new(PgBucketStore::new(pools.write().clone())),
        };
        Ok(Self {
            identity: Arc::new(PgIdentityStore::new(pools.clone())),
            revocation,
            buckets,
            notifier: Some(Arc::new(EmailService::new(&config.auth.email)?)),
        })
    }
}

/// Wire the services over `stores`.
pub fn build_state(config: Config, stores: &Stores) -> anyhow::Result<AppState> {
    let passwords = PasswordService::new(&config.auth.password)?;
    let tokens = TokenService::new(&config.auth.tokens, stores.revocation.clone())?;
    // Invalidations travel through the revocation store so every instance sees them
    let generations: Arc<dyn RevocationStore> = match &stores.revocation {
        Some(store) => store.clone(),
        None => Arc::new(MemoryRevocationStore::new()),
    };
    let permissions = Arc::new(PermissionCache::new(stores.identity.clone(), generations, &config.permission_cache));
    let throttle = Arc::new(LoginThrottle::new(config.auth.lockout.clone(), stores.revocation.clone()));

    let auth = AuthService::builder()
        .identity(stores.identity.clone())
        .passwords(passwords)
        .tokens(tokens)
        .permissions(permissions.clone())
        .reset_tokens(ResetTokenStore::new(stores.revocation.clone()))
        .throttle(throttle)
        .maybe_notifier(stores.notifier.clone())
        .config(config.auth.clone())
        .build();
    let roles = RoleManager::new(stores.identity.clone(), permissions.clone());
    let rate_limiter = RateLimiter::from_config(&config.rate_limit, stores.buckets.clone());

    let mut checks: Vec<Arc<dyn HealthCheck>> = vec![
        Arc::new(IdentityStoreCheck(stores.identity.clone())),
        Arc::new(PermissionCacheCheck(permissions)),
    ];
    if let Some(revocation) = &stores.revocation {
        checks.push(Arc::new(RevocationStoreCheck(revocation.clone())));
    }
    if let Some(notifier) = &stores.notifier {
        checks.push(Arc::new(EmailCheck(notifier.clone())));
    }
    let health = HealthRegistry::new(checks, config.health.check_timeout);

    Ok(AppState::builder()
        .config(config)
        .auth(auth)
        .roles(roles)
        .maybe_rate_limiter(rate_limiter)
        .health(health)
        .build())
}

/// Get the authcore database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Role catalog installed into an empty store: name, description, permissions.
pub const DEFAULT_ROLES: &[(&str, &str, &[&str])] = &[
    ("admin", "Full access", &["*"]),
    (
        "manager",
        "Manages subjects, catalogue and orders",
        &["users.read", "roles.read", "roles.write", "products.*", "orders.*"],
    ),
    (
        "user",
        "Standard account",
        &["products.read", "orders.read", "orders.write", "profile.read", "profile.write"],
    ),
];

/// Install [`DEFAULT_ROLES`] if the store has no roles yet.
///
/// Safe to run on every start and from several instances at once: a role created
/// concurrently by another instance is left as it is.
#[instrument(skip_all, err)]
pub async fn seed_default_roles(store: &dyn IdentityStore) -> Result<(), DbError> {
    if !store.list_roles().await?.is_empty() {
        debug!("Role catalog present, skipping seed");
        return Ok(());
    }

    for (name, description, permissions) in DEFAULT_ROLES {
        let permissions: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        match store.create_role(name, description, &permissions).await {
            Ok(_) => {}
            Err(DbError::UniqueViolation { .. }) => debug!(role = name, "Role created concurrently"),
            Err(e) => return Err(e),
        }
    }
    info!(roles = DEFAULT_ROLES.len(), "Seeded default role catalog");
    Ok(())
}

/// Username for a bootstrap admin: the email local part reduced to username characters.
fn admin_username(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    let mut username: String = local
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(50)
        .collect();
    if username.chars().count() < 3 {
        username = "admin".to_string();
    }
    username
}

/// Create the initial administrator if it doesn't exist.
///
/// Idempotent: an existing subject with this email is granted the `admin` role, and its
/// password is replaced when one is given. Without a password no new subject is created.
/// Returns the administrator's id, or `None` when nothing could be created.
#[instrument(skip_all, err)]
pub async fn create_initial_admin(state: &AppState, email: &str, password: Option<&str>) -> anyhow::Result<Option<SubjectId>> {
    let identity = state.auth.identity();
    let email = normalize_email(email);

    if let Some(existing) = identity.get_by_email(&email).await? {
        state.roles.assign_role(existing.id, "admin", None).await?;
        if let Some(password) = password {
            let password_digest = state.auth.passwords().hash_async(password.to_string()).await?;
            identity
                .update(
                    existing.id,
                    SubjectUpdate {
                        password_digest: Some(password_digest),
                        ..Default::default()
                    },
                )
                .await?;
        }
        info!(subject_id = %abbrev_uuid(&existing.id), "Initial admin present");
        return Ok(Some(existing.id));
    }

    let Some(password) = password else {
        warn!("admin_email is set without admin_password; no administrator was created");
        return Ok(None);
    };

    let admin = state
        .auth
        .create_subject_with_roles(
            CreateSubject {
                username: admin_username(&email),
                email,
                password: password.to_string(),
                display_name: Some("Administrator".to_string()),
            },
            &["admin".to_string()],
        )
        .await?;
    info!(subject_id = %abbrev_uuid(&admin.id), "Created initial admin");
    Ok(Some(admin.id))
}

fn create_cors_layer(config: &CorsConfig) -> anyhow::Result<CorsLayer> {
    let origins = if config.allowed_origins.iter().any(|o| matches!(o, CorsOrigin::Wildcard)) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let methods = if config.allowed_methods.iter().any(|m| m == "*") {
        anyhow::ensure!(!config.allow_credentials, "CORS: wildcard methods cannot be combined with credentials");
        AllowMethods::any()
    } else {
        let mut methods = Vec::new();
        for method in &config.allowed_methods {
            methods.push(method.to_ascii_uppercase().parse::<Method>()?);
        }
        AllowMethods::list(methods)
    };

    let headers = if config.allowed_headers.iter().any(|h| h == "*") {
        anyhow::ensure!(!config.allow_credentials, "CORS: wildcard headers cannot be combined with credentials");
        AllowHeaders::any()
    } else {
        let mut headers = Vec::new();
        for name in &config.allowed_headers {
            headers.push(name.parse::<HeaderName>()?);
        }
        AllowHeaders::list(headers)
    };

    let mut exposed = vec![header::RETRY_AFTER];
    for name in &config.exposed_headers {
        exposed.push(name.parse::<HeaderName>()?);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(config.allow_credentials)
        .expose_headers(exposed);

    if let Some(max_age) = config.max_age {
        cors = cors.max_age(Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the main application router with all endpoints and middleware.
///
/// Auth and admin routes sit behind the rate limiter; health probes and the OpenAPI
/// document do not. The remaining layers wrap everything, see [`middleware`] for the order.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let public_auth = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/password/forgot", post(handlers::auth::forgot_password))
        .route("/auth/password/reset", post(handlers::auth::reset_password));

    let session = Router::new()
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/me", get(handlers::auth::me))
        .route("/auth/password/change", post(handlers::auth::change_password))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    // Gates authenticate on their own
    let admin = handlers::admin::router(state);

    let limited = public_auth
        .merge(session)
        .merge(admin)
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit));

    let router = Router::new()
        .route("/health/live", get(health::handlers::liveness))
        .route("/health/ready", get(health::handlers::readiness))
        .route("/openapi.json", get(openapi::openapi_json))
        .merge(limited)
        .with_state(state.clone());

    let sensitive: Arc<[HeaderName]> = Arc::from([header::AUTHORIZATION, header::COOKIE, header::SET_COOKIE]);

    let router = router.layer(
        ServiceBuilder::new()
            .layer(from_fn(middleware::request_id))
            .layer(SetSensitiveRequestHeadersLayer::from_shared(sensitive.clone()))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(make_span)
                    .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            )
            .layer(SetSensitiveResponseHeadersLayer::from_shared(sensitive))
            .layer(from_fn(middleware::access_log))
            .layer(middleware::catch_panic_layer())
            .layer(from_fn_with_state(state.config.environment, middleware::security_headers))
            .layer(create_cors_layer(&state.config.security.cors)?),
    );

    Ok(router)
}

fn make_span(request: &Request) -> Span {
    let request_id = request
        .extensions()
        .get::<RequestIds>()
        .map_or("none", |ids| ids.request_id.as_str());
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = route,
        request_id
    )
}

/// Run `tick` every `every` until `shutdown` fires. The first run is one period in.
fn spawn_periodic<F, Fut>(task: &'static str, every: Duration, shutdown: CancellationToken, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        debug!(task, "Background task stopped");
    })
}

/// Periodic maintenance tasks running alongside the HTTP server.
///
/// When dropped, the `drop_guard` cancels the shutdown token, so tasks never outlive
/// their owner. [`shutdown`](BackgroundServices::shutdown) also waits for them to finish.
pub struct BackgroundServices {
    background_tasks: Vec<JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<DropGuard>,
}

impl BackgroundServices {
    /// Spawn the sweeps for `state`.
    pub fn start(state: &AppState, stores: &Stores) -> Self {
        let shutdown_token = CancellationToken::new();
        let drop_guard = shutdown_token.clone().drop_guard();
        let sweep_interval = state.config.revocation.sweep_interval;
        let mut background_tasks = Vec::new();

        background_tasks.push(state.auth.reset_tokens().spawn_sweeper(sweep_interval, shutdown_token.child_token()));

        if let Some(store) = stores.revocation.clone() {
            background_tasks.push(spawn_periodic("revocation_purge", sweep_interval, shutdown_token.child_token(), move || {
                let store = store.clone();
                async move {
                    match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, store = store.name(), "Purged expired revocations"),
                        Err(e) => warn!(error = %e, store = store.name(), "Revocation purge failed"),
                    }
                }
            }));
        }

        if state.rate_limiter.is_some() {
            let buckets = stores.buckets.clone();
            let idle = state.config.rate_limit.idle_timeout;
            background_tasks.push(spawn_periodic("bucket_eviction", idle / 2, shutdown_token.child_token(), move || {
                let buckets = buckets.clone();
                async move {
                    match buckets.evict_idle(idle).await {
                        Ok(0) => {}
                        Ok(evicted) => debug!(evicted, store = buckets.name(), "Evicted idle rate-limit buckets"),
                        Err(e) => warn!(error = %e, store = buckets.name(), "Rate-limit bucket eviction failed"),
                    }
                }
            }));
        }

        if state.auth.throttle().enabled() {
            let throttle = state.auth.throttle().clone();
            background_tasks.push(spawn_periodic("lockout_eviction", sweep_interval, shutdown_token.child_token(), move || {
                let evicted = throttle.evict_stale();
                async move {
                    if evicted > 0 {
                        debug!(evicted, "Evicted stale login failure counters");
                    }
                }
            }));
        }

        info!(tasks = background_tasks.len(), "Background services started");
        Self {
            background_tasks,
            shutdown_token,
            drop_guard: Some(drop_guard),
        }
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations, seeds the
///    role catalog, creates the initial admin and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: readiness flips to unhealthy, in-flight requests get `shutdown_grace`
///    to finish, then background tasks and pools are closed
pub struct Application {
    router: Router,
    app_state: AppState,
    config: Config,
    pools: Option<DbPools>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application backed by PostgreSQL.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pools = DbPools::connect(&config.database).await?;
        migrator().run(pools.write()).await?;
        info!(replica = pools.has_replica(), "Database ready");

        let stores = Stores::from_config(&config, &pools)?;
        let mut app = Self::with_stores(config, stores).await?;
        app.pools = Some(pools);
        Ok(app)
    }

    /// Create an application over explicit stores.
    pub async fn with_stores(config: Config, stores: Stores) -> anyhow::Result<Self> {
        let app_state = build_state(config.clone(), &stores)?;

        seed_default_roles(app_state.auth.identity().as_ref()).await?;
        if let Some(email) = &config.admin_email {
            create_initial_admin(&app_state, email, config.admin_password.as_deref()).await?;
        }

        let router = build_router(&app_state)?;
        let bg_services = BackgroundServices::start(&app_state, &stores);

        Ok(Self {
            router,
            app_state,
            config,
            pools: None,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, AppState, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.app_state, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("authcore listening on http://{}", listener.local_addr()?);

        let health = self.app_state.health.clone();
        let draining = CancellationToken::new();
        let signal = {
            let draining = draining.clone();
            async move {
                shutdown.await;
                health.begin_shutdown();
                draining.cancel();
            }
        };

        let server = axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .into_future();
        tokio::pin!(server);

        let grace = self.config.shutdown_grace;
        tokio::select! {
            result = &mut server => result?,
            _ = async {
                draining.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                warn!(grace = %humantime::format_duration(grace), "In-flight requests did not finish in time, closing connections");
            }
        }

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        if let Some(pools) = self.pools {
            info!("Closing database connections...");
            pools.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
