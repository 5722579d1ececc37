//! Fixtures shared by unit and handler tests. Everything runs on in-memory stores.

use axum_test::TestServer;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::revocation::{MemoryRevocationStore, RevocationStore};
use crate::auth::service::CreateSubject;
use crate::auth::tokens::TokenPair;
use crate::config::{Config, EmailTransportConfig, RevocationStoreKind};
use crate::email::CapturingNotifier;
use crate::identity::{SubjectView, memory::MemoryIdentityStore};
use crate::limits::MemoryBucketStore;
use crate::{AppState, Stores, build_router, build_state, seed_default_roles};

pub const ADMIN_EMAIL: &str = "admin@example.com";
pub const ADMIN_PASSWORD: &str = "Adm1n!Passw0rd";

pub fn create_test_config() -> Config {
    // Use temp directory for test emails
    let temp_dir = std::env::temp_dir().join(format!("authcore-test-emails-{}", std::process::id()));

    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    };
    config.auth.tokens.secret = "test-jwt-secret-that-is-at-least-32-bytes-long".to_string();
    config.auth.tokens.access_expiry = Duration::from_secs(15 * 60);
    config.auth.password.pepper = "test-pepper".to_string();
    // Cheap hashing keeps the suite fast
    config.auth.password.argon2_memory_kib = 1024;
    config.auth.password.argon2_iterations = 1;
    config.auth.password.argon2_parallelism = 1;
    config.auth.forgot_password_min_duration = Duration::from_millis(5);
    config.auth.email.transport = EmailTransportConfig::File {
        path: temp_dir.to_string_lossy().into_owned(),
    };
    config.revocation.store = RevocationStoreKind::Memory;
    config.rate_limit.requests_per_second = 1000.0;
    config.rate_limit.burst = 1000;
    config.rate_limit.auth_attempts = 1000;
    config
}

/// App state plus typed handles on the in-memory stores behind it.
pub struct TestServices {
    pub identity: Arc<MemoryIdentityStore>,
    pub notifier: Arc<CapturingNotifier>,
    pub stores: Stores,
    pub state: AppState,
}

impl Deref for TestServices {
    type Target = AppState;

    fn deref(&self) -> &AppState {
        &self.state
    }
}

pub async fn create_test_services(config: &Config) -> TestServices {
    let identity = Arc::new(MemoryIdentityStore::new());
    let notifier = Arc::new(CapturingNotifier::default());
    let revocation: Option<Arc<dyn RevocationStore>> = match config.revocation.store {
        RevocationStoreKind::Disabled => None,
        _ => Some(Arc::new(MemoryRevocationStore::default())),
    };
    let stores = Stores::builder()
        .identity(identity.clone())
        .maybe_revocation(revocation)
        .buckets(Arc::new(MemoryBucketStore::new()))
        .notifier(notifier.clone())
        .build();

    seed_default_roles(identity.as_ref()).await.expect("Failed to seed roles");
    let state = build_state(config.clone(), &stores).expect("Failed to build app state");

    TestServices {
        identity,
        notifier,
        stores,
        state,
    }
}

pub async fn create_test_app_state() -> AppState {
    create_test_services(&create_test_config()).await.state
}

pub async fn create_test_app() -> (TestServer, TestServices) {
    create_test_app_with_config(create_test_config()).await
}

pub async fn create_test_app_with_config(config: Config) -> (TestServer, TestServices) {
    let services = create_test_services(&config).await;
    let router = build_router(&services.state).expect("Failed to build router");
    let server = TestServer::new(router).expect("Failed to create test server");
    (server, services)
}

/// Register through the service, getting the configured default role.
pub async fn register_subject(state: &AppState, email: &str, username: &str, password: &str) -> SubjectView {
    state
        .auth
        .create_subject(CreateSubject {
            email: email.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            display_name: None,
        })
        .await
        .expect("Failed to register test subject")
}

pub async fn login_as(state: &AppState, email: &str, password: &str) -> TokenPair {
    state
        .auth
        .login(email, password, "test")
        .await
        .expect("Failed to log in test subject")
        .tokens
}

/// A subject holding only the `admin` role, logged in.
pub async fn create_test_admin(state: &AppState) -> (SubjectView, TokenPair) {
    let admin = state
        .auth
        .create_subject_with_roles(
            CreateSubject {
                email: ADMIN_EMAIL.to_string(),
                username: "admin".to_string(),
                password: ADMIN_PASSWORD.to_string(),
                display_name: None,
            },
            &["admin".to_string()],
        )
        .await
        .expect("Failed to create test admin");
    let tokens = login_as(state, ADMIN_EMAIL, ADMIN_PASSWORD).await;
    (admin, tokens)
}
