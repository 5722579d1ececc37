use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, header},
    middleware::Next,
    response::Response,
};

use crate::config::Environment;

const ALWAYS: &[(HeaderName, &str)] = &[
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::X_XSS_PROTECTION, "1; mode=block"),
    (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
];

const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=(), payment=()";
const CONTENT_SECURITY_POLICY: &str = "default-src 'none'; frame-ancestors 'none'; base-uri 'none'";
const STRICT_TRANSPORT_SECURITY: &str = "max-age=31536000; includeSubDomains";

/// Hardening headers on every response. CSP and HSTS only in production.
pub async fn security_headers(State(environment): State<Environment>, request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    for (name, value) in ALWAYS {
        headers.insert(name.clone(), HeaderValue::from_static(value));
    }
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static(PERMISSIONS_POLICY),
    );
    if environment.is_production() {
        headers.insert(header::CONTENT_SECURITY_POLICY, HeaderValue::from_static(CONTENT_SECURITY_POLICY));
        headers.insert(header::STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(STRICT_TRANSPORT_SECURITY));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, middleware::from_fn_with_state, routing::get};
    use axum_test::TestServer;

    fn server(environment: Environment) -> TestServer {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(environment, security_headers));
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn test_development_headers() {
        let response = server(Environment::Development).get("/").await;
        assert_eq!(response.header("x-content-type-options"), "nosniff");
        assert_eq!(response.header("x-frame-options"), "DENY");
        assert_eq!(response.header("x-xss-protection"), "1; mode=block");
        assert!(response.maybe_header("referrer-policy").is_some());
        assert!(response.maybe_header("permissions-policy").is_some());
        assert!(response.maybe_header("content-security-policy").is_none());
        assert!(response.maybe_header("strict-transport-security").is_none());
    }

    #[tokio::test]
    async fn test_production_adds_csp_and_hsts() {
        let response = server(Environment::Production).get("/").await;
        assert_eq!(response.header("content-security-policy"), CONTENT_SECURITY_POLICY);
        assert_eq!(response.header("strict-transport-security"), STRICT_TRANSPORT_SECURITY);
    }
}
