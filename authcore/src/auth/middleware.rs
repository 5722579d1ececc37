//! Route layers that authenticate the bearer token.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use crate::AppState;
use crate::auth::principal::{attach, authenticate};
use crate::errors::Error;

/// Reject the request unless it carries a valid access token.
///
/// Failures use the codes `MISSING_AUTH_HEADER`, `INVALID_AUTH_FORMAT`, `INVALID_TOKEN`
/// and `TOKEN_EXPIRED`.
pub async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response, Error> {
    let auth = authenticate(state.auth.tokens(), request.headers()).await?;
    attach(request.extensions_mut(), auth);
    Ok(next.run(request).await)
}

/// Attach a principal when the token is valid, otherwise continue anonymously.
pub async fn optional_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    match authenticate(state.auth.tokens(), request.headers()).await {
        Ok(auth) => attach(request.extensions_mut(), auth),
        Err(e) => debug!(error = %e, "Optional authentication failed, continuing anonymously"),
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::principal::{OptionalPrincipal, Principal};
    use crate::test_utils::{create_test_app_state, login_as, register_subject};
    use axum::{Json, Router, middleware::from_fn_with_state, routing::get};
    use axum_test::TestServer;

    async fn server() -> (TestServer, AppState) {
        let state = create_test_app_state().await;
        let protected = Router::new()
            .route("/protected", get(|principal: Principal| async move { Json(principal) }))
            .route_layer(from_fn_with_state(state.clone(), require_auth));
        let open = Router::new()
            .route(
                "/open",
                get(|OptionalPrincipal(principal): OptionalPrincipal| async move {
                    principal.map(|p| p.username).unwrap_or_else(|| "anonymous".to_string())
                }),
            )
            .route_layer(from_fn_with_state(state.clone(), optional_auth));
        let app = protected.merge(open).with_state(state.clone());
        (TestServer::new(app).unwrap(), state)
    }

    async fn code_of(response: axum_test::TestResponse) -> String {
        response.json::<serde_json::Value>()["code"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_require_auth_error_codes() {
        let (server, _state) = server().await;

        let missing = server.get("/protected").await;
        missing.assert_status_unauthorized();
        assert_eq!(code_of(missing).await, "MISSING_AUTH_HEADER");

        let format = server.get("/protected").add_header("authorization", "Basic abc").await;
        assert_eq!(code_of(format).await, "INVALID_AUTH_FORMAT");

        let invalid = server.get("/protected").add_header("authorization", "Bearer not-a-jwt").await;
        invalid.assert_status_unauthorized();
        assert_eq!(code_of(invalid).await, "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn test_require_auth_attaches_principal() {
        let (server, state) = server().await;
        register_subject(&state, "alice@example.com", "alice", "P@ssw0rd!").await;
        let tokens = login_as(&state, "alice@example.com", "P@ssw0rd!").await;

        let response = server
            .get("/protected")
            .authorization_bearer(&tokens.access_token)
            .await;
        response.assert_status_ok();
        let principal: serde_json::Value = response.json();
        assert_eq!(principal["username"], "alice");
        assert_eq!(principal["roles"], serde_json::json!(["user"]));

        // A refresh token is not an access token
        let wrong = server
            .get("/protected")
            .authorization_bearer(&tokens.refresh_token)
            .await;
        assert_eq!(code_of(wrong).await, "INVALID_TOKEN");
    }

    #[tokio::test]
    async fn test_optional_auth_continues_without_principal() {
        let (server, state) = server().await;
        server.get("/open").await.assert_text("anonymous");
        server
            .get("/open")
            .add_header("authorization", "Bearer garbage")
            .await
            .assert_text("anonymous");

        register_subject(&state, "bob@example.com", "bob", "P@ssw0rd!").await;
        let tokens = login_as(&state, "bob@example.com", "P@ssw0rd!").await;
        server
            .get("/open")
            .authorization_bearer(&tokens.access_token)
            .await
            .assert_text("bob");
    }
}
