// ── Keystone Gateway: HTTP Server ────────────────────────────────────────────
// Router wiring + bootstrap. Binds strictly to `127.0.0.1` — never `0.0.0.0`
// — because this gateway exists to proxy locally-held credentials, and
// binding any wider interface would expose them to the LAN.

pub mod handlers;
pub mod state;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::error::{GatewayError, GatewayResult};

pub use state::AppState;

/// Guards against a second `serve()` call racing a bind onto the same port
/// from within one process. A failed OS-level bind is a `GatewayError`, not
/// a panic — the caller decides what to do about an already-running instance.
static SERVER_RUNNING: AtomicBool = AtomicBool::new(false);

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let Some(expected) = &state.config.auth_token else {
        return Ok(next.run(request).await);
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(expected.as_str()) {
        return Err(GatewayError::Protocol("missing or invalid bearer token".into()));
    }
    Ok(next.run(request).await)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/messages", post(handlers::anthropic_messages))
        .route("/v1internal:fetchAvailableModels", post(handlers::fetch_available_models))
        .route("/v1internal:loadCodeAssist", post(handlers::load_code_assist))
        .route("/oauth2/v1/userinfo", get(handlers::userinfo))
        .route("/oauth2/v2/userinfo", get(handlers::userinfo))
        .route("/v1/people/me", get(handlers::people_me))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds and serves until the process is terminated. Refuses to start a
/// second instance from within this process.
pub async fn serve(state: Arc<AppState>) -> GatewayResult<()> {
    if SERVER_RUNNING.swap(true, Ordering::SeqCst) {
        return Err(GatewayError::Config("gateway server is already running in this process".into()));
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], state.config.port));
    let result = bind_and_serve(addr, state).await;
    SERVER_RUNNING.store(false, Ordering::SeqCst);
    result
}

async fn bind_and_serve(addr: SocketAddr, state: Arc<AppState>) -> GatewayResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatewayError::Config(format!("failed to bind {addr}: {e}")))?;
    log::info!("keystone-gateway listening on {addr}");
    axum::serve(listener, router(state)).await.map_err(GatewayError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::store::Store;
    use crate::token_manager::{RefreshedToken, TokenManager, TokenRefresher};
    use crate::types::Account;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct NoopRefresher;
    impl TokenRefresher for NoopRefresher {
        fn refresh(&self, _a: &Account) -> GatewayResult<RefreshedToken> {
            Err("no refresh in test".into())
        }
        fn fetch_project_id(&self, _a: &Account) -> GatewayResult<Option<String>> {
            Ok(None)
        }
    }

    fn test_state(auth_token: Option<String>) -> Arc<AppState> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let token_manager = Arc::new(TokenManager::new(store.clone()));
        let proxy = Arc::new(crate::proxy::Proxy::new(
            store.clone(),
            token_manager.clone(),
            reqwest::Client::new(),
            Arc::new(NoopRefresher),
            None,
        ));
        let mut config = GatewayConfig::default();
        config.auth_token = auth_token;
        AppState::new(config, store, token_manager, proxy)
    }

    #[tokio::test]
    async fn models_endpoint_falls_back_to_defaults_with_no_accounts() {
        let app = router(test_state(None));
        let response = app
            .oneshot(HttpRequest::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_request_without_bearer_token_when_configured() {
        let app = router(test_state(Some("secret".into())));
        let response = app
            .oneshot(HttpRequest::builder().uri("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepts_request_with_matching_bearer_token() {
        let app = router(test_state(Some("secret".into())));
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/v1/models")
                    .header(header::AUTHORIZATION, "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
