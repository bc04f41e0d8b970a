// ── Keystone Gateway: HTTP Handlers ─────────────────────────────────────────
// One handler per externally-exposed route. Inbound bearer auth (when configured)
// is enforced in `mod.rs`'s middleware, not here.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::proxy::ProxyOutcome;

use super::state::AppState;

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            GatewayError::NoAccount { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
            GatewayError::Protocol(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            GatewayError::UpstreamAuth { .. } => (StatusCode::BAD_GATEWAY, "server_error"),
            GatewayError::UpstreamRateLimit { .. } => (StatusCode::TOO_MANY_REQUESTS, "server_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };
        let body = Json(json!({ "error": { "type": error_type, "message": self.to_string() } }));
        (status, body).into_response()
    }
}

fn outcome_into_response(outcome: ProxyOutcome) -> Response {
    match outcome {
        ProxyOutcome::Complete(value) => Json(value).into_response(),
        ProxyOutcome::Stream(frames) => {
            let body = frames.concat();
            (
                StatusCode::OK,
                [("content-type", "text/event-stream"), ("cache-control", "no-cache")],
                body,
            )
                .into_response()
        }
    }
}

pub async fn chat_completions(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match state.proxy.handle_openai_chat(body).await {
        Ok(outcome) => outcome_into_response(outcome),
        Err(e) => e.into_response(),
    }
}

pub async fn anthropic_messages(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> Response {
    match state.proxy.handle_anthropic_messages(body).await {
        Ok(outcome) => outcome_into_response(outcome),
        Err(e) => e.into_response(),
    }
}

/// `GET /v1/models`: the active account's `selected_models`, else its quota
/// keys, else a small built-in default, plus all discovered local models.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Response {
    let accounts = match state.store.list() {
        Ok(a) => a,
        Err(e) => return e.into_response(),
    };

    let mut ids: Vec<String> = Vec::new();
    if let Some(active) = accounts.iter().find(|a| a.is_active && !a.provider.is_local()) {
        if !active.selected_models.is_empty() {
            ids = active.selected_models.clone();
        } else if let Some(quota) = &active.quota {
            ids = quota.keys().cloned().collect();
        }
    }
    if ids.is_empty() {
        ids = vec!["gemini-2.5-pro".into(), "gemini-2.5-flash".into()];
    }

    let mut data: Vec<Value> = ids
        .iter()
        .map(|id| json!({ "id": id, "object": "model", "created": 0, "owned_by": "google" }))
        .collect();

    for local_account in accounts.iter().filter(|a| a.provider.is_local()) {
        if let Some(model) = local_account.local_model() {
            data.push(json!({ "id": model, "object": "model", "created": 0, "owned_by": "local", "local": true }));
        }
    }

    Json(json!({ "object": "list", "data": data })).into_response()
}

/// IDE-masquerade endpoints: canned-but-internally-consistent payloads whose
/// only contract is passing a third-party IDE's runtime checks.
pub async fn fetch_available_models() -> Response {
    Json(json!({
        "models": {
            "models/gemini-2.5-pro": { "quotaInfo": { "remainingFraction": 1.0, "resetTime": "" } }
        }
    }))
    .into_response()
}

pub async fn load_code_assist() -> Response {
    Json(json!({ "cloudaicompanionProject": "antigravity-sovereign-project" })).into_response()
}

fn canned_profile() -> Value {
    json!({
        "id": "sovereign-hardware",
        "email": "local-hardware@antigravity.os",
        "verified_email": true,
        "name": "Antigravity Sovereign",
        "given_name": "Antigravity",
        "family_name": "Sovereign",
        "picture": "",
        "locale": "en",
        "hd": "antigravity.os",
    })
}

pub async fn userinfo() -> Response {
    Json(canned_profile()).into_response()
}

/// People-API-shaped transform of the same canned identity.
pub async fn people_me() -> Response {
    let profile = canned_profile();
    Json(json!({
        "resourceName": "people/sovereign-hardware",
        "names": [{ "displayName": profile["name"] }],
        "emailAddresses": [{ "value": profile["email"] }],
        "photos": [{ "url": profile["picture"] }],
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_account_error_maps_to_500_class() {
        let err = GatewayError::NoAccount { model: "gemini-2.5-pro".into() };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn protocol_error_maps_to_400_class() {
        let err = GatewayError::Protocol("malformed body".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rate_limit_error_maps_to_429() {
        let err = GatewayError::UpstreamRateLimit {
            provider: "google".into(),
            message: "429".into(),
            retry_after_secs: None,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
