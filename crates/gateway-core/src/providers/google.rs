// ── Keystone Gateway: Google Cloud-Code Client ──────────────────────────────
// OAuth token refresh, project-id discovery, and quota-source calls against
// Google's internal "cloud-code" endpoints. Retry/circuit-breaker behavior
// is generalized through `crate::http`.

use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Deserialize;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};
use crate::http::{self, CircuitBreaker};
use crate::types::ModelQuota;

const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const USERINFO_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const LOAD_CODE_ASSIST_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com/v1internal:loadCodeAssist";
const FETCH_MODELS_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com/v1internal:fetchAvailableModels";
const CATALOGUE_V1: &str = "https://generativelanguage.googleapis.com/v1/models?pageSize=1000";
const CATALOGUE_V1BETA: &str = "https://generativelanguage.googleapis.com/v1beta/models?pageSize=1000";

static GOOGLE_CIRCUIT: LazyLock<CircuitBreaker> = LazyLock::new(|| CircuitBreaker::new(5, 60));

fn antigravity_user_agent() -> String {
    format!("antigravity/0.1 {}/{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    expires_in: i64,
}

pub struct RefreshOutcome {
    pub access_token: String,
    pub expires_in: i64,
}

/// Exchanges a refresh token for a fresh access token. Retries transient
/// failures with the shared backoff schedule; 401/403 is not retried.
pub async fn refresh_token(
    client: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> GatewayResult<RefreshOutcome> {
    if !GOOGLE_CIRCUIT.check() {
        return Err(GatewayError::UpstreamTransient {
            provider: "google".into(),
            message: "circuit breaker open".into(),
        });
    }

    let mut last_err = None;
    for attempt in 0..http::MAX_RETRIES {
        let response = client
            .post(TOKEN_ENDPOINT)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                GOOGLE_CIRCUIT.record_success();
                let parsed: TokenRefreshResponse = resp.json().await?;
                return Ok(RefreshOutcome { access_token: parsed.access_token, expires_in: parsed.expires_in });
            }
            Ok(resp) if resp.status() == 401 || resp.status() == 403 => {
                GOOGLE_CIRCUIT.record_failure();
                return Err(GatewayError::UpstreamAuth {
                    provider: "google".into(),
                    message: format!("token refresh rejected with status {}", resp.status()),
                });
            }
            Ok(resp) => {
                GOOGLE_CIRCUIT.record_failure();
                last_err = Some(GatewayError::UpstreamTransient {
                    provider: "google".into(),
                    message: format!("token refresh returned status {}", resp.status()),
                });
            }
            Err(e) => {
                GOOGLE_CIRCUIT.record_failure();
                last_err = Some(GatewayError::Network(e));
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(http::retry_delay_ms(attempt))).await;
    }
    Err(last_err.unwrap_or(GatewayError::Other("token refresh failed with no response".into())))
}

#[derive(Deserialize)]
struct LoadCodeAssistResponse {
    #[serde(rename = "cloudaicompanionProject")]
    cloudaicompanion_project: Option<String>,
}

/// Project-id discovery. A non-fatal failure here is expected and handled by
/// the caller (token manager falls back to a deterministic id).
pub async fn load_code_assist(client: &reqwest::Client, access_token: &str) -> GatewayResult<Option<String>> {
    let response = client
        .post(LOAD_CODE_ASSIST_ENDPOINT)
        .bearer_auth(access_token)
        .header("User-Agent", antigravity_user_agent())
        .json(&json!({ "metadata": { "ideType": "ANTIGRAVITY" } }))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(GatewayError::UpstreamTransient {
            provider: "google".into(),
            message: format!("loadCodeAssist returned status {}", response.status()),
        });
    }
    let parsed: LoadCodeAssistResponse = response.json().await?;
    Ok(parsed.cloudaicompanion_project)
}

/// Confirms the access token resolves to a user via the standard OAuth2
/// userinfo endpoint. Used by the account-add flow, not the hot path.
pub async fn fetch_userinfo(client: &reqwest::Client, access_token: &str) -> GatewayResult<serde_json::Value> {
    let response = client.get(USERINFO_ENDPOINT).bearer_auth(access_token).send().await?;
    Ok(response.json().await?)
}

#[derive(Deserialize)]
struct FetchModelsResponse {
    #[serde(default)]
    models: HashMap<String, ModelQuotaInfo>,
}

#[derive(Deserialize)]
struct ModelQuotaInfo {
    #[serde(rename = "quotaInfo")]
    quota_info: QuotaInfo,
}

#[derive(Deserialize)]
struct QuotaInfo {
    #[serde(rename = "remainingFraction")]
    remaining_fraction: f64,
    #[serde(rename = "resetTime", default)]
    reset_time: String,
}

/// Quota source A: the cloud-code telemetry endpoint. Source B/C (the public
/// model catalogues) only contribute display names; their id set is merged
/// in by the monitor, not here.
pub async fn fetch_available_models(
    client: &reqwest::Client,
    access_token: &str,
) -> GatewayResult<HashMap<String, ModelQuota>> {
    let response = client.post(FETCH_MODELS_ENDPOINT).bearer_auth(access_token).json(&json!({})).send().await?;

    let status = response.status();
    if status == 429 {
        return Err(GatewayError::UpstreamRateLimit {
            provider: "google".into(),
            message: "fetchAvailableModels rate limited".into(),
            retry_after_secs: None,
        });
    }
    if !status.is_success() {
        return Err(GatewayError::UpstreamTransient {
            provider: "google".into(),
            message: format!("fetchAvailableModels returned status {status}"),
        });
    }

    let parsed: FetchModelsResponse = response.json().await?;
    Ok(parsed
        .models
        .into_iter()
        .map(|(id, info)| {
            let model_id = id.strip_prefix("models/").unwrap_or(&id).to_string();
            let percentage = (info.quota_info.remaining_fraction * 100.0).round().clamp(0.0, 100.0) as u8;
            (
                model_id,
                ModelQuota {
                    percentage,
                    reset_time: info.quota_info.reset_time,
                    display_name: None,
                    max_token_allowed: None,
                    max_completion_tokens: None,
                },
            )
        })
        .collect())
}

#[derive(Deserialize)]
struct CatalogueResponse {
    #[serde(default)]
    models: Vec<CatalogueModel>,
}

#[derive(Deserialize)]
struct CatalogueModel {
    name: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

/// Merges quota sources B and C (the v1 and v1beta public catalogues) into
/// `quota`, filling in `display_name` for ids already present from source A
/// and adding zero-usage placeholders for ids seen only in the catalogue.
pub async fn merge_catalogue_display_names(
    client: &reqwest::Client,
    quota: &mut HashMap<String, ModelQuota>,
) -> GatewayResult<()> {
    for url in [CATALOGUE_V1, CATALOGUE_V1BETA] {
        let response = match client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => continue, // catalogue is best-effort; id-only quota from source A still stands
        };
        let Ok(parsed) = response.json::<CatalogueResponse>().await else { continue };
        for model in parsed.models {
            let id = model.name.strip_prefix("models/").unwrap_or(&model.name).to_string();
            if let Some(entry) = quota.get_mut(&id) {
                if entry.display_name.is_none() {
                    entry.display_name = model.display_name;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn antigravity_user_agent_includes_os_and_arch() {
        let ua = antigravity_user_agent();
        assert!(ua.starts_with("antigravity/"));
        assert!(ua.contains(std::env::consts::OS));
    }
}
