// ── Keystone Gateway: Local Provider Client ─────────────────────────────────
// OpenAI-compatible dispatch to a local Ollama/LM Studio server. Local
// accounts overload `refresh_token`/`project_id` to carry base URL/model id
// (see `Account::local_base_url`/`local_model`); there is no OAuth flow.

use futures::Stream;
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

/// Non-streaming chat-completion call against `<base_url>/v1/chat/completions`.
/// `body` is the already-shaped OpenAI request (model id substituted with
/// the account's local model).
pub async fn chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    body: &Value,
) -> GatewayResult<Value> {
    let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(body)
        .timeout(std::time::Duration::from_secs(120))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(GatewayError::UpstreamTransient {
            provider: "local".into(),
            message: format!("local provider returned {status}: {text}"),
        });
    }
    Ok(response.json().await?)
}

/// Streaming variant: returns the raw SSE byte stream for the caller to
/// forward line-by-line (local providers already speak OpenAI-shaped SSE, so
/// no translation is needed beyond pass-through).
pub async fn chat_completions_stream(
    client: &reqwest::Client,
    base_url: &str,
    body: &Value,
) -> GatewayResult<impl Stream<Item = reqwest::Result<bytes::Bytes>>> {
    let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(body)
        .timeout(std::time::Duration::from_secs(120))
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        return Err(GatewayError::UpstreamTransient {
            provider: "local".into(),
            message: format!("local provider returned {status}"),
        });
    }
    Ok(response.bytes_stream())
}

/// `GET <base_url>/v1/models` for model-listing supplementation.
pub async fn list_models(client: &reqwest::Client, base_url: &str) -> GatewayResult<Vec<String>> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let response = client.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(GatewayError::UpstreamTransient {
            provider: "local".into(),
            message: format!("local provider model listing returned {}", response.status()),
        });
    }
    let parsed: Value = response.json().await?;
    let ids = parsed["data"]
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m["id"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chat_completions_surfaces_non_success_status() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/v1/chat/completions"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = chat_completions(&client, &server.uri(), &serde_json::json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn chat_completions_returns_parsed_body_on_success() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/v1/chat/completions"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "hi"}}]
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = chat_completions(&client, &server.uri(), &serde_json::json!({"model": "llama3"})).await.unwrap();
        assert_eq!(result["choices"][0]["message"]["content"], "hi");
    }
}
