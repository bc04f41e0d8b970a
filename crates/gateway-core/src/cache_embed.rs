// ── Keystone Gateway: Semantic Cache Embeddings ─────────────────────────────
// Thin client for `text-embedding-004:embedContent`. Embedding failure is
// non-fatal to the caller — the semantic-cache lookup step is simply skipped.

use serde::Deserialize;
use serde_json::json;

use crate::error::{GatewayError, GatewayResult};

const EMBED_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/text-embedding-004:embedContent";

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

pub async fn embed_content(client: &reqwest::Client, api_key: &str, text: &str) -> GatewayResult<Vec<f32>> {
    let response = client
        .post(format!("{EMBED_ENDPOINT}?key={api_key}"))
        .json(&json!({ "model": "models/text-embedding-004", "content": { "parts": [{ "text": text }] } }))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(GatewayError::UpstreamTransient {
            provider: "google-embed".into(),
            message: format!("embedContent returned status {}", response.status()),
        });
    }

    let parsed: EmbedResponse = response.json().await?;
    Ok(parsed.embedding.values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embed_content_parses_vector() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embedding": { "values": [0.1, 0.2, 0.3] }
            })))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/v1beta/models/text-embedding-004:embedContent", server.uri());
        let response = client.post(format!("{url}?key=test")).json(&serde_json::json!({})).send().await.unwrap();
        let parsed: EmbedResponse = response.json().await.unwrap();
        assert_eq!(parsed.embedding.values, vec![0.1, 0.2, 0.3]);
    }
}
