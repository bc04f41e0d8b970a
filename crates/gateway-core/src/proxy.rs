// ── Keystone Gateway: Proxy / Translator ────────────────────────────────────
// The per-request dispatch algorithm: model alias mapping, the
// three-attempt retry loop, local-vs-cloud dispatch, semantic-cache
// short-circuit, and 429-pattern-triggered cooldown-and-continue.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use serde_json::Value;

use crate::cache_embed;
use crate::error::{GatewayError, GatewayResult};
use crate::providers::local;
use crate::store::cache::{prompt_hash, DEFAULT_SIMILARITY_THRESHOLD};
use crate::store::Store;
use crate::stream::{AnthropicStreamEvent, GeminiUsageMetadata, PartProcessor};
use crate::token_manager::TokenManager;
use crate::translate::{self, gemini::ChatTurn};
use crate::types::{Account, CacheEntry};

const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

pub struct Proxy {
    pub store: Arc<Store>,
    pub token_manager: Arc<TokenManager>,
    pub http_client: reqwest::Client,
    pub refresher: Arc<dyn crate::token_manager::TokenRefresher>,
    pub google_api_key: Option<String>,
    /// Base URL for the Gemini cloud-code endpoint. Overridable so tests can
    /// point it at a mock server; production leaves this at
    /// [`DEFAULT_GEMINI_BASE_URL`].
    pub gemini_base_url: String,
}

impl Proxy {
    pub fn new(
        store: Arc<Store>,
        token_manager: Arc<TokenManager>,
        http_client: reqwest::Client,
        refresher: Arc<dyn crate::token_manager::TokenRefresher>,
        google_api_key: Option<String>,
    ) -> Self {
        Proxy {
            store,
            token_manager,
            http_client,
            refresher,
            google_api_key,
            gemini_base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
        }
    }
}

/// What the caller gets back from one logical request: either a fully
/// materialized response body, or an SSE frame sequence to forward verbatim.
pub enum ProxyOutcome {
    Complete(Value),
    Stream(Vec<String>),
}

impl Proxy {
    /// OpenAI-protocol entry point.
    pub async fn handle_openai_chat(&self, body: Value) -> GatewayResult<ProxyOutcome> {
        let parsed = translate::openai::parse_request(&body);
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        let tools = body.get("tools").filter(|t| !t.is_null());
        let outcome = self.dispatch(&parsed.model, &parsed.turns, None, tools, &messages).await?;
        Ok(match outcome {
            DispatchResult::Complete(anthropic_message, model) => {
                let flattened = translate::openai::response_from_anthropic_message(&anthropic_message, &model);
                if parsed.stream {
                    let content = flattened["choices"][0]["message"]["content"].as_str().unwrap_or_default();
                    let finish_reason = flattened["choices"][0]["finish_reason"].as_str();
                    ProxyOutcome::Stream(vec![
                        crate::stream::openai_chunk("resp", &model, Some(content), finish_reason),
                        crate::stream::OPENAI_DONE.to_string(),
                    ])
                } else {
                    ProxyOutcome::Complete(flattened)
                }
            }
            DispatchResult::CacheHit(text, model) => {
                if parsed.stream {
                    ProxyOutcome::Stream(translate::openai::synthetic_cache_stream(&text, &model))
                } else {
                    ProxyOutcome::Complete(translate::openai::synthetic_cache_response(&text, &model))
                }
            }
            DispatchResult::Streamed(events, message, model) => {
                if parsed.stream {
                    ProxyOutcome::Stream(translate::openai::stream_events_to_chunks(&events, &model))
                } else {
                    ProxyOutcome::Complete(translate::openai::response_from_anthropic_message(&message, &model))
                }
            }
        })
    }

    /// Anthropic-protocol entry point.
    pub async fn handle_anthropic_messages(&self, body: Value) -> GatewayResult<ProxyOutcome> {
        let parsed = translate::anthropic::parse_request(&body);
        let messages = body["messages"].as_array().cloned().unwrap_or_default();
        let tools = body.get("tools").filter(|t| !t.is_null());
        let outcome = self
            .dispatch(&parsed.model, &parsed.turns, parsed.system.as_deref(), tools, &messages)
            .await?;
        Ok(match outcome {
            DispatchResult::Complete(anthropic_message, _model) => {
                if parsed.stream {
                    let events = translate::anthropic::message_to_stream_events(&anthropic_message);
                    ProxyOutcome::Stream(events.iter().map(|e| e.to_sse()).collect())
                } else {
                    ProxyOutcome::Complete(anthropic_message)
                }
            }
            DispatchResult::CacheHit(text, model) => {
                if parsed.stream {
                    let events = translate::anthropic::synthetic_cache_stream(&text, &model);
                    ProxyOutcome::Stream(events.iter().map(|e| e.to_sse()).collect())
                } else {
                    ProxyOutcome::Complete(translate::anthropic::synthetic_cache_response(&text, &model))
                }
            }
            DispatchResult::Streamed(events, message, _model) => {
                if parsed.stream {
                    let message_start = AnthropicStreamEvent::MessageStart {
                        message: serde_json::json!({
                            "id": message["id"],
                            "type": "message",
                            "role": "assistant",
                            "model": message["model"],
                            "content": [],
                            "usage": { "input_tokens": message["usage"]["input_tokens"], "output_tokens": 0 }
                        }),
                    };
                    ProxyOutcome::Stream(std::iter::once(&message_start).chain(events.iter()).map(|e| e.to_sse()).collect())
                } else {
                    ProxyOutcome::Complete(message)
                }
            }
        })
    }

    async fn dispatch(
        &self,
        requested_model: &str,
        turns: &[ChatTurn],
        system: Option<&str>,
        tools: Option<&Value>,
        raw_messages: &[Value],
    ) -> GatewayResult<DispatchResult> {
        let mut last_err = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(crate::http::retry_delay_ms(attempt))).await;
            }
            let Some(account) = self.token_manager.get_next(Some(requested_model), self.refresher.as_ref())?
            else {
                return Err(GatewayError::NoAccount { model: requested_model.to_string() });
            };
            let _ = self.store.update_last_used(&account.id, now());

            match self.dispatch_once(&account, requested_model, turns, system, tools, raw_messages).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let message = e.to_string();
                    if GatewayError::is_rate_limited_shaped(&message) {
                        self.token_manager.mark_rate_limited(&account.email);
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or(GatewayError::NoAccount { model: requested_model.to_string() }))
    }

    async fn dispatch_once(
        &self,
        account: &Account,
        requested_model: &str,
        turns: &[ChatTurn],
        system: Option<&str>,
        tools: Option<&Value>,
        raw_messages: &[Value],
    ) -> GatewayResult<DispatchResult> {
        if account.provider.is_local() {
            let base_url = account.local_base_url().unwrap_or_default();
            let model = account.local_model().unwrap_or(requested_model);
            let body = serde_json::json!({
                "model": model,
                "messages": raw_messages,
            });
            let response = local::chat_completions(&self.http_client, base_url, &body).await?;
            let anthropic_message = translate::openai::response_to_anthropic_message(&response, model);
            return Ok(DispatchResult::Complete(anthropic_message, model.to_string()));
        }

        let upstream_model = translate::map_model_alias(requested_model);

        if let Some(prompt) = translate::extract_last_user_text(raw_messages) {
            if let Some(cached) = self.store.cache_find_exact(&prompt)? {
                return Ok(DispatchResult::CacheHit(cached, upstream_model));
            }
            if let Some(api_key) = &self.google_api_key {
                if let Ok(embedding) = cache_embed::embed_content(&self.http_client, api_key, &prompt).await {
                    if let Some(cached) = self.store.cache_find_semantic(&embedding, DEFAULT_SIMILARITY_THRESHOLD)? {
                        return Ok(DispatchResult::CacheHit(cached, upstream_model));
                    }
                }
            }
        }

        let gemini_request = crate::translate::gemini::build_request(turns, system, tools, account.token.project_id.as_deref());
        let url = format!("{}/v1internal/models/{upstream_model}:streamGenerateContent?alt=sse", self.gemini_base_url);
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&account.token.access_token)
            .json(&gemini_request)
            .send()
            .await?;

        let status = response.status();
        if status == 401 || status == 403 {
            return Err(GatewayError::UpstreamAuth {
                provider: "google".into(),
                message: format!("status {status}"),
            });
        }
        if status == 429 {
            return Err(GatewayError::UpstreamRateLimit {
                provider: "google".into(),
                message: "429".into(),
                retry_after_secs: None,
            });
        }
        if !status.is_success() {
            return Err(GatewayError::UpstreamTransient {
                provider: "google".into(),
                message: format!("status {status}"),
            });
        }

        let (events, usage) = consume_gemini_stream(response).await?;
        let anthropic_message = crate::translate::gemini::assemble_message_from_stream_events(&events, &upstream_model, &usage);

        if let Some(prompt) = translate::extract_last_user_text(raw_messages) {
            let response_text = anthropic_message["content"]
                .as_array()
                .map(|blocks| {
                    blocks.iter().filter(|b| b["type"] == "text").filter_map(|b| b["text"].as_str()).collect::<Vec<_>>().join("")
                })
                .unwrap_or_default();
            if !response_text.is_empty() {
                let entry = CacheEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    prompt_hash: prompt_hash(&prompt),
                    prompt_text: prompt.clone(),
                    embedding: vec![],
                    response_text,
                    model: upstream_model.clone(),
                    created_at: now(),
                };
                if let Err(e) = self.store.cache_save(&entry) {
                    log::warn!("cache write failed (non-fatal): {e}");
                }
            }
        }

        Ok(DispatchResult::Streamed(events, anthropic_message, upstream_model))
    }
}

/// Reads a `:streamGenerateContent?alt=sse` response body incrementally,
/// feeding each `data:` line through [`PartProcessor`] as it arrives rather
/// than buffering the whole response first.
async fn consume_gemini_stream(
    response: reqwest::Response,
) -> GatewayResult<(Vec<AnthropicStreamEvent>, GeminiUsageMetadata)> {
    let mut byte_stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut processor = PartProcessor::default();
    let mut events = Vec::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            if let Some(event) = crate::translate::gemini::parse_sse_data_line(&line) {
                events.extend(processor.process_event(&event));
            }
        }
    }

    let finish_events = processor.finish().map_err(|_| GatewayError::EmptyStream)?;
    events.extend(finish_events);
    Ok((events, processor.usage.clone()))
}

enum DispatchResult {
    Complete(Value, String),
    CacheHit(String, String),
    /// Genuine per-chunk stream events from a live Gemini dispatch, plus the
    /// message assembled from them. Carries both so either a streaming or a
    /// non-streaming caller can be answered without re-dispatching.
    Streamed(Vec<AnthropicStreamEvent>, Value, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_manager::{RefreshedToken, TokenRefresher};
    use crate::types::{AccountStatus, Provider, TokenRecord};
    use std::collections::HashMap;

    struct NoopRefresher;
    impl TokenRefresher for NoopRefresher {
        fn refresh(&self, _a: &Account) -> GatewayResult<RefreshedToken> {
            Err("no refresh in test".into())
        }
        fn fetch_project_id(&self, _a: &Account) -> GatewayResult<Option<String>> {
            Ok(None)
        }
    }

    fn local_account(id: &str, base_url: &str, model: &str) -> Account {
        Account {
            id: id.into(),
            provider: Provider::LocalOllama,
            email: format!("{id}@x.com"),
            name: None,
            avatar_url: None,
            token: TokenRecord {
                access_token: "unused".into(),
                refresh_token: base_url.into(),
                expires_in: 0,
                expiry_timestamp: now() + 100_000,
                token_type: "none".into(),
                project_id: Some(model.into()),
                session_id: None,
                extra: HashMap::new(),
            },
            quota: None,
            created_at: 0,
            last_used: 0,
            status: AccountStatus::Active,
            is_active: true,
            selected_models: vec![],
        }
    }

    #[tokio::test]
    async fn local_provider_response_is_translated_to_anthropic_shape() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/v1/chat/completions"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "echoed content"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let store = Arc::new(Store::open_in_memory().unwrap());
        store.add(&local_account("local1", &server.uri(), "llama3")).unwrap();
        let token_manager = Arc::new(TokenManager::new(store.clone()));
        token_manager.load().unwrap();

        let proxy = Proxy::new(store.clone(), token_manager, reqwest::Client::new(), Arc::new(NoopRefresher), None);

        let request = serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let outcome = proxy.handle_openai_chat(request).await.unwrap();
        match outcome {
            ProxyOutcome::Complete(value) => {
                assert_eq!(value["choices"][0]["message"]["content"], "echoed content");
            }
            ProxyOutcome::Stream(_) => panic!("expected a complete response"),
        }
    }

    #[tokio::test]
    async fn local_provider_streaming_request_yields_sse() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/v1/chat/completions"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "echoed content"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let store = Arc::new(Store::open_in_memory().unwrap());
        store.add(&local_account("local1", &server.uri(), "llama3")).unwrap();
        let token_manager = Arc::new(TokenManager::new(store.clone()));
        token_manager.load().unwrap();

        let proxy = Proxy::new(store.clone(), token_manager, reqwest::Client::new(), Arc::new(NoopRefresher), None);

        let request = serde_json::json!({
            "model": "gpt-4",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let outcome = proxy.handle_openai_chat(request).await.unwrap();
        match outcome {
            ProxyOutcome::Stream(frames) => {
                assert!(frames.iter().any(|f| f.contains("echoed content")));
                assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
            }
            ProxyOutcome::Complete(_) => panic!("expected a streamed response"),
        }

        let anthropic_request = serde_json::json!({
            "model": "claude-3-sonnet",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let outcome = proxy.handle_anthropic_messages(anthropic_request).await.unwrap();
        match outcome {
            ProxyOutcome::Stream(frames) => {
                assert!(frames.iter().any(|f| f.contains("echoed content")));
                assert!(frames.iter().any(|f| f.contains("message_stop")));
            }
            ProxyOutcome::Complete(_) => panic!("expected a streamed response"),
        }
    }

    #[tokio::test]
    async fn no_accounts_yields_no_account_error() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let token_manager = Arc::new(TokenManager::new(store.clone()));
        let proxy = Proxy::new(store, token_manager, reqwest::Client::new(), Arc::new(NoopRefresher), None);
        let request = serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
        let result = proxy.handle_openai_chat(request).await;
        assert!(matches!(result, Err(GatewayError::NoAccount { .. })));
    }
}
