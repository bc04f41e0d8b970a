// ── Keystone Gateway: OpenAI Protocol Shaping ───────────────────────────────
// Parses an inbound `/v1/chat/completions` body into protocol-neutral turns,
// and flattens the Anthropic intermediate (see `translate::gemini`) into the
// OpenAI `chat.completion` response shape.

use serde_json::{json, Value};

use crate::stream::{openai_chunk, AnthropicStreamEvent, OPENAI_DONE};
use crate::translate::gemini::ChatTurn;

pub struct ParsedRequest {
    pub model: String,
    pub turns: Vec<ChatTurn>,
    pub stream: bool,
}

pub fn parse_request(body: &Value) -> ParsedRequest {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let stream = body["stream"].as_bool().unwrap_or(false);
    let turns = body["messages"]
        .as_array()
        .map(|messages| {
            messages
                .iter()
                .filter(|m| m["role"] != "system")
                .map(|m| ChatTurn {
                    role: m["role"].as_str().unwrap_or("user").to_string(),
                    text: m["content"].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    ParsedRequest { model, turns, stream }
}

/// Flattens an Anthropic-shaped message (see
/// `translate::gemini::response_to_anthropic_message`) into
/// `choices[0].message.content`.
pub fn response_from_anthropic_message(anthropic_message: &Value, model: &str) -> Value {
    let content = anthropic_message["content"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b["type"] == "text")
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let finish_reason = match anthropic_message["stop_reason"].as_str() {
        Some("max_tokens") => "length",
        _ => "stop",
    };

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": anthropic_message["usage"]["input_tokens"],
            "completion_tokens": anthropic_message["usage"]["output_tokens"],
        }
    })
}

/// Lifts an OpenAI-shaped `chat.completion` response (as returned verbatim by
/// a local Ollama/LM Studio server) into the Anthropic intermediate message
/// shape, so local-provider dispatch can flow through the same
/// stream-or-complete handling as every other provider instead of being
/// handed back to callers untranslated.
pub fn response_to_anthropic_message(openai_response: &Value, model: &str) -> Value {
    let choice = &openai_response["choices"][0];
    let content = choice["message"]["content"].as_str().unwrap_or_default();
    let stop_reason = match choice["finish_reason"].as_str() {
        Some("length") => "max_tokens",
        _ => "end_turn",
    };

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": content }],
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": openai_response["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "output_tokens": openai_response["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        }
    })
}

/// Converts a genuine per-chunk Anthropic stream (a live Gemini dispatch's
/// real event sequence, as opposed to a synthesized one) into OpenAI chunk
/// frames: one chunk per text/thinking delta, then a terminal chunk carrying
/// `finish_reason`, then the `[DONE]` sentinel.
pub fn stream_events_to_chunks(events: &[AnthropicStreamEvent], model: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut finish_reason = "stop";
    for event in events {
        match event {
            AnthropicStreamEvent::ContentBlockDelta { delta, .. } => {
                let text = delta["text"].as_str().or_else(|| delta["thinking"].as_str());
                if let Some(text) = text {
                    frames.push(openai_chunk("resp", model, Some(text), None));
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, .. } => {
                finish_reason = match delta["stop_reason"].as_str() {
                    Some("max_tokens") => "length",
                    _ => "stop",
                };
            }
            _ => {}
        }
    }
    frames.push(openai_chunk("resp", model, None, Some(finish_reason)));
    frames.push(OPENAI_DONE.to_string());
    frames
}

/// A full synthetic response for a semantic-cache hit, non-streaming shape.
pub fn synthetic_cache_response(content: &str, model: &str) -> Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }]
    })
}

/// The SSE frame sequence for a semantic-cache hit on a streaming request:
/// one chunk carrying the full cached content, then the `[DONE]` sentinel.
pub fn synthetic_cache_stream(content: &str, model: &str) -> Vec<String> {
    vec![openai_chunk("cache-hit", model, Some(content), Some("stop")), OPENAI_DONE.to_string()]
}
