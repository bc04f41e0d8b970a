// ── Keystone Gateway: Anthropic Protocol Shaping ────────────────────────────
// Parses an inbound `/v1/messages` body into protocol-neutral turns, and
// builds the full Anthropic SSE event sequence for both real upstream
// translation and synthetic cache-hit responses.

use serde_json::{json, Value};

use crate::stream::AnthropicStreamEvent;
use crate::translate::gemini::ChatTurn;

pub struct ParsedRequest {
    pub model: String,
    pub system: Option<String>,
    pub turns: Vec<ChatTurn>,
    pub stream: bool,
}

pub fn parse_request(body: &Value) -> ParsedRequest {
    let model = body["model"].as_str().unwrap_or_default().to_string();
    let stream = body["stream"].as_bool().unwrap_or(false);
    let system = body["system"].as_str().map(str::to_string);
    let turns = body["messages"]
        .as_array()
        .map(|messages| {
            messages
                .iter()
                .map(|m| ChatTurn {
                    role: m["role"].as_str().unwrap_or("user").to_string(),
                    text: content_text(&m["content"]),
                })
                .collect()
        })
        .unwrap_or_default();
    ParsedRequest { model, system, turns, stream }
}

fn content_text(content: &Value) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    content
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| b["text"].as_str())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Marks the second-to-last user turn, plus the system/tools prefix, with
/// `cache_control: ephemeral`. Grounded on
/// `AnthropicProvider::add_turn_cache_breakpoints`; applies when the
/// outbound request targets an Anthropic-shaped upstream (a direct Anthropic
/// account, or re-wrapping for an Anthropic-speaking local account).
pub fn add_cache_breakpoints(mut request: Value) -> Value {
    if let Some(system) = request.get_mut("system") {
        *system = json!([{ "type": "text", "text": system.as_str().unwrap_or_default(), "cache_control": { "type": "ephemeral" } }]);
    }
    if let Some(messages) = request["messages"].as_array_mut() {
        let user_indices: Vec<usize> =
            messages.iter().enumerate().filter(|(_, m)| m["role"] == "user").map(|(i, _)| i).collect();
        if user_indices.len() >= 2 {
            let target = user_indices[user_indices.len() - 2];
            if let Some(content) = messages[target]["content"].as_str() {
                let content = content.to_string();
                messages[target]["content"] =
                    json!([{ "type": "text", "text": content, "cache_control": { "type": "ephemeral" } }]);
            }
        }
    }
    request
}

/// Full non-streaming event sequence flattened to a single `message` object
/// is just `translate::gemini::response_to_anthropic_message` — callers use
/// that directly. This module only adds the streaming event sequence.

/// Builds the full streaming event sequence for a synthetic cache-hit
/// response: `message_start -> content_block_start -> content_block_delta ->
/// content_block_stop -> message_delta -> message_stop`.
pub fn synthetic_cache_stream(content: &str, model: &str) -> Vec<AnthropicStreamEvent> {
    vec![
        AnthropicStreamEvent::MessageStart {
            message: json!({
                "id": format!("msg_{}", uuid::Uuid::new_v4()),
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "usage": { "input_tokens": 0, "output_tokens": 0 }
            }),
        },
        AnthropicStreamEvent::ContentBlockStart { index: 0, content_block: json!({"type": "text", "text": ""}) },
        AnthropicStreamEvent::ContentBlockDelta {
            index: 0,
            delta: json!({ "type": "text_delta", "text": content }),
        },
        AnthropicStreamEvent::ContentBlockStop { index: 0 },
        AnthropicStreamEvent::MessageDelta {
            delta: json!({ "stop_reason": "end_turn" }),
            usage: json!({ "output_tokens": content.split_whitespace().count() }),
        },
        AnthropicStreamEvent::MessageStop,
    ]
}

/// Re-emits an already-complete Anthropic `message` (e.g. from
/// `translate::gemini::response_to_anthropic_message`) as the full SSE event
/// sequence, for callers that requested `stream=true` against a path that
/// only produced a complete response. One block-open/delta/block-close per
/// content block, in order, followed by the terminal events.
pub fn message_to_stream_events(message: &Value) -> Vec<AnthropicStreamEvent> {
    let mut events = vec![AnthropicStreamEvent::MessageStart {
        message: json!({
            "id": message["id"],
            "type": "message",
            "role": "assistant",
            "model": message["model"],
            "content": [],
            "usage": { "input_tokens": message["usage"]["input_tokens"], "output_tokens": 0 }
        }),
    }];

    if let Some(blocks) = message["content"].as_array() {
        for (index, block) in blocks.iter().enumerate() {
            events.push(AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: json!({ "type": block["type"], "text": "" }),
            });
            let delta = match block["type"].as_str() {
                Some("tool_use") => json!({ "type": "input_json_delta", "partial_json": block["input"].to_string() }),
                Some("thinking") => json!({ "type": "thinking_delta", "thinking": block["text"] }),
                _ => json!({ "type": "text_delta", "text": block["text"] }),
            };
            events.push(AnthropicStreamEvent::ContentBlockDelta { index, delta });
            events.push(AnthropicStreamEvent::ContentBlockStop { index });
        }
    }

    events.push(AnthropicStreamEvent::MessageDelta {
        delta: json!({ "stop_reason": message["stop_reason"] }),
        usage: json!({ "output_tokens": message["usage"]["output_tokens"] }),
    });
    events.push(AnthropicStreamEvent::MessageStop);
    events
}

pub fn synthetic_cache_response(content: &str, model: &str) -> Value {
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": content }],
        "stop_reason": "end_turn",
        "usage": { "input_tokens": 0, "output_tokens": content.split_whitespace().count() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_system_and_turns() {
        let body = json!({
            "model": "claude-3-sonnet",
            "system": "be terse",
            "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let parsed = parse_request(&body);
        assert_eq!(parsed.system.as_deref(), Some("be terse"));
        assert_eq!(parsed.turns[0].text, "hi");
    }

    #[test]
    fn cache_breakpoints_mark_second_to_last_user_turn() {
        let request = json!({
            "system": "be terse",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        });
        let marked = add_cache_breakpoints(request);
        assert_eq!(marked["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(marked["messages"][0]["content"][0]["cache_control"]["type"], "ephemeral");
        assert!(marked["messages"][2]["content"].is_string());
    }

    #[test]
    fn message_to_stream_events_opens_and_closes_each_block() {
        let message = json!({
            "id": "msg_1", "model": "gemini-2.5-pro",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        });
        let events = message_to_stream_events(&message);
        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], AnthropicStreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[3], AnthropicStreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events.last(), Some(AnthropicStreamEvent::MessageStop)));
    }

    #[test]
    fn synthetic_cache_stream_matches_s5_event_sequence_shape() {
        let events = synthetic_cache_stream("hello", "claude-3-sonnet");
        assert!(matches!(events[0], AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], AnthropicStreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], AnthropicStreamEvent::ContentBlockDelta { index: 0, .. }));
        assert!(matches!(events[3], AnthropicStreamEvent::ContentBlockStop { index: 0 }));
        assert!(matches!(events[4], AnthropicStreamEvent::MessageDelta { .. }));
        assert!(matches!(events[5], AnthropicStreamEvent::MessageStop));
    }
}
