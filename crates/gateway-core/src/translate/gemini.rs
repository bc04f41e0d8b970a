// ── Keystone Gateway: Gemini Request/Response Shaping ───────────────────────
// Builds the Gemini-internal `generateContent`/`streamGenerateContent`
// request body from a protocol-neutral message list, and maps a
// non-streaming Gemini response into the Anthropic `message` shape (the
// common intermediate both OpenAI and Anthropic translators flatten from).

use serde_json::{json, Value};

use crate::stream::{AnthropicStreamEvent, GeminiCandidate, GeminiStreamEvent, GeminiUsageMetadata};

/// One protocol-neutral chat turn, used as the input to Gemini request
/// building regardless of whether the caller spoke OpenAI or Anthropic.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: String,
    pub text: String,
}

/// Strips Gemini-unsupported JSON-Schema keywords from a tool's parameter
/// schema before dispatch. Grounded on `GoogleProvider::sanitize_schema`.
pub fn sanitize_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else { return schema.clone() };
    let mut cleaned = serde_json::Map::new();
    for (key, value) in obj {
        match key.as_str() {
            "additionalProperties" | "$schema" | "$ref" => continue,
            "required" if value.as_array().map(|a| a.is_empty()).unwrap_or(false) => continue,
            "properties" if value.as_object().map(|o| o.is_empty()).unwrap_or(false) => continue,
            "properties" => {
                let mut props = serde_json::Map::new();
                if let Some(map) = value.as_object() {
                    for (k, v) in map {
                        props.insert(k.clone(), sanitize_schema(v));
                    }
                }
                cleaned.insert(key.clone(), Value::Object(props));
            }
            _ => {
                cleaned.insert(key.clone(), sanitize_schema(value));
            }
        }
    }
    Value::Object(cleaned)
}

/// Builds `{contents: [...]}` for the Gemini request. Gemini requires strict
/// role alternation, so consecutive same-role turns are merged.
pub fn build_contents(turns: &[ChatTurn]) -> Vec<Value> {
    let mut contents: Vec<Value> = Vec::new();
    for turn in turns {
        let role = if turn.role == "assistant" { "model" } else { "user" };
        if let Some(last) = contents.last_mut() {
            if last["role"] == role {
                let parts = last["parts"].as_array_mut().expect("parts is always an array");
                parts.push(json!({ "text": turn.text }));
                continue;
            }
        }
        contents.push(json!({ "role": role, "parts": [{ "text": turn.text }] }));
    }
    contents
}

/// Builds the `:streamGenerateContent`/`:generateContent` request body.
/// `project_id` is the resolved cloud-code project for the dispatching
/// account (see `TokenManager::get_next`) and is sent alongside the request
/// rather than folded into it, matching the cloud-code endpoints' own
/// `project`/`request` split.
pub fn build_request(
    turns: &[ChatTurn],
    system_instruction: Option<&str>,
    tools: Option<&Value>,
    project_id: Option<&str>,
) -> Value {
    let mut body = json!({ "contents": build_contents(turns) });
    if let Some(system) = system_instruction {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    if let Some(tools) = tools {
        body["tools"] = sanitize_schema(tools);
    }
    if let Some(project_id) = project_id {
        body["project"] = json!(project_id);
    }
    body
}

/// Flattens a complete (non-streaming) Gemini response into the Anthropic
/// `message` shape. OpenAI callers further flatten this into
/// `choices[0].message.content` (see `translate::openai`).
pub fn response_to_anthropic_message(gemini_response: &Value, model: &str) -> Value {
    let candidates: Vec<GeminiCandidate> =
        serde_json::from_value(gemini_response["candidates"].clone()).unwrap_or_default();
    let usage: crate::stream::GeminiUsageMetadata =
        serde_json::from_value(gemini_response["usageMetadata"].clone()).unwrap_or_default();

    let mut content_blocks = Vec::new();
    let mut stop_reason = "end_turn";

    if let Some(candidate) = candidates.first() {
        if let Some(reason) = &candidate.finish_reason {
            stop_reason = match reason.as_str() {
                "MAX_TOKENS" => "max_tokens",
                _ => "end_turn",
            };
        }
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(call) = &part.function_call {
                    content_blocks.push(json!({
                        "type": "tool_use",
                        "id": format!("toolu_{}", content_blocks.len()),
                        "name": call.name,
                        "input": call.args
                    }));
                } else if let Some(text) = &part.text {
                    if !text.is_empty() {
                        let block_type = if part.thought.unwrap_or(false) { "thinking" } else { "text" };
                        content_blocks.push(json!({ "type": block_type, "text": text }));
                    }
                }
            }
        }
    }

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content_blocks,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.prompt_token_count,
            "output_tokens": usage.candidates_token_count,
        }
    })
}

/// Reassembles a complete Anthropic `message` from the genuine per-chunk
/// event sequence a live `:streamGenerateContent` dispatch produces (see
/// `PartProcessor::process_event`). Used both to answer non-streaming
/// callers dispatched against the streaming endpoint, and to produce the
/// text written to the semantic cache.
pub fn assemble_message_from_stream_events(
    events: &[AnthropicStreamEvent],
    model: &str,
    usage: &GeminiUsageMetadata,
) -> Value {
    let mut blocks = Vec::new();
    let mut block_type = "text";
    let mut text = String::new();
    let mut tool_name = String::new();
    let mut tool_json = String::new();
    let mut stop_reason = "end_turn";

    for event in events {
        match event {
            AnthropicStreamEvent::ContentBlockStart { content_block, .. } => {
                block_type = content_block["type"].as_str().unwrap_or("text");
                text.clear();
                tool_json.clear();
                if block_type == "tool_use" {
                    tool_name = content_block["name"].as_str().unwrap_or_default().to_string();
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { delta, .. } => {
                if let Some(t) = delta["text"].as_str() {
                    text.push_str(t);
                } else if let Some(t) = delta["thinking"].as_str() {
                    text.push_str(t);
                } else if let Some(j) = delta["partial_json"].as_str() {
                    tool_json.push_str(j);
                }
            }
            AnthropicStreamEvent::ContentBlockStop { .. } => {
                let block = match block_type {
                    "tool_use" => json!({
                        "type": "tool_use",
                        "id": format!("toolu_{}", blocks.len()),
                        "name": tool_name,
                        "input": serde_json::from_str::<Value>(&tool_json).unwrap_or_else(|_| json!({})),
                    }),
                    "thinking" => json!({ "type": "thinking", "text": text }),
                    _ => json!({ "type": "text", "text": text }),
                };
                blocks.push(block);
            }
            AnthropicStreamEvent::MessageDelta { delta, .. } => {
                if let Some(reason) = delta["stop_reason"].as_str() {
                    stop_reason = reason;
                }
            }
            _ => {}
        }
    }

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": blocks,
        "stop_reason": stop_reason,
        "usage": {
            "input_tokens": usage.prompt_token_count,
            "output_tokens": usage.candidates_token_count,
        }
    })
}

/// Parses one buffered `data: <json>` SSE line into a typed Gemini event.
pub fn parse_sse_data_line(line: &str) -> Option<GeminiStreamEvent> {
    let json_str = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let trimmed = json_str.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_schema_strips_unsupported_keywords() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "$schema": "http://json-schema.org/draft-07/schema#",
            "required": [],
            "properties": {
                "name": { "type": "string", "$ref": "#/defs/x" }
            }
        });
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("required").is_none());
        assert!(cleaned["properties"]["name"].get("$ref").is_none());
    }

    #[test]
    fn build_contents_merges_consecutive_same_role_turns() {
        let turns = vec![
            ChatTurn { role: "user".into(), text: "hi".into() },
            ChatTurn { role: "user".into(), text: "there".into() },
            ChatTurn { role: "assistant".into(), text: "hello".into() },
        ];
        let contents = build_contents(&turns);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn build_contents_maps_assistant_role_to_model() {
        let turns = vec![ChatTurn { role: "assistant".into(), text: "hi".into() }];
        let contents = build_contents(&turns);
        assert_eq!(contents[0]["role"], "model");
    }

    #[test]
    fn parse_sse_data_line_roundtrips() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#;
        let event = parse_sse_data_line(line).unwrap();
        assert_eq!(event.candidates[0].content.as_ref().unwrap().parts[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn response_to_anthropic_message_flattens_text() {
        let gemini = json!({
            "candidates": [{
                "content": { "parts": [{"text": "hi there"}] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2 }
        });
        let message = response_to_anthropic_message(&gemini, "gemini-2.5-pro");
        assert_eq!(message["content"][0]["text"], "hi there");
        assert_eq!(message["stop_reason"], "end_turn");
        assert_eq!(message["usage"]["output_tokens"], 2);
    }

    #[test]
    fn build_request_carries_tools_and_project_id() {
        let turns = vec![ChatTurn { role: "user".into(), text: "hi".into() }];
        let tools = json!([{ "name": "lookup", "parameters": { "type": "object", "additionalProperties": false } }]);
        let request = build_request(&turns, Some("be terse"), Some(&tools), Some("proj-123"));
        assert_eq!(request["project"], "proj-123");
        assert_eq!(request["tools"][0]["name"], "lookup");
        assert!(request["tools"][0]["parameters"].get("additionalProperties").is_none());
        assert_eq!(request["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn build_request_omits_project_and_tools_when_absent() {
        let turns = vec![ChatTurn { role: "user".into(), text: "hi".into() }];
        let request = build_request(&turns, None, None, None);
        assert!(request.get("project").is_none());
        assert!(request.get("tools").is_none());
    }

    #[test]
    fn assemble_message_from_stream_events_joins_deltas_across_chunks() {
        let mut processor = crate::stream::PartProcessor::default();
        let mut events = processor.process_event(&GeminiStreamEvent {
            candidates: vec![GeminiCandidate {
                content: Some(crate::stream::GeminiContent {
                    parts: vec![crate::stream::GeminiPart {
                        text: Some("Hello".into()),
                        thought: Some(false),
                        function_call: None,
                        executable_code: None,
                    }],
                }),
                finish_reason: None,
                safety_ratings: vec![],
            }],
            usage_metadata: None,
        });
        events.extend(processor.process_event(&GeminiStreamEvent {
            candidates: vec![GeminiCandidate {
                content: Some(crate::stream::GeminiContent {
                    parts: vec![crate::stream::GeminiPart {
                        text: Some(" world".into()),
                        thought: Some(false),
                        function_call: None,
                        executable_code: None,
                    }],
                }),
                finish_reason: Some("STOP".into()),
                safety_ratings: vec![],
            }],
            usage_metadata: Some(GeminiUsageMetadata { prompt_token_count: 1, candidates_token_count: 2 }),
        }));
        events.extend(processor.finish().unwrap());

        let message = assemble_message_from_stream_events(&events, "gemini-2.5-pro", &processor.usage);
        assert_eq!(message["content"][0]["text"], "Hello world");
        assert_eq!(message["stop_reason"], "end_turn");
        assert_eq!(message["usage"]["output_tokens"], 2);
    }
}
