// ── Keystone Gateway: SSE Event Model & Part Processor ──────────────────────
// Explicit tagged-union event types rather than free-form maps, so a
// malformed event shape is a compile error, not a runtime surprise.
// `PartProcessor` is the small state machine that turns a sequence of
// Gemini `parts` into Anthropic content-block boundary events.

use serde::{Deserialize, Serialize};

/// What kind of content block is currently open, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    None,
    Text,
    Thinking,
    ToolUse,
}

/// One raw Gemini `parts[i]` entry, as received over SSE.
#[derive(Debug, Clone, Deserialize)]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: Option<bool>,
    #[serde(default, rename = "functionCall")]
    pub function_call: Option<GeminiFunctionCall>,
    #[serde(default, rename = "executableCode")]
    pub executable_code: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default, rename = "finishReason")]
    pub finish_reason: Option<String>,
    #[serde(default, rename = "safetyRatings")]
    pub safety_ratings: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GeminiUsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    pub prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    pub candidates_token_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiStreamEvent {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default, rename = "usageMetadata")]
    pub usage_metadata: Option<GeminiUsageMetadata>,
}

/// Anthropic Messages-API streaming events, named after the wire event type.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: serde_json::Value },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: usize, content_block: serde_json::Value },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: serde_json::Value },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta { delta: serde_json::Value, usage: serde_json::Value },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
}

impl AnthropicStreamEvent {
    /// Renders as a two-line SSE frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        let event_name = match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
            AnthropicStreamEvent::Error { .. } => "error",
        };
        let payload = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {event_name}\ndata: {payload}\n\n")
    }
}

/// Tracks the currently open content block and its index while walking a
/// sequence of Gemini `parts`, emitting the Anthropic content-block events
/// at the right open/close boundaries: `none -> text -> thinking -> text ->
/// toolUse -> ...`.
pub struct PartProcessor {
    current: BlockKind,
    next_index: usize,
    current_index: usize,
    pub received_any_event: bool,
    pub last_finish_reason: Option<String>,
    pub usage: GeminiUsageMetadata,
}

impl Default for PartProcessor {
    fn default() -> Self {
        PartProcessor {
            current: BlockKind::None,
            next_index: 0,
            current_index: 0,
            received_any_event: false,
            last_finish_reason: None,
            usage: GeminiUsageMetadata::default(),
        }
    }
}

impl PartProcessor {
    fn close_current(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        if self.current != BlockKind::None {
            out.push(AnthropicStreamEvent::ContentBlockStop { index: self.current_index });
            self.current = BlockKind::None;
        }
    }

    fn open(&mut self, kind: BlockKind, content_block: serde_json::Value, out: &mut Vec<AnthropicStreamEvent>) {
        if self.current == kind {
            return;
        }
        self.close_current(out);
        self.current_index = self.next_index;
        self.next_index += 1;
        self.current = kind;
        out.push(AnthropicStreamEvent::ContentBlockStart { index: self.current_index, content_block });
    }

    /// Processes one parsed Gemini event, returning the Anthropic events it
    /// produces. Safety/block-reason finish reasons are surfaced as a
    /// visible text chunk rather than silently dropped.
    pub fn process_event(&mut self, event: &GeminiStreamEvent) -> Vec<AnthropicStreamEvent> {
        self.received_any_event = true;
        let mut out = Vec::new();

        if let Some(usage) = &event.usage_metadata {
            self.usage = usage.clone();
        }

        let Some(candidate) = event.candidates.first() else {
            return out;
        };

        if let Some(reason) = &candidate.finish_reason {
            self.last_finish_reason = Some(reason.clone());
            if matches!(
                reason.as_str(),
                "SAFETY" | "RECITATION" | "MAX_TOKENS" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII"
            ) {
                self.open(BlockKind::Text, serde_json::json!({"type": "text", "text": ""}), &mut out);
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: self.current_index,
                    delta: serde_json::json!({
                        "type": "text_delta",
                        "text": format!("\n[response blocked: {reason}]")
                    }),
                });
            }
        }

        let Some(content) = &candidate.content else { return out };

        for part in &content.parts {
            if let Some(function_call) = &part.function_call {
                self.open(
                    BlockKind::ToolUse,
                    serde_json::json!({
                        "type": "tool_use",
                        "id": format!("toolu_{}", self.next_index),
                        "name": function_call.name,
                        "input": {}
                    }),
                    &mut out,
                );
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: self.current_index,
                    delta: serde_json::json!({
                        "type": "input_json_delta",
                        "partial_json": function_call.args.to_string()
                    }),
                });
                continue;
            }

            if let Some(text) = &part.text {
                if text.is_empty() {
                    continue;
                }
                let is_thinking = part.thought.unwrap_or(false);
                let kind = if is_thinking { BlockKind::Thinking } else { BlockKind::Text };
                let block_type = if is_thinking { "thinking" } else { "text" };
                self.open(kind, serde_json::json!({"type": block_type}), &mut out);
                let delta_type = if is_thinking { "thinking_delta" } else { "text_delta" };
                let text_key = if is_thinking { "thinking" } else { "text" };
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: self.current_index,
                    delta: serde_json::json!({ "type": delta_type, text_key: text }),
                });
            }
        }

        out
    }

    /// Terminal events once the upstream stream ends. Returns `Err` (to be
    /// surfaced as `EmptyStream`, retriable by the outer loop) if no event
    /// was ever received.
    pub fn finish(&mut self) -> Result<Vec<AnthropicStreamEvent>, &'static str> {
        if !self.received_any_event {
            return Err("Empty response stream");
        }
        let mut out = Vec::new();
        self.close_current(&mut out);

        let stop_reason = match self.last_finish_reason.as_deref() {
            Some("MAX_TOKENS") => "max_tokens",
            Some("STOP") | None => "end_turn",
            Some(_) => "end_turn",
        };
        out.push(AnthropicStreamEvent::MessageDelta {
            delta: serde_json::json!({ "stop_reason": stop_reason }),
            usage: serde_json::json!({ "output_tokens": self.usage.candidates_token_count }),
        });
        out.push(AnthropicStreamEvent::MessageStop);
        Ok(out)
    }
}

/// OpenAI-flavoured streaming is simpler: one chunk per text delta, a
/// terminal chunk carrying `finish_reason`, then a literal `data: [DONE]`.
pub fn openai_chunk(id: &str, model: &str, delta_content: Option<&str>, finish_reason: Option<&str>) -> String {
    let chunk = serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta_content.map(|c| serde_json::json!({"content": c})).unwrap_or(serde_json::json!({})),
            "finish_reason": finish_reason,
        }]
    });
    format!("data: {chunk}\n\n")
}

pub const OPENAI_DONE: &str = "data: [DONE]\n\n";

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(text: &str, thought: bool) -> GeminiStreamEvent {
        GeminiStreamEvent {
            candidates: vec![GeminiCandidate {
                content: Some(GeminiContent {
                    parts: vec![GeminiPart {
                        text: Some(text.to_string()),
                        thought: Some(thought),
                        function_call: None,
                        executable_code: None,
                    }],
                }),
                finish_reason: None,
                safety_ratings: vec![],
            }],
            usage_metadata: None,
        }
    }

    #[test]
    fn zero_events_then_finish_is_empty_stream_error() {
        let mut processor = PartProcessor::default();
        assert_eq!(processor.finish(), Err("Empty response stream"));
    }

    #[test]
    fn s5_anthropic_translation_matches_scenario() {
        let mut processor = PartProcessor::default();
        let mut events = processor.process_event(&text_event("Hello", false));
        events.extend(processor.process_event(&GeminiStreamEvent {
            candidates: vec![GeminiCandidate {
                content: Some(GeminiContent {
                    parts: vec![GeminiPart { text: Some(" world".into()), thought: Some(false), function_call: None, executable_code: None }],
                }),
                finish_reason: Some("STOP".into()),
                safety_ratings: vec![],
            }],
            usage_metadata: Some(GeminiUsageMetadata { prompt_token_count: 1, candidates_token_count: 2 }),
        }));
        events.extend(processor.finish().unwrap());

        let text_deltas: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                AnthropicStreamEvent::ContentBlockDelta { delta, .. } => delta["text"].as_str().map(String::from),
                _ => None,
            })
            .collect();
        assert_eq!(text_deltas.join(""), "Hello world");

        assert!(matches!(events.first(), Some(AnthropicStreamEvent::ContentBlockStart { index: 0, .. })));
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockStop { index: 0 })));
        assert!(events.iter().any(|e| matches!(
            e,
            AnthropicStreamEvent::MessageDelta { usage, .. } if usage["output_tokens"] == 2
        )));
        assert_eq!(events.last(), Some(&AnthropicStreamEvent::MessageStop));
    }

    #[test]
    fn thinking_then_text_opens_two_blocks() {
        let mut processor = PartProcessor::default();
        processor.process_event(&text_event("pondering", true));
        let events = processor.process_event(&text_event("answer", false));
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockStop { index: 0 })));
        assert!(events.iter().any(|e| matches!(e, AnthropicStreamEvent::ContentBlockStart { index: 1, .. })));
    }

    #[test]
    fn safety_finish_reason_emits_visible_text() {
        let mut processor = PartProcessor::default();
        let event = GeminiStreamEvent {
            candidates: vec![GeminiCandidate {
                content: None,
                finish_reason: Some("SAFETY".into()),
                safety_ratings: vec![],
            }],
            usage_metadata: None,
        };
        let events = processor.process_event(&event);
        assert!(events.iter().any(|e| matches!(
            e,
            AnthropicStreamEvent::ContentBlockDelta { delta, .. } if delta["text"].as_str().unwrap().contains("SAFETY")
        )));
    }

    #[test]
    fn openai_chunk_then_done_sentinel() {
        let chunk = openai_chunk("1", "gpt-4", Some("hi"), None);
        assert!(chunk.starts_with("data: "));
        assert!(chunk.contains("\"content\":\"hi\""));
        assert_eq!(OPENAI_DONE, "data: [DONE]\n\n");
    }
}
