// ── Keystone Gateway: Protocol Translation ──────────────────────────────────
// Shared helpers used by both the OpenAI and Anthropic translation modules:
// the model-alias substring table and last-user-message extraction for the
// semantic cache key.

pub mod anthropic;
pub mod gemini;
pub mod openai;

/// Case-insensitive substring mapping from a caller-requested model name to
/// the upstream Gemini model actually dispatched. For local-provider
/// accounts the caller never reaches this — the account's own stored model
/// id is used instead (see `Account::local_model`).
pub fn map_model_alias(requested: &str) -> String {
    let lower = requested.to_lowercase();
    if lower.contains("sonnet") || lower.contains("thinking") || lower.contains("opus") {
        "gemini-3-pro-preview".to_string()
    } else if lower.contains("haiku") {
        "gemini-2.0-flash-exp".to_string()
    } else if lower.contains("claude") {
        "gemini-2.5-flash-thinking".to_string()
    } else {
        requested.to_string()
    }
}

/// Extracts the last user message as a plain string, for semantic-cache
/// keying. Accepts either a plain string `content` field or an array of
/// content blocks (OpenAI vision-style or Anthropic content blocks), taking
/// the concatenation of any `text` fields found.
pub fn extract_last_user_text(messages: &[serde_json::Value]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m["role"].as_str() == Some("user"))
        .and_then(|m| content_to_text(&m["content"]))
}

fn content_to_text(content: &serde_json::Value) -> Option<String> {
    if let Some(s) = content.as_str() {
        return Some(s.to_string());
    }
    if let Some(blocks) = content.as_array() {
        let joined: String = blocks
            .iter()
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if joined.is_empty() {
            return None;
        }
        return Some(joined);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn alias_table_matches_each_case() {
        assert_eq!(map_model_alias("claude-3-sonnet"), "gemini-3-pro-preview");
        assert_eq!(map_model_alias("extended-thinking-mode"), "gemini-3-pro-preview");
        assert_eq!(map_model_alias("claude-3-opus"), "gemini-3-pro-preview");
        assert_eq!(map_model_alias("claude-3-haiku"), "gemini-2.0-flash-exp");
        assert_eq!(map_model_alias("claude-instant"), "gemini-2.5-flash-thinking");
        assert_eq!(map_model_alias("gpt-4"), "gpt-4");
    }

    #[test]
    fn extracts_last_user_message_plain_string() {
        let messages = vec![
            json!({"role": "user", "content": "first"}),
            json!({"role": "assistant", "content": "reply"}),
            json!({"role": "user", "content": "second"}),
        ];
        assert_eq!(extract_last_user_text(&messages).as_deref(), Some("second"));
    }

    #[test]
    fn extracts_last_user_message_from_blocks() {
        let messages = vec![json!({
            "role": "user",
            "content": [{"type": "text", "text": "hello "}, {"type": "text", "text": "world"}]
        })];
        assert_eq!(extract_last_user_text(&messages).as_deref(), Some("hello world"));
    }
}
