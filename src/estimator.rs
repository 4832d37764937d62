//! Deterministic token estimation.
//!
//! No network or tokenizer call: a cheap character-count heuristic good
//! enough to drive admission decisions ahead of the real usage numbers
//! upstream returns in its response. Operates directly on the raw JSON
//! request body so the proxy never needs to fully deserialize (and
//! potentially lose fidelity on) the caller's payload before forwarding it.

use serde_json::Value;

const CHARS_PER_TOKEN: f64 = 4.0;
const ROLE_OVERHEAD_TOKENS: u64 = 4;
const IMAGE_BLOCK_TOKENS: u64 = 1000;
const SYSTEM_OVERHEAD_TOKENS: u64 = 10;

/// Estimated input token count for a `/v1/messages`-shaped request body.
pub fn estimate_input_tokens(body: &Value) -> u64 {
    let mut total = 0u64;

    if let Some(system) = body.get("system") {
        total += SYSTEM_OVERHEAD_TOKENS;
        total += estimate_value_tokens(system);
    }

    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            total += ROLE_OVERHEAD_TOKENS;
            if let Some(content) = message.get("content") {
                total += estimate_value_tokens(content);
            }
        }
    }

    total
}

/// Estimate tokens for a single content value, which may be a plain string
/// or an array of content blocks (text/image/etc, per the Messages API).
fn estimate_value_tokens(value: &Value) -> u64 {
    match value {
        Value::String(s) => chars_to_tokens(s.len()),
        Value::Array(blocks) => blocks.iter().map(estimate_block_tokens).sum(),
        other => chars_to_tokens(other.to_string().len()),
    }
}

fn estimate_block_tokens(block: &Value) -> u64 {
    match block.get("type").and_then(Value::as_str) {
        Some("image") => IMAGE_BLOCK_TOKENS,
        Some("text") => block
            .get("text")
            .and_then(Value::as_str)
            .map(|s| chars_to_tokens(s.len()))
            .unwrap_or(0),
        _ => chars_to_tokens(block.to_string().len()),
    }
}

fn chars_to_tokens(chars: usize) -> u64 {
    (chars as f64 / CHARS_PER_TOKEN).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_simple_message() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "hello"}
            ]
        });
        // 4 role overhead + ceil(5/4) = 4 + 2 = 6
        assert_eq!(estimate_input_tokens(&body), 6);
    }

    #[test]
    fn test_estimate_includes_system_overhead() {
        let body = json!({
            "system": "be concise",
            "messages": [
                {"role": "user", "content": "hi"}
            ]
        });
        let with_system = estimate_input_tokens(&body);
        let without_system = estimate_input_tokens(&json!({
            "messages": [{"role": "user", "content": "hi"}]
        }));
        assert!(with_system > without_system);
    }

    #[test]
    fn test_estimate_image_block_is_flat_cost() {
        let body = json!({
            "messages": [
                {"role": "user", "content": [{"type": "image", "source": {}}]}
            ]
        });
        assert_eq!(estimate_input_tokens(&body), ROLE_OVERHEAD_TOKENS + IMAGE_BLOCK_TOKENS);
    }

    #[test]
    fn test_estimate_multiple_messages_accumulates_overhead() {
        let body = json!({
            "messages": [
                {"role": "user", "content": "a"},
                {"role": "assistant", "content": "b"},
                {"role": "user", "content": "c"}
            ]
        });
        assert_eq!(estimate_input_tokens(&body), 3 * ROLE_OVERHEAD_TOKENS + 3);
    }

    #[test]
    fn test_estimate_empty_body_is_zero() {
        assert_eq!(estimate_input_tokens(&json!({})), 0);
    }
}
