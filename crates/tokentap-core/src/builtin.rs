//! Compiled-in legacy extractors.
//!
//! Each recognised provider keeps a hand-written extraction routine that
//! predates the declarative config. When the quality check finds the
//! declarative extraction degraded, the flow falls back to the builtin
//! routine — exactly one fallback attempt per flow, selected by the
//! controller.

use serde_json::{json, Value};

use crate::extract::{RequestDigest, UsageDelta};
use crate::provider::ProviderDefinition;

/// Providers with a builtin legacy extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinProvider {
    Anthropic,
    OpenAi,
    Gemini,
}

impl BuiltinProvider {
    /// Looks up the builtin routine for a provider id.
    pub fn for_id(id: &str) -> Option<Self> {
        match id {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

/// Extractor selected for a flow: declarative config or builtin fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Declarative,
    Builtin(BuiltinProvider),
}

// =============================================================================
// Quality check
// =============================================================================

/// Degraded-extraction check applied after declarative request extraction.
///
/// The declarative result is degraded when:
/// - the raw body's `messages` array has length ≥ 2 but the digest captured
///   fewer entries (the collapsed-wildcard failure mode), or
/// - the provider configures a system/tools path, the raw body carries that
///   value, and the digest produced none.
pub fn is_degraded(digest: &RequestDigest, def: &ProviderDefinition, raw: &Value) -> bool {
    if let Some(raw_messages) = raw.get("messages").and_then(Value::as_array) {
        if raw_messages.len() >= 2 && digest.message_count() < raw_messages.len() {
            return true;
        }
    }

    if def.request.system.is_some() && digest.system.is_none() && has_value(raw.get("system")) {
        return true;
    }

    if def.request.tools.is_some() && digest.tools.is_none() && has_value(raw.get("tools")) {
        return true;
    }

    false
}

fn has_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(_) => true,
    }
}

// =============================================================================
// Request extraction
// =============================================================================

/// Builtin request extraction for a provider.
pub fn extract_request(kind: BuiltinProvider, doc: &Value) -> RequestDigest {
    match kind {
        BuiltinProvider::Anthropic => extract_anthropic_request(doc),
        BuiltinProvider::OpenAi => extract_openai_request(doc),
        BuiltinProvider::Gemini => extract_gemini_request(doc),
    }
}

fn extract_anthropic_request(doc: &Value) -> RequestDigest {
    let mut texts = Vec::new();
    let mut messages = Vec::new();

    if let Some(system) = doc.get("system") {
        let system_text = flatten_content(system);
        if !system_text.is_empty() {
            texts.push(system_text);
        }
    }

    for msg in doc.get("messages").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default() {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("unknown");
        let content = flatten_content(msg.get("content").unwrap_or(&Value::Null));
        texts.push(content.clone());
        messages.push(json!({"role": role, "content": content}));
    }

    RequestDigest {
        model: doc.get("model").and_then(Value::as_str).map(str::to_string),
        messages: Some(messages),
        system: doc.get("system").cloned().filter(|v| has_value(Some(v))),
        tools: doc.get("tools").cloned().filter(|v| has_value(Some(v))),
        thinking: doc.get("thinking").cloned().filter(|v| !v.is_null()),
        metadata: doc.get("metadata").cloned().filter(|v| !v.is_null()),
        session_id: doc
            .pointer("/metadata/user_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        stream_requested: doc.get("stream").and_then(Value::as_bool).unwrap_or(false),
        text_sample: texts.join("\n"),
    }
}

fn extract_openai_request(doc: &Value) -> RequestDigest {
    let mut texts = Vec::new();
    let mut messages = Vec::new();

    for msg in doc.get("messages").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default() {
        let role = msg.get("role").and_then(Value::as_str).unwrap_or("unknown");
        let content = flatten_content(msg.get("content").unwrap_or(&Value::Null));
        texts.push(content.clone());
        messages.push(json!({"role": role, "content": content}));
    }

    RequestDigest {
        model: doc.get("model").and_then(Value::as_str).map(str::to_string),
        messages: Some(messages),
        system: None,
        tools: doc.get("tools").cloned().filter(|v| has_value(Some(v))),
        thinking: None,
        metadata: doc.get("metadata").cloned().filter(|v| !v.is_null()),
        session_id: None,
        stream_requested: doc.get("stream").and_then(Value::as_bool).unwrap_or(false),
        text_sample: texts.join("\n"),
    }
}

fn extract_gemini_request(doc: &Value) -> RequestDigest {
    let mut texts = Vec::new();
    let mut messages = Vec::new();

    if let Some(parts) = doc.pointer("/systemInstruction/parts").and_then(Value::as_array) {
        let system_text = join_part_texts(parts);
        if !system_text.is_empty() {
            messages.push(json!({"role": "system", "content": system_text}));
            texts.push(system_text);
        }
    }

    for content in doc.get("contents").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default() {
        let role = content.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = content
            .get("parts")
            .and_then(Value::as_array)
            .map(|p| join_part_texts(p))
            .unwrap_or_default();
        texts.push(text.clone());
        messages.push(json!({"role": role, "content": text}));
    }

    RequestDigest {
        model: doc.get("model").and_then(Value::as_str).map(str::to_string),
        messages: Some(messages),
        system: doc.get("systemInstruction").cloned(),
        tools: doc.get("tools").cloned().filter(|v| has_value(Some(v))),
        thinking: None,
        metadata: None,
        session_id: None,
        stream_requested: false,
        text_sample: texts.join("\n"),
    }
}

/// Flattens string / content-block-array / nested content into plain text.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => {
            let mut texts = Vec::new();
            for item in items {
                match item {
                    Value::String(s) => texts.push(s.clone()),
                    Value::Object(obj) => {
                        if let Some(text) = obj.get("text").and_then(Value::as_str) {
                            texts.push(text.to_string());
                        } else if let Some(nested) = obj.get("content") {
                            texts.push(flatten_content(nested));
                        }
                    }
                    _ => {}
                }
            }
            texts.join(" ")
        }
        Value::Object(obj) => {
            if let Some(text) = obj.get("text").and_then(Value::as_str) {
                text.to_string()
            } else if let Some(nested) = obj.get("content") {
                flatten_content(nested)
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

fn join_part_texts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

// =============================================================================
// Response extraction
// =============================================================================

/// Builtin JSON-response extraction for a provider.
pub fn extract_response(kind: BuiltinProvider, doc: &Value) -> UsageDelta {
    match kind {
        BuiltinProvider::Anthropic => UsageDelta {
            input_tokens: token_at(doc, "/usage/input_tokens"),
            output_tokens: token_at(doc, "/usage/output_tokens"),
            cache_creation_tokens: token_at(doc, "/usage/cache_creation_input_tokens"),
            cache_read_tokens: token_at(doc, "/usage/cache_read_input_tokens"),
            model: string_at(doc, "/model"),
            stop_reason: string_at(doc, "/stop_reason"),
        },
        BuiltinProvider::OpenAi => UsageDelta {
            input_tokens: token_at(doc, "/usage/prompt_tokens"),
            output_tokens: token_at(doc, "/usage/completion_tokens"),
            cache_creation_tokens: 0,
            cache_read_tokens: token_at(doc, "/usage/prompt_tokens_details/cached_tokens"),
            model: string_at(doc, "/model"),
            stop_reason: string_at(doc, "/choices/0/finish_reason"),
        },
        BuiltinProvider::Gemini => UsageDelta {
            input_tokens: token_at(doc, "/usageMetadata/promptTokenCount"),
            output_tokens: token_at(doc, "/usageMetadata/candidatesTokenCount"),
            cache_creation_tokens: 0,
            cache_read_tokens: token_at(doc, "/usageMetadata/cachedContentTokenCount"),
            model: string_at(doc, "/modelVersion"),
            stop_reason: string_at(doc, "/candidates/0/finishReason"),
        },
    }
}

/// Builtin per-event SSE update. Token fields are replaced, not summed:
/// providers emit running totals.
pub fn sse_step(kind: BuiltinProvider, event_label: &str, data: &Value, usage: &mut UsageDelta) {
    match kind {
        BuiltinProvider::Anthropic => match event_label {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        usage.model = Some(model.to_string());
                    }
                    usage.input_tokens = token_at(message, "/usage/input_tokens");
                    usage.cache_creation_tokens =
                        token_at(message, "/usage/cache_creation_input_tokens");
                    usage.cache_read_tokens = token_at(message, "/usage/cache_read_input_tokens");
                }
            }
            "message_delta" => {
                if let Some(n) = data.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    usage.output_tokens = n;
                }
                if let Some(reason) = data.pointer("/delta/stop_reason").and_then(Value::as_str) {
                    usage.stop_reason = Some(reason.to_string());
                }
            }
            _ => {}
        },
        BuiltinProvider::OpenAi => {
            if let Some(model) = data.get("model").and_then(Value::as_str) {
                if !model.is_empty() {
                    usage.model = Some(model.to_string());
                }
            }
            if let Some(u) = data.get("usage").filter(|u| !u.is_null()) {
                if let Some(n) = u.get("prompt_tokens").and_then(Value::as_u64) {
                    usage.input_tokens = n;
                }
                if let Some(n) = u.get("completion_tokens").and_then(Value::as_u64) {
                    usage.output_tokens = n;
                }
            }
            if let Some(reason) = data.pointer("/choices/0/finish_reason").and_then(Value::as_str) {
                usage.stop_reason = Some(reason.to_string());
            }
        }
        BuiltinProvider::Gemini => {
            let frame = extract_response(BuiltinProvider::Gemini, data);
            if frame.input_tokens > 0 {
                usage.input_tokens = frame.input_tokens;
            }
            if frame.output_tokens > 0 {
                usage.output_tokens = frame.output_tokens;
            }
            if frame.cache_read_tokens > 0 {
                usage.cache_read_tokens = frame.cache_read_tokens;
            }
            if frame.model.is_some() {
                usage.model = frame.model;
            }
            if frame.stop_reason.is_some() {
                usage.stop_reason = frame.stop_reason;
            }
        }
    }
}

fn token_at(doc: &Value, pointer: &str) -> u64 {
    doc.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

fn string_at(doc: &Value, pointer: &str) -> Option<String> {
    doc.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_request as declarative_request;
    use crate::provider::ProviderRegistry;

    #[test]
    fn builtin_lookup() {
        assert_eq!(BuiltinProvider::for_id("anthropic"), Some(BuiltinProvider::Anthropic));
        assert_eq!(BuiltinProvider::for_id("openai"), Some(BuiltinProvider::OpenAi));
        assert_eq!(BuiltinProvider::for_id("gemini"), Some(BuiltinProvider::Gemini));
        assert_eq!(BuiltinProvider::for_id("unknown"), None);
    }

    #[test]
    fn anthropic_request_flattens_blocks_and_counts_all_messages() {
        let doc = json!({
            "model": "claude-sonnet-4-5-20250929",
            "system": "You are an AI",
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "one"}]},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": [{"type": "text", "text": "three"}]}
            ]
        });
        let digest = extract_request(BuiltinProvider::Anthropic, &doc);
        assert_eq!(digest.message_count(), 3);
        assert_eq!(digest.system, Some(json!("You are an AI")));
        assert!(digest.text_sample.contains("one"));
        assert!(digest.text_sample.contains("three"));
    }

    #[test]
    fn gemini_request_prepends_system_instruction() {
        let doc = json!({
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "hello"}]}
            ]
        });
        let digest = extract_request(BuiltinProvider::Gemini, &doc);
        assert_eq!(digest.message_count(), 3);
        assert_eq!(digest.messages.as_ref().unwrap()[0]["role"], "system");
    }

    #[test]
    fn openai_response_usage() {
        let doc = json!({
            "model": "gpt-4o",
            "choices": [{"finish_reason": "stop"}],
            "usage": {"prompt_tokens": 200, "completion_tokens": 75}
        });
        let usage = extract_response(BuiltinProvider::OpenAi, &doc);
        assert_eq!(usage.input_tokens, 200);
        assert_eq!(usage.output_tokens, 75);
        assert_eq!(usage.stop_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn anthropic_sse_steps_replace_running_totals() {
        let mut usage = UsageDelta::default();
        sse_step(
            BuiltinProvider::Anthropic,
            "message_start",
            &json!({"message": {"model": "claude-3", "usage": {"input_tokens": 10}}}),
            &mut usage,
        );
        for total in [8u64, 17, 25] {
            sse_step(
                BuiltinProvider::Anthropic,
                "message_delta",
                &json!({"usage": {"output_tokens": total}}),
                &mut usage,
            );
        }
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 25);
    }

    #[test]
    fn degraded_when_message_count_collapses() {
        let registry = ProviderRegistry::bundled().unwrap();
        let def = registry.get("anthropic").unwrap();

        let raw = json!({
            "model": "m",
            "messages": (0..12).map(|i| json!({"role": "user", "content": format!("m{i}")})).collect::<Vec<_>>()
        });

        // Simulate the collapsed-wildcard bug: digest captured one message.
        let mut digest = declarative_request(&def, &raw);
        digest.messages = Some(vec![json!({"role": "user", "content": "m0"})]);

        assert!(is_degraded(&digest, &def, &raw));

        // Legacy extractor restores the full set.
        let legacy = extract_request(BuiltinProvider::Anthropic, &raw);
        assert_eq!(legacy.message_count(), 12);
        assert!(!is_degraded(&legacy, &def, &raw));
    }

    #[test]
    fn degraded_when_present_system_is_dropped() {
        let registry = ProviderRegistry::bundled().unwrap();
        let def = registry.get("anthropic").unwrap();
        let raw = json!({
            "model": "m",
            "system": "You are an AI",
            "messages": [{"role": "user", "content": "hi"}]
        });
        // The bundled system path is an array wildcard; a plain-string system
        // yields none, which the quality check must flag.
        let digest = declarative_request(&def, &raw);
        assert!(digest.system.is_none());
        assert!(is_degraded(&digest, &def, &raw));
    }

    #[test]
    fn not_degraded_for_single_message_or_absent_fields() {
        let registry = ProviderRegistry::bundled().unwrap();
        let def = registry.get("anthropic").unwrap();
        let raw = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let digest = declarative_request(&def, &raw);
        assert!(!is_degraded(&digest, &def, &raw));
    }
}
