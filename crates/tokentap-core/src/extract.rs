//! Declarative request/response extraction.
//!
//! Applies a provider's compiled field paths to a decoded JSON document.
//! Shape mismatches never fail: missing fields become `None` or zero. The
//! only failure kind upstream of this module is a body that did not decode.

use std::collections::HashSet;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde_json::Value;

use crate::fieldpath::Extracted;
use crate::provider::{PathSet, ProviderDefinition, ResponseJsonPaths};

/// Byte budget for the concatenated text sample (token estimation input).
pub const DEFAULT_TEXT_SAMPLE_BUDGET: usize = 64 * 1024;

/// Extracted request-side fields.
///
/// `messages`, `system` and `tools` preserve the request's structure
/// verbatim; no re-shaping beyond list coercion for `messages`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDigest {
    pub model: Option<String>,
    pub messages: Option<Vec<Value>>,
    pub system: Option<Value>,
    pub tools: Option<Value>,
    pub thinking: Option<Value>,
    pub metadata: Option<Value>,
    pub session_id: Option<String>,
    pub stream_requested: bool,
    pub text_sample: String,
}

impl RequestDigest {
    /// Number of extracted messages.
    pub fn message_count(&self) -> usize {
        self.messages.as_ref().map_or(0, |m| m.len())
    }

    /// True when the request enables extended thinking with a token budget.
    pub fn has_budget_tokens(&self) -> bool {
        self.thinking
            .as_ref()
            .and_then(|t| t.get("budget_tokens"))
            .and_then(Value::as_u64)
            .is_some()
    }
}

/// Token-accounting delta produced by response extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
}

impl UsageDelta {
    /// Input plus output; cache counts do not contribute.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Applies a provider's request paths to a decoded body.
pub fn extract_request(def: &ProviderDefinition, doc: &Value) -> RequestDigest {
    let req = &def.request;

    let messages = req.messages.as_ref().and_then(|p| match p.eval(doc) {
        Extracted::None => None,
        Extracted::Single(v) => Some(vec![v.clone()]),
        Extracted::Many(vs) => Some(vs.into_iter().cloned().collect()),
    });

    let mut text_sample = String::new();
    for path in &req.text_fields {
        match path.eval(doc) {
            Extracted::None => {}
            Extracted::Single(v) => push_text(&mut text_sample, v),
            Extracted::Many(vs) => {
                for v in vs {
                    push_text(&mut text_sample, v);
                }
            }
        }
        if text_sample.len() >= DEFAULT_TEXT_SAMPLE_BUDGET {
            break;
        }
    }
    truncate_to_boundary(&mut text_sample, DEFAULT_TEXT_SAMPLE_BUDGET);

    RequestDigest {
        model: req
            .model
            .eval(doc)
            .single()
            .and_then(Value::as_str)
            .map(str::to_string),
        messages,
        system: req.system.as_ref().and_then(|p| p.eval(doc).to_value()),
        tools: req.tools.as_ref().and_then(|p| p.eval(doc).to_value()),
        thinking: req.thinking.as_ref().and_then(|p| p.eval(doc).to_value()),
        metadata: req.metadata.as_ref().and_then(|p| p.eval(doc).to_value()),
        session_id: req
            .session_id
            .as_ref()
            .and_then(|p| p.eval(doc).single())
            .and_then(Value::as_str)
            .map(str::to_string),
        stream_requested: req
            .stream_param
            .as_ref()
            .and_then(|p| p.eval(doc).single())
            .and_then(Value::as_bool)
            .unwrap_or(false),
        text_sample,
    }
}

/// Applies a provider's JSON-response paths to a decoded body.
pub fn extract_response_json(
    provider_id: &str,
    paths: &ResponseJsonPaths,
    doc: &Value,
) -> UsageDelta {
    UsageDelta {
        input_tokens: coerce_tokens(provider_id, &paths.input_tokens, doc).unwrap_or(0),
        output_tokens: coerce_tokens(provider_id, &paths.output_tokens, doc).unwrap_or(0),
        cache_creation_tokens: paths
            .cache_creation_tokens
            .as_ref()
            .and_then(|p| coerce_single(provider_id, p.source(), p.eval(doc).single()))
            .unwrap_or(0),
        cache_read_tokens: paths
            .cache_read_tokens
            .as_ref()
            .and_then(|p| coerce_single(provider_id, p.source(), p.eval(doc).single()))
            .unwrap_or(0),
        model: paths
            .model
            .as_ref()
            .and_then(|p| p.eval(doc).single())
            .and_then(Value::as_str)
            .map(str::to_string),
        stop_reason: paths
            .stop_reason
            .as_ref()
            .and_then(|p| p.eval(doc).single())
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Coerces a path-set extraction to a token count.
pub fn coerce_tokens(provider_id: &str, paths: &PathSet, doc: &Value) -> Option<u64> {
    coerce_single(provider_id, paths.primary_source(), paths.eval(doc).single())
}

/// Token counts must be non-negative integers; anything else is treated as
/// absent and logged once per `(provider, path)` pair.
fn coerce_single(provider_id: &str, path_src: &str, value: Option<&Value>) -> Option<u64> {
    let value = value?;
    match value.as_u64() {
        Some(n) => Some(n),
        None => {
            warn_once(provider_id, path_src, value);
            None
        }
    }
}

fn warn_once(provider_id: &str, path_src: &str, value: &Value) {
    static WARNED: OnceLock<Mutex<HashSet<(String, String)>>> = OnceLock::new();
    let warned = WARNED.get_or_init(|| Mutex::new(HashSet::new()));
    let key = (provider_id.to_string(), path_src.to_string());
    if warned.lock().insert(key) {
        tracing::info!(
            provider = provider_id,
            path = path_src,
            %value,
            "non-integer token value treated as absent"
        );
    }
}

fn push_text(sample: &mut String, value: &Value) {
    if sample.len() >= DEFAULT_TEXT_SAMPLE_BUDGET {
        return;
    }
    if !sample.is_empty() {
        sample.push('\n');
    }
    match value {
        Value::String(s) => sample.push_str(s),
        other => sample.push_str(&other.to_string()),
    }
}

fn truncate_to_boundary(s: &mut String, budget: usize) {
    if s.len() <= budget {
        return;
    }
    let mut cut = budget;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}
