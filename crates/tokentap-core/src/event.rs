//! The persisted event document.
//!
//! One event per intercepted flow. Message content is redacted unless the
//! operator enabled debug capture; raw request/response payloads are only
//! attached for full-capture flows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ClientType, ContextMetadata};
use crate::device::DeviceInfo;
use crate::extract::{RequestDigest, UsageDelta};
use crate::provider::CaptureMode;

/// Replacement string for redacted message content.
pub const REDACTED: &str = "[REDACTED]";

/// A token-accounting event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub provider_id: String,
    pub host: String,
    pub path: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub response_status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub streaming: bool,
    pub truncated: bool,
    pub client_type: ClientType,
    pub user_agent: String,
    pub device: DeviceInfo,
    /// Denormalised copy of `device.id` for indexed queries.
    pub device_id: String,
    pub is_token_consuming: bool,
    pub has_budget_tokens: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
    pub capture_mode: CaptureMode,
    pub context: ContextMetadata,
    /// Denormalised copies of `context.program` / `context.project`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub provider_tags: Vec<String>,
    /// Always present; content redacted unless debug capture is on.
    pub messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<Value>,
}

/// Inputs to event assembly, gathered by the flow controller.
#[derive(Debug, Clone)]
pub struct EventParts {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub provider_id: String,
    pub host: String,
    pub path: String,
    pub digest: RequestDigest,
    pub usage: UsageDelta,
    pub context: ContextMetadata,
    pub device: DeviceInfo,
    pub client_type: ClientType,
    pub user_agent: String,
    pub response_status: u16,
    pub streaming: bool,
    pub truncated: bool,
    pub capture_mode: CaptureMode,
    /// Debug mode or provider-level full capture.
    pub capture_full: bool,
    /// Whether the request path matched a configured LLM API pattern.
    pub path_matches_api: bool,
    pub provider_tags: Vec<String>,
    pub cost_per_input_token: Option<f64>,
    pub cost_per_output_token: Option<f64>,
    pub raw_request: Option<Value>,
    pub raw_response: Option<Value>,
}

impl Event {
    /// Assembles the persisted document from a finished flow.
    pub fn assemble(parts: EventParts) -> Self {
        let EventParts {
            timestamp,
            duration_ms,
            provider_id,
            host,
            path,
            digest,
            usage,
            context,
            device,
            client_type,
            user_agent,
            response_status,
            streaming,
            truncated,
            capture_mode,
            capture_full,
            path_matches_api,
            provider_tags,
            cost_per_input_token,
            cost_per_output_token,
            raw_request,
            raw_response,
        } = parts;

        let model = usage
            .model
            .clone()
            .or_else(|| digest.model.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let has_budget_tokens = digest.has_budget_tokens();
        let mut messages = digest.messages.clone().unwrap_or_default();
        let is_token_consuming = !messages.is_empty() || has_budget_tokens || path_matches_api;

        if !capture_full {
            redact_messages(&mut messages);
        }

        let estimated_cost = match (cost_per_input_token, cost_per_output_token) {
            (None, None) => None,
            (input_rate, output_rate) => Some(
                usage.input_tokens as f64 * input_rate.unwrap_or(0.0)
                    + usage.output_tokens as f64 * output_rate.unwrap_or(0.0),
            ),
        };

        Self {
            timestamp,
            duration_ms,
            provider_id,
            host,
            path,
            model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens(),
            cache_creation_tokens: usage.cache_creation_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            response_status,
            stop_reason: usage.stop_reason,
            streaming,
            truncated,
            client_type,
            user_agent,
            device_id: device.id.clone(),
            device,
            is_token_consuming,
            has_budget_tokens,
            estimated_cost,
            capture_mode,
            program: context.program.clone(),
            project: context.project.clone(),
            context,
            provider_tags,
            messages,
            system: digest.system,
            tools: digest.tools,
            thinking: digest.thinking,
            request_metadata: digest.metadata,
            raw_request: if capture_full { raw_request } else { None },
            raw_response: if capture_full { raw_response } else { None },
        }
    }

    /// Short digest for failure logs; never includes content.
    pub fn digest_line(&self) -> String {
        format!(
            "{} {} model={} in={} out={} status={}",
            self.timestamp.to_rfc3339(),
            self.provider_id,
            self.model,
            self.input_tokens,
            self.output_tokens,
            self.response_status
        )
    }
}

/// Replaces each message's `content` with the redaction marker, preserving
/// `role` and every other structural key.
pub fn redact_messages(messages: &mut [Value]) {
    for message in messages.iter_mut() {
        if let Some(obj) = message.as_object_mut() {
            if obj.contains_key("content") {
                obj.insert("content".to_string(), Value::String(REDACTED.to_string()));
            }
        }
    }
}
