//! Streaming response accumulator.
//!
//! Consumes the response byte stream chunk by chunk, frames it into lines
//! and SSE events, and folds token updates into a `UsageDelta` without
//! buffering the whole response. Token fields are replaced on each matching
//! event — providers emit running totals, not deltas — so the final value
//! wins regardless of how many frames arrive.
//!
//! The accumulator is driven by the flow's own byte pump; it never blocks
//! forwarding and never aborts a flow on malformed frames.

use bytes::BytesMut;
use serde_json::Value;

use crate::builtin::{self, BuiltinProvider};
use crate::extract::UsageDelta;
use crate::provider::{ResponseSsePaths, SseFormat};

/// Cap on the raw-chunk tail retained when full capture is on.
pub const DEFAULT_CAPTURE_TAIL_CAP: usize = 256 * 1024;

/// Cap on the text tail kept for json-lines / last-chunk formats.
const TEXT_TAIL_CAP: usize = 256 * 1024;

/// Accumulator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No parseable event seen yet.
    Init,
    /// At least one event parsed; updates are being folded in.
    Streaming,
    /// Stream ended or terminal marker seen.
    Done,
}

/// Extraction rules driving the accumulator.
#[derive(Debug, Clone)]
pub enum StreamRules {
    /// Config-driven extraction from the provider's SSE profile.
    Declarative {
        provider_id: String,
        sse: ResponseSsePaths,
    },
    /// Builtin legacy routine.
    Builtin(BuiltinProvider),
}

/// Result of finalising a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    pub usage: UsageDelta,
    /// Malformed frames encountered (stream continued past each).
    pub skipped: u64,
    /// Raw tail of the response, present iff full capture was on.
    pub raw_tail: Option<Vec<u8>>,
    /// Bytes evicted from the capture tail on overflow.
    pub tail_dropped_bytes: u64,
}

/// Bounded raw-byte tail; overflow evicts the oldest bytes.
#[derive(Debug)]
struct CaptureTail {
    buf: BytesMut,
    cap: usize,
    dropped: u64,
}

impl CaptureTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            let _ = self.buf.split_to(excess);
            self.dropped += excess as u64;
        }
    }
}

/// The per-flow stream accumulator.
#[derive(Debug)]
pub struct StreamAccumulator {
    rules: StreamRules,
    state: StreamState,
    line_buf: BytesMut,
    event_label: String,
    usage: UsageDelta,
    skipped: u64,
    text_tail: Option<String>,
    capture_tail: Option<CaptureTail>,
}

impl StreamAccumulator {
    /// Creates an accumulator for the given rules.
    ///
    /// `capture_full` enables the bounded raw tail.
    pub fn new(rules: StreamRules, capture_full: bool) -> Self {
        let wants_text_tail = match &rules {
            StreamRules::Declarative { sse, .. } => {
                sse.use_last_chunk || !matches!(sse.format, SseFormat::Sse)
            }
            StreamRules::Builtin(BuiltinProvider::Gemini) => true,
            StreamRules::Builtin(_) => false,
        };
        Self {
            rules,
            state: StreamState::Init,
            line_buf: BytesMut::new(),
            event_label: String::new(),
            usage: UsageDelta::default(),
            skipped: 0,
            text_tail: wants_text_tail.then(String::new),
            capture_tail: capture_full.then(|| CaptureTail::new(DEFAULT_CAPTURE_TAIL_CAP)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The usage folded in so far (used when a flow is cancelled mid-stream).
    pub fn usage(&self) -> &UsageDelta {
        &self.usage
    }

    /// Feeds one chunk of response bytes.
    ///
    /// Complete lines are processed immediately; a trailing partial line is
    /// held until the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.state == StreamState::Done {
            return;
        }

        if let Some(tail) = &mut self.capture_tail {
            tail.push(chunk);
        }
        if let Some(text) = &mut self.text_tail {
            text.push_str(&String::from_utf8_lossy(chunk));
            if text.len() > TEXT_TAIL_CAP {
                let excess = text.len() - TEXT_TAIL_CAP;
                let mut cut = excess;
                while cut < text.len() && !text.is_char_boundary(cut) {
                    cut += 1;
                }
                text.drain(..cut);
            }
        }

        self.line_buf.extend_from_slice(chunk);
        while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
            let line_bytes = self.line_buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&line_bytes);
            self.process_line(line.trim_end_matches(['\r', '\n']));
        }
    }

    /// Finalises the stream and returns the accumulated outcome.
    ///
    /// Also used on cancellation: whatever totals are present are returned.
    pub fn finalize(mut self) -> StreamOutcome {
        // Flush a trailing unterminated line.
        if !self.line_buf.is_empty() {
            let remaining = self.line_buf.split();
            let line = String::from_utf8_lossy(&remaining).to_string();
            self.process_line(line.trim_end_matches(['\r', '\n']));
        }

        self.finalize_text_tail();
        self.state = StreamState::Done;

        StreamOutcome {
            usage: self.usage,
            skipped: self.skipped,
            raw_tail: self.capture_tail.as_ref().map(|t| t.buf.to_vec()),
            tail_dropped_bytes: self.capture_tail.as_ref().map_or(0, |t| t.dropped),
        }
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            // Blank line delimits an SSE event; reset the event label.
            self.event_label.clear();
            return;
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.event_label = rest.trim().to_string();
            return;
        }

        if let Some(rest) = line.strip_prefix("data:") {
            let data = rest.trim();
            if self.is_done_marker(data) {
                self.state = StreamState::Done;
                return;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(json) => {
                    let label = if self.event_label.is_empty() {
                        json.get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string()
                    } else {
                        self.event_label.clone()
                    };
                    self.step(&label, &json);
                }
                Err(_) => self.skipped += 1,
            }
            return;
        }

        // SSE comment / id / retry fields pass through silently.
        if line.starts_with(':') || line.starts_with("id:") || line.starts_with("retry:") {
            return;
        }

        // Json-lines formats carry bare JSON objects, possibly wrapped in
        // array punctuation.
        if self.accepts_json_lines() {
            let bare = line.trim_matches(|c| c == ',' || c == '[' || c == ']' || c == ' ');
            if bare.is_empty() {
                return;
            }
            if let Ok(json) = serde_json::from_str::<Value>(bare) {
                let label = json
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                self.step(&label, &json);
            }
            // Partial pretty-printed objects are expected here; the bounded
            // text tail covers them at finalisation.
        }
    }

    fn is_done_marker(&self, data: &str) -> bool {
        match &self.rules {
            StreamRules::Declarative { sse, .. } => {
                sse.done_marker.as_deref() == Some(data)
            }
            StreamRules::Builtin(BuiltinProvider::OpenAi) => data == "[DONE]",
            StreamRules::Builtin(_) => false,
        }
    }

    fn accepts_json_lines(&self) -> bool {
        match &self.rules {
            StreamRules::Declarative { sse, .. } => !matches!(sse.format, SseFormat::Sse),
            StreamRules::Builtin(BuiltinProvider::Gemini) => true,
            StreamRules::Builtin(_) => false,
        }
    }

    fn step(&mut self, label: &str, data: &Value) {
        if self.state == StreamState::Init {
            self.state = StreamState::Streaming;
        }

        match &self.rules {
            StreamRules::Declarative { provider_id, sse } => {
                step_declarative(provider_id, sse, label, data, &mut self.usage);
            }
            StreamRules::Builtin(kind) => builtin::sse_step(*kind, label, data, &mut self.usage),
        }
    }

    fn finalize_text_tail(&mut self) {
        let Some(text) = self.text_tail.take() else {
            return;
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        // A complete JSON array (Gemini-style) carries the final usage in its
        // last element; a single object carries it directly.
        let last = match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => items.into_iter().last(),
            Ok(other) => Some(other),
            Err(_) => None,
        };
        if let Some(frame) = last {
            let label = frame
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            self.step(&label, &frame);
        }
    }
}

fn step_declarative(
    provider_id: &str,
    sse: &ResponseSsePaths,
    label: &str,
    data: &Value,
    usage: &mut UsageDelta,
) {
    let matches = |expected: &Option<String>| -> bool {
        match expected.as_deref() {
            None | Some("*") => true,
            Some(e) => e == label,
        }
    };

    if matches(&sse.input_tokens_event) {
        if let Some(paths) = &sse.input_tokens {
            if let Some(n) = crate::extract::coerce_tokens(provider_id, paths, data) {
                usage.input_tokens = n;
            }
        }
    }
    if matches(&sse.output_tokens_event) {
        if let Some(paths) = &sse.output_tokens {
            if let Some(n) = crate::extract::coerce_tokens(provider_id, paths, data) {
                usage.output_tokens = n;
            }
        }
    }
    if matches(&sse.cache_creation_tokens_event) {
        if let Some(path) = &sse.cache_creation_tokens {
            if let Some(n) = path.eval(data).single().and_then(Value::as_u64) {
                usage.cache_creation_tokens = n;
            }
        }
    }
    if matches(&sse.cache_read_tokens_event) {
        if let Some(path) = &sse.cache_read_tokens {
            if let Some(n) = path.eval(data).single().and_then(Value::as_u64) {
                usage.cache_read_tokens = n;
            }
        }
    }
    if matches(&sse.model_event) {
        if let Some(path) = &sse.model {
            if let Some(m) = path.eval(data).single().and_then(Value::as_str) {
                usage.model = Some(m.to_string());
            }
        }
    }
    if matches(&sse.stop_reason_event) {
        if let Some(path) = &sse.stop_reason {
            if let Some(r) = path.eval(data).single().and_then(Value::as_str) {
                usage.stop_reason = Some(r.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderRegistry;

    fn anthropic_rules() -> StreamRules {
        let registry = ProviderRegistry::bundled().unwrap();
        let def = registry.get("anthropic").unwrap();
        StreamRules::Declarative {
            provider_id: "anthropic".to_string(),
            sse: def.response_sse.clone().unwrap(),
        }
    }

    fn openai_rules() -> StreamRules {
        let registry = ProviderRegistry::bundled().unwrap();
        let def = registry.get("openai").unwrap();
        StreamRules::Declarative {
            provider_id: "openai".to_string(),
            sse: def.response_sse.clone().unwrap(),
        }
    }

    #[test]
    fn anthropic_running_totals_replace_not_sum() {
        let mut acc = StreamAccumulator::new(anthropic_rules(), false);
        acc.feed(b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-5-20250929\",\"usage\":{\"input_tokens\":10}}}\n\n");
        for total in [8, 17, 25] {
            acc.feed(
                format!(
                    "event: message_delta\ndata: {{\"type\":\"message_delta\",\"usage\":{{\"output_tokens\":{total}}}}}\n\n"
                )
                .as_bytes(),
            );
        }
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 10);
        assert_eq!(outcome.usage.output_tokens, 25);
        assert_eq!(outcome.usage.model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn event_label_from_json_type_when_no_event_field() {
        // Anthropic frames carry "type" in the payload even without an
        // `event:` line.
        let mut acc = StreamAccumulator::new(anthropic_rules(), false);
        acc.feed(b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":7}}}\n\n");
        acc.feed(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":3}}\n\n");
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 7);
        assert_eq!(outcome.usage.output_tokens, 3);
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut acc = StreamAccumulator::new(anthropic_rules(), false);
        acc.feed(b"event: message_st");
        assert_eq!(acc.state(), StreamState::Init);
        acc.feed(b"art\ndata: {\"type\":\"message_start\",\"mess");
        acc.feed(b"age\":{\"usage\":{\"input_tokens\":42}}}\n\n");
        assert_eq!(acc.state(), StreamState::Streaming);
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 42);
    }

    #[test]
    fn malformed_frames_increment_skip_and_never_abort() {
        let mut acc = StreamAccumulator::new(anthropic_rules(), false);
        acc.feed(b"data: {broken json\n\n");
        acc.feed(b"data: also not json\n\n");
        acc.feed(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":5}}\n\n");
        let outcome = acc.finalize();
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.usage.output_tokens, 5);
    }

    #[test]
    fn openai_done_marker_terminates() {
        let mut acc = StreamAccumulator::new(openai_rules(), false);
        acc.feed(b"data: {\"model\":\"gpt-4o\",\"usage\":{\"prompt_tokens\":50,\"completion_tokens\":30}}\n\n");
        acc.feed(b"data: [DONE]\n\n");
        assert_eq!(acc.state(), StreamState::Done);
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 50);
        assert_eq!(outcome.usage.output_tokens, 30);
        assert_eq!(outcome.skipped, 0);
    }

    #[test]
    fn gemini_json_lines_last_chunk_wins() {
        let registry = ProviderRegistry::bundled().unwrap();
        let def = registry.get("gemini").unwrap();
        let rules = StreamRules::Declarative {
            provider_id: "gemini".to_string(),
            sse: def.response_sse.clone().unwrap(),
        };
        let mut acc = StreamAccumulator::new(rules, false);
        acc.feed(b"[{\"candidates\":[{\"content\":{}}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":1}},\n");
        acc.feed(b"{\"candidates\":[{\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":5,\"candidatesTokenCount\":9}}]\n");
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 5);
        assert_eq!(outcome.usage.output_tokens, 9);
        assert_eq!(outcome.usage.stop_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn builtin_rules_drive_legacy_routine() {
        let mut acc = StreamAccumulator::new(StreamRules::Builtin(BuiltinProvider::Anthropic), false);
        acc.feed(b"event: message_start\ndata: {\"message\":{\"model\":\"claude-3\",\"usage\":{\"input_tokens\":15,\"cache_read_input_tokens\":20}}}\n\n");
        acc.feed(b"event: message_delta\ndata: {\"usage\":{\"output_tokens\":85}}\n\n");
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 15);
        assert_eq!(outcome.usage.cache_read_tokens, 20);
        assert_eq!(outcome.usage.output_tokens, 85);
    }

    #[test]
    fn capture_tail_bounded_with_drop_counter() {
        let mut acc = StreamAccumulator::new(anthropic_rules(), true);
        let chunk = vec![b'x'; 100 * 1024];
        for _ in 0..4 {
            acc.feed(&chunk);
        }
        let outcome = acc.finalize();
        let tail = outcome.raw_tail.unwrap();
        assert_eq!(tail.len(), DEFAULT_CAPTURE_TAIL_CAP);
        assert_eq!(
            outcome.tail_dropped_bytes,
            (400 * 1024 - DEFAULT_CAPTURE_TAIL_CAP) as u64
        );
    }

    #[test]
    fn no_capture_tail_by_default() {
        let mut acc = StreamAccumulator::new(anthropic_rules(), false);
        acc.feed(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":1}}\n\n");
        let outcome = acc.finalize();
        assert!(outcome.raw_tail.is_none());
    }

    #[test]
    fn cancellation_mid_stream_keeps_partial_totals() {
        let mut acc = StreamAccumulator::new(anthropic_rules(), false);
        acc.feed(b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10}}}\n\n");
        acc.feed(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":8}}\n\n");
        // Client disconnects here; finalize with whatever is present.
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 10);
        assert_eq!(outcome.usage.output_tokens, 8);
    }

    #[test]
    fn trailing_unterminated_line_is_flushed_at_finalize() {
        let mut acc = StreamAccumulator::new(openai_rules(), false);
        acc.feed(b"data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2}}");
        let outcome = acc.finalize();
        assert_eq!(outcome.usage.input_tokens, 4);
        assert_eq!(outcome.usage.output_tokens, 2);
    }
}
