//! Program/project/session context resolution.
//!
//! Context arrives through dedicated headers, the process environment, or
//! is inferred from the client's user agent. Precedence per field, first
//! non-empty wins:
//!
//! 1. `X-Tokentap-Context` header (JSON object, full merge source)
//! 2. `X-Tokentap-Program` / `X-Tokentap-Project` / `X-Tokentap-Session`
//! 3. `TOKENTAP_PROGRAM` / `TOKENTAP_PROJECT` / `TOKENTAP_SESSION` /
//!    `TOKENTAP_CONTEXT` environment variables
//! 4. Inference: program from the user-agent client type

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Header names recognised by the resolver.
pub const HEADER_CONTEXT: &str = "x-tokentap-context";
pub const HEADER_PROGRAM: &str = "x-tokentap-program";
pub const HEADER_PROJECT: &str = "x-tokentap-project";
pub const HEADER_SESSION: &str = "x-tokentap-session";

/// Client classification derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    ClaudeCode,
    KiroCli,
    Codex,
    GeminiCli,
    Generic,
}

impl ClientType {
    /// String form used in event documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientType::ClaudeCode => "claude-code",
            ClientType::KiroCli => "kiro-cli",
            ClientType::Codex => "codex",
            ClientType::GeminiCli => "gemini-cli",
            ClientType::Generic => "generic",
        }
    }
}

/// Detects the client type from user-agent tokens.
pub fn detect_client_type(user_agent: &str) -> ClientType {
    let ua = user_agent.to_lowercase();
    if ua.contains("claude-code") || (ua.contains("claude") && ua.contains("code")) {
        ClientType::ClaudeCode
    } else if ua.contains("kiro") {
        ClientType::KiroCli
    } else if ua.contains("codex") {
        ClientType::Codex
    } else if ua.contains("gemini-cli") || ua.contains("gemini_cli") {
        ClientType::GeminiCli
    } else {
        ClientType::Generic
    }
}

/// Resolved request context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub program: Option<String>,
    pub project: Option<String>,
    pub session: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub custom: Map<String, Value>,
}

/// Context resolver with the environment tier captured at construction.
#[derive(Debug, Clone, Default)]
pub struct ContextResolver {
    env_program: Option<String>,
    env_project: Option<String>,
    env_session: Option<String>,
    env_context: Option<Value>,
}

impl ContextResolver {
    /// Captures the `TOKENTAP_*` environment tier.
    pub fn from_env() -> Self {
        Self {
            env_program: non_empty(std::env::var("TOKENTAP_PROGRAM").ok()),
            env_project: non_empty(std::env::var("TOKENTAP_PROJECT").ok()),
            env_session: non_empty(std::env::var("TOKENTAP_SESSION").ok()),
            env_context: std::env::var("TOKENTAP_CONTEXT")
                .ok()
                .and_then(|s| serde_json::from_str(&s).ok()),
        }
    }

    /// Builds a resolver with explicit environment values (tests).
    pub fn with_env(
        program: Option<String>,
        project: Option<String>,
        session: Option<String>,
        context: Option<Value>,
    ) -> Self {
        Self {
            env_program: non_empty(program),
            env_project: non_empty(project),
            env_session: non_empty(session),
            env_context: context,
        }
    }

    /// Resolves context for one flow.
    ///
    /// `header` looks up a request header by lower-cased name.
    pub fn resolve(
        &self,
        header: impl Fn(&str) -> Option<String>,
        user_agent: &str,
    ) -> ContextMetadata {
        let mut ctx = ContextMetadata::default();

        // Tier 1: the JSON context header.
        if let Some(raw) = header(HEADER_CONTEXT) {
            match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => merge_context_object(&mut ctx, map),
                Ok(_) | Err(_) => {
                    tracing::warn!("failed to parse {} header as a JSON object", HEADER_CONTEXT);
                }
            }
        }

        // Tier 2: scalar headers.
        fill(&mut ctx.program, header(HEADER_PROGRAM));
        fill(&mut ctx.project, header(HEADER_PROJECT));
        fill(&mut ctx.session, header(HEADER_SESSION));

        // Tier 3: process environment.
        fill(&mut ctx.program, self.env_program.clone());
        fill(&mut ctx.project, self.env_project.clone());
        fill(&mut ctx.session, self.env_session.clone());
        if let Some(Value::Object(map)) = self.env_context.clone() {
            merge_context_object(&mut ctx, map);
        }

        // Tier 4: inference from the user agent.
        fill(
            &mut ctx.program,
            Some(detect_client_type(user_agent).as_str().to_string()),
        );

        ctx
    }
}

/// Merges a JSON context object into a partially-resolved context.
///
/// Known keys land on their fields (only where still empty); unknown keys go
/// to `custom`.
fn merge_context_object(ctx: &mut ContextMetadata, map: Map<String, Value>) {
    for (key, value) in map {
        match key.as_str() {
            "program" | "program_name" => fill(&mut ctx.program, value_string(&value)),
            "project" | "project_name" => fill(&mut ctx.project, value_string(&value)),
            "session" | "session_id" => fill(&mut ctx.session, value_string(&value)),
            "tags" => {
                if let Value::Array(items) = value {
                    for item in items {
                        if let Some(tag) = item.as_str() {
                            if !ctx.tags.iter().any(|t| t == tag) {
                                ctx.tags.push(tag.to_string());
                            }
                        }
                    }
                }
            }
            _ => {
                ctx.custom.entry(key).or_insert(value);
            }
        }
    }
}

fn fill(slot: &mut Option<String>, candidate: Option<String>) {
    if slot.is_none() {
        *slot = non_empty(candidate);
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

fn value_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}
