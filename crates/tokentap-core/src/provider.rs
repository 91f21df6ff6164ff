//! Declarative provider configuration and the provider registry.
//!
//! Providers are described by a JSON document with two layers: a bundled
//! default and an optional operator override, deep-merged leaf-wise
//! (override wins, arrays are replaced wholesale). All field-path
//! expressions are compiled at load time; a validation failure rejects the
//! whole document and, on reload, leaves the previous registry running.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, Result};
use crate::fieldpath::FieldPath;

/// Provider id used for unmatched hosts under `capture_all`.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Bundled default provider configuration.
pub const BUNDLED_PROVIDERS: &str = include_str!("../providers.json");

/// Process-wide capture policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Only configured provider domains produce events.
    #[default]
    KnownOnly,
    /// Unmatched hosts fall through to the `unknown` provider profile.
    CaptureAll,
}

impl CaptureMode {
    /// String form used in event documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMode::KnownOnly => "known_only",
            CaptureMode::CaptureAll => "capture_all",
        }
    }
}

// =============================================================================
// Raw document model (serde)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersDoc {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub capture_mode: CaptureMode,
    pub providers: BTreeMap<String, ProviderDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderDoc {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub api_patterns: Vec<String>,
    #[serde(default)]
    pub capture_full_request: bool,
    pub request: RequestDoc,
    pub response: ResponseDoc,
    #[serde(default)]
    pub metadata: MetadataDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDoc {
    pub model_path: String,
    #[serde(default)]
    pub messages_path: Option<String>,
    #[serde(default)]
    pub system_path: Option<String>,
    #[serde(default)]
    pub tools_path: Option<String>,
    #[serde(default)]
    pub thinking_path: Option<String>,
    #[serde(default)]
    pub metadata_path: Option<String>,
    #[serde(default)]
    pub session_id_path: Option<String>,
    #[serde(default)]
    pub stream_param_path: Option<String>,
    #[serde(default)]
    pub text_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseDoc {
    #[serde(default)]
    pub json: Option<ResponseJsonDoc>,
    #[serde(default)]
    pub sse: Option<ResponseSseDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseJsonDoc {
    pub input_tokens_path: String,
    #[serde(default)]
    pub input_tokens_path_alt: Vec<String>,
    pub output_tokens_path: String,
    #[serde(default)]
    pub output_tokens_path_alt: Vec<String>,
    #[serde(default)]
    pub cache_creation_tokens_path: Option<String>,
    #[serde(default)]
    pub cache_read_tokens_path: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub stop_reason_path: Option<String>,
    #[serde(default)]
    pub stop_reason_path_alt: Vec<String>,
}

/// Framing variants for streamed responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SseFormat {
    /// `data:`-framed server-sent events.
    #[default]
    Sse,
    /// Newline-delimited JSON (Gemini-style).
    JsonLines,
    /// Try SSE framing first, fall back to JSON lines.
    SseOrJsonLines,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSseDoc {
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub format: SseFormat,
    #[serde(default)]
    pub done_marker: Option<String>,
    #[serde(default)]
    pub use_last_chunk: bool,

    #[serde(default)]
    pub input_tokens_event: Option<String>,
    #[serde(default)]
    pub input_tokens_path: Option<String>,
    #[serde(default)]
    pub input_tokens_path_alt: Vec<String>,

    #[serde(default)]
    pub output_tokens_event: Option<String>,
    #[serde(default)]
    pub output_tokens_path: Option<String>,
    #[serde(default)]
    pub output_tokens_path_alt: Vec<String>,

    #[serde(default)]
    pub cache_creation_tokens_event: Option<String>,
    #[serde(default)]
    pub cache_creation_tokens_path: Option<String>,

    #[serde(default)]
    pub cache_read_tokens_event: Option<String>,
    #[serde(default)]
    pub cache_read_tokens_path: Option<String>,

    #[serde(default)]
    pub model_event: Option<String>,
    #[serde(default)]
    pub model_path: Option<String>,

    #[serde(default)]
    pub stop_reason_event: Option<String>,
    #[serde(default)]
    pub stop_reason_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataDoc {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cost_per_input_token: Option<f64>,
    #[serde(default)]
    pub cost_per_output_token: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_event_types() -> Vec<String> {
    vec!["*".to_string()]
}

// =============================================================================
// Compiled model
// =============================================================================

/// A primary path plus ordered alternates; first present match wins.
///
/// Alternates are only consulted when the primary yields nothing — an empty
/// wildcard list counts as present.
#[derive(Debug, Clone)]
pub struct PathSet {
    paths: Vec<FieldPath>,
}

impl PathSet {
    fn compile(primary: &str, alternates: &[String]) -> Result<Self> {
        let mut paths = vec![FieldPath::parse(primary)?];
        for alt in alternates {
            paths.push(FieldPath::parse(alt)?);
        }
        Ok(Self { paths })
    }

    fn compile_opt(primary: Option<&str>, alternates: &[String]) -> Result<Option<Self>> {
        match primary {
            Some(p) => Ok(Some(Self::compile(p, alternates)?)),
            None => Ok(None),
        }
    }

    /// Evaluates primary-then-alternates and returns the first present value.
    pub fn eval<'a>(&self, doc: &'a Value) -> crate::fieldpath::Extracted<'a> {
        for path in &self.paths {
            let result = path.eval(doc);
            if !result.is_none() {
                return result;
            }
        }
        crate::fieldpath::Extracted::None
    }

    /// The primary path's source expression (for diagnostics).
    pub fn primary_source(&self) -> &str {
        self.paths[0].source()
    }
}

/// Compiled request-side extraction paths.
#[derive(Debug, Clone)]
pub struct RequestPaths {
    pub model: FieldPath,
    pub messages: Option<FieldPath>,
    pub system: Option<FieldPath>,
    pub tools: Option<FieldPath>,
    pub thinking: Option<FieldPath>,
    pub metadata: Option<FieldPath>,
    pub session_id: Option<FieldPath>,
    pub stream_param: Option<FieldPath>,
    pub text_fields: Vec<FieldPath>,
}

/// Compiled JSON-response extraction paths.
#[derive(Debug, Clone)]
pub struct ResponseJsonPaths {
    pub input_tokens: PathSet,
    pub output_tokens: PathSet,
    pub cache_creation_tokens: Option<FieldPath>,
    pub cache_read_tokens: Option<FieldPath>,
    pub model: Option<FieldPath>,
    pub stop_reason: Option<PathSet>,
}

/// Compiled SSE extraction profile.
#[derive(Debug, Clone)]
pub struct ResponseSsePaths {
    pub event_types: Vec<String>,
    pub format: SseFormat,
    pub done_marker: Option<String>,
    pub use_last_chunk: bool,
    pub input_tokens_event: Option<String>,
    pub input_tokens: Option<PathSet>,
    pub output_tokens_event: Option<String>,
    pub output_tokens: Option<PathSet>,
    pub cache_creation_tokens_event: Option<String>,
    pub cache_creation_tokens: Option<FieldPath>,
    pub cache_read_tokens_event: Option<String>,
    pub cache_read_tokens: Option<FieldPath>,
    pub model_event: Option<String>,
    pub model: Option<FieldPath>,
    pub stop_reason_event: Option<String>,
    pub stop_reason: Option<FieldPath>,
}

/// Immutable, compiled definition of one provider.
#[derive(Debug, Clone)]
pub struct ProviderDefinition {
    pub id: String,
    pub enabled: bool,
    pub domains: Vec<String>,
    pub api_patterns: Vec<String>,
    pub capture_full_request: bool,
    pub request: RequestPaths,
    pub response_json: Option<ResponseJsonPaths>,
    pub response_sse: Option<ResponseSsePaths>,
    pub tags: Vec<String>,
    pub cost_per_input_token: Option<f64>,
    pub cost_per_output_token: Option<f64>,
}

impl ProviderDefinition {
    fn compile(id: &str, doc: &ProviderDoc) -> Result<Self> {
        let request = RequestPaths {
            model: FieldPath::parse(&doc.request.model_path)?,
            messages: compile_opt(doc.request.messages_path.as_deref())?,
            system: compile_opt(doc.request.system_path.as_deref())?,
            tools: compile_opt(doc.request.tools_path.as_deref())?,
            thinking: compile_opt(doc.request.thinking_path.as_deref())?,
            metadata: compile_opt(doc.request.metadata_path.as_deref())?,
            session_id: compile_opt(doc.request.session_id_path.as_deref())?,
            stream_param: compile_opt(doc.request.stream_param_path.as_deref())?,
            text_fields: doc
                .request
                .text_fields
                .iter()
                .map(|p| FieldPath::parse(p))
                .collect::<Result<Vec<_>>>()?,
        };

        let response_json = match &doc.response.json {
            Some(j) => Some(ResponseJsonPaths {
                input_tokens: PathSet::compile(&j.input_tokens_path, &j.input_tokens_path_alt)?,
                output_tokens: PathSet::compile(&j.output_tokens_path, &j.output_tokens_path_alt)?,
                cache_creation_tokens: compile_opt(j.cache_creation_tokens_path.as_deref())?,
                cache_read_tokens: compile_opt(j.cache_read_tokens_path.as_deref())?,
                model: compile_opt(j.model_path.as_deref())?,
                stop_reason: PathSet::compile_opt(
                    j.stop_reason_path.as_deref(),
                    &j.stop_reason_path_alt,
                )?,
            }),
            None => None,
        };

        let response_sse = match &doc.response.sse {
            Some(s) => Some(ResponseSsePaths {
                event_types: s.event_types.clone(),
                format: s.format,
                done_marker: s.done_marker.clone(),
                use_last_chunk: s.use_last_chunk,
                input_tokens_event: s.input_tokens_event.clone(),
                input_tokens: PathSet::compile_opt(
                    s.input_tokens_path.as_deref(),
                    &s.input_tokens_path_alt,
                )?,
                output_tokens_event: s.output_tokens_event.clone(),
                output_tokens: PathSet::compile_opt(
                    s.output_tokens_path.as_deref(),
                    &s.output_tokens_path_alt,
                )?,
                cache_creation_tokens_event: s.cache_creation_tokens_event.clone(),
                cache_creation_tokens: compile_opt(s.cache_creation_tokens_path.as_deref())?,
                cache_read_tokens_event: s.cache_read_tokens_event.clone(),
                cache_read_tokens: compile_opt(s.cache_read_tokens_path.as_deref())?,
                model_event: s.model_event.clone(),
                model: compile_opt(s.model_path.as_deref())?,
                stop_reason_event: s.stop_reason_event.clone(),
                stop_reason: compile_opt(s.stop_reason_path.as_deref())?,
            }),
            None => None,
        };

        if response_json.is_none() && response_sse.is_none() {
            return Err(ConfigError::Validation(format!(
                "provider '{id}': at least one of response.json or response.sse is required"
            ))
            .into());
        }

        Ok(Self {
            id: id.to_string(),
            enabled: doc.enabled,
            domains: doc.domains.iter().map(|d| d.to_lowercase()).collect(),
            api_patterns: doc
                .api_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            capture_full_request: doc.capture_full_request,
            request,
            response_json,
            response_sse,
            tags: doc.metadata.tags.clone(),
            cost_per_input_token: doc.metadata.cost_per_input_token,
            cost_per_output_token: doc.metadata.cost_per_output_token,
        })
    }

    /// True when the request path matches one of the provider's LLM API
    /// patterns (case-insensitive substring).
    pub fn path_matches_api(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.api_patterns.iter().any(|p| path.contains(p))
    }
}

fn compile_opt(expr: Option<&str>) -> Result<Option<FieldPath>> {
    expr.map(FieldPath::parse).transpose()
}

// =============================================================================
// Registry
// =============================================================================

/// Immutable snapshot of the loaded provider set.
#[derive(Debug)]
pub struct ProviderRegistry {
    capture_mode: CaptureMode,
    providers: HashMap<String, Arc<ProviderDefinition>>,
    by_domain: HashMap<String, String>,
    /// The merged source document, for serialise-and-reload round trips.
    source: ProvidersDoc,
}

impl ProviderRegistry {
    /// Compiles a registry from a merged document value.
    pub fn from_value(value: Value) -> Result<Self> {
        let doc: ProvidersDoc = serde_json::from_value(value)?;
        Self::from_doc(doc)
    }

    /// Compiles a registry from a parsed document.
    pub fn from_doc(doc: ProvidersDoc) -> Result<Self> {
        let mut providers = HashMap::new();
        let mut by_domain: HashMap<String, String> = HashMap::new();

        for (id, pdoc) in &doc.providers {
            let def = ProviderDefinition::compile(id, pdoc)?;
            if def.enabled && id != UNKNOWN_PROVIDER {
                for domain in &def.domains {
                    if let Some(existing) = by_domain.insert(domain.clone(), id.clone()) {
                        return Err(ConfigError::Validation(format!(
                            "domain '{domain}' claimed by both '{existing}' and '{id}'"
                        ))
                        .into());
                    }
                }
            }
            providers.insert(id.clone(), Arc::new(def));
        }

        Ok(Self {
            capture_mode: doc.capture_mode,
            providers,
            by_domain,
            source: doc,
        })
    }

    /// Loads the bundled default configuration.
    pub fn bundled() -> Result<Self> {
        Self::from_value(serde_json::from_str(BUNDLED_PROVIDERS)?)
    }

    /// Loads and deep-merges the primary and optional override layers.
    pub fn load(primary: &Path, override_path: Option<&Path>) -> Result<Self> {
        let mut merged: Value = serde_json::from_str(&std::fs::read_to_string(primary)?)?;

        if let Some(op) = override_path {
            if op.exists() {
                let override_doc: Value = serde_json::from_str(&std::fs::read_to_string(op)?)?;
                merged = deep_merge(merged, override_doc);
                tracing::info!(path = %op.display(), "merged operator provider overrides");
            }
        }

        Self::from_value(merged)
    }

    /// Resolves a (lower-cased, port-stripped) host to a provider id.
    ///
    /// Exact domain match only. Unmatched hosts yield `unknown` iff the
    /// capture mode is `capture_all` and an enabled `unknown` profile exists.
    pub fn resolve(&self, host: &str) -> Option<&str> {
        let host = host.split(':').next().unwrap_or(host).to_lowercase();
        if let Some(id) = self.by_domain.get(&host) {
            return Some(id.as_str());
        }
        if self.capture_mode == CaptureMode::CaptureAll {
            if let Some(unknown) = self.providers.get(UNKNOWN_PROVIDER) {
                if unknown.enabled {
                    return Some(UNKNOWN_PROVIDER);
                }
            }
        }
        None
    }

    /// Looks up a provider definition by id.
    pub fn get(&self, id: &str) -> Option<Arc<ProviderDefinition>> {
        self.providers.get(id).cloned()
    }

    /// The process-wide capture mode.
    pub fn capture_mode(&self) -> CaptureMode {
        self.capture_mode
    }

    /// Number of configured providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when no providers are configured.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// The merged source document.
    pub fn source(&self) -> &ProvidersDoc {
        &self.source
    }
}

/// Deep merge: objects merge recursively, everything else is replaced by the
/// override value. Arrays are replaced wholesale.
pub fn deep_merge(base: Value, override_value: Value) -> Value {
    match (base, override_value) {
        (Value::Object(mut base_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Object(base_map)
        }
        (_, override_value) => override_value,
    }
}

// =============================================================================
// Reloadable handle
// =============================================================================

/// Shared handle over the current registry snapshot.
///
/// Readers take the current `Arc` at request time and keep it for the life
/// of the flow; reload installs a new snapshot without touching in-flight
/// flows. A failed reload keeps the previous snapshot.
#[derive(Clone)]
pub struct RegistryHandle {
    current: Arc<RwLock<Arc<ProviderRegistry>>>,
    primary: Option<PathBuf>,
    override_path: Option<PathBuf>,
}

impl std::fmt::Debug for RegistryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryHandle")
            .field("providers", &self.snapshot().len())
            .field("primary", &self.primary)
            .field("override_path", &self.override_path)
            .finish()
    }
}

impl RegistryHandle {
    /// Wraps an already-built registry with no backing files (reload is a
    /// no-op beyond re-validating the bundled config).
    pub fn from_registry(registry: ProviderRegistry) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
            primary: None,
            override_path: None,
        }
    }

    /// Loads from the given file layers and remembers them for reload.
    pub fn from_files(primary: PathBuf, override_path: Option<PathBuf>) -> Result<Self> {
        let registry = ProviderRegistry::load(&primary, override_path.as_deref())?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(registry))),
            primary: Some(primary),
            override_path,
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ProviderRegistry> {
        self.current.read().clone()
    }

    /// Re-reads the config layers and atomically swaps the snapshot in.
    ///
    /// On failure the running snapshot is untouched and the error returned.
    pub fn reload(&self) -> Result<()> {
        let rebuilt = match &self.primary {
            Some(primary) => ProviderRegistry::load(primary, self.override_path.as_deref())?,
            None => ProviderRegistry::bundled()?,
        };
        *self.current.write() = Arc::new(rebuilt);
        tracing::info!("provider registry reloaded");
        Ok(())
    }
}
