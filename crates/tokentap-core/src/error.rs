//! Error types for the core pipeline.

use thiserror::Error;

/// Errors raised while loading or validating provider configuration.
///
/// Configuration errors are fail-fast at initial load; a failed reload keeps
/// the previous registry snapshot running.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading a config layer.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config document is not valid JSON.
    #[error("invalid config document: {0}")]
    Json(#[from] serde_json::Error),

    /// A field-path expression failed to compile.
    #[error("invalid field path '{expr}': {reason}")]
    FieldPath { expr: String, reason: String },

    /// Schema-level validation failure.
    #[error("invalid provider config: {0}")]
    Validation(String),
}

/// Errors raised by the security gate.
///
/// These abort startup; the process must exit non-zero rather than run with
/// a compromised secret or state file.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// IO error on a state file.
    #[error("state file error: {0}")]
    Io(#[from] std::io::Error),

    /// Admin token file is readable by other users.
    #[error("admin token file {path} has mode {mode:o}, expected owner-only (0600)")]
    TokenPermissions { path: String, mode: u32 },

    /// State directory could not be determined.
    #[error("could not determine state directory")]
    NoStateDir,
}

/// Result type for core operations.
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
