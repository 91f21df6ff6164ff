//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Root CA error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider configuration error.
    #[error("config error: {0}")]
    Config(#[from] tokentap_core::ConfigError),

    /// Security gate error.
    #[error("security error: {0}")]
    Security(#[from] tokentap_core::SecurityError),

    /// Proxy server error.
    #[error("proxy error: {0}")]
    Proxy(String),
}

/// Root CA provisioning errors.
#[derive(Debug, Error)]
pub enum CaError {
    /// Root key or certificate could not be generated.
    #[error("could not generate root certificate: {0}")]
    Generate(String),

    /// Root material could not be read or written.
    #[error("could not access CA material: {0}")]
    Io(#[from] std::io::Error),

    /// Stored root material did not parse.
    #[error("stored CA material is invalid: {0}")]
    Invalid(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
