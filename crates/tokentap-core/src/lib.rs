//! Tokentap Core - provider configuration, extraction, and the event model.
//!
//! This crate carries the interception pipeline's domain logic, independent
//! of the proxy engine and the store:
//!
//! - [`fieldpath`] - compiled field-path expressions (`$.a.b[0].c[*].d`)
//! - [`provider`] - declarative provider registry with layered config
//! - [`extract`] - request digest and JSON-response usage extraction
//! - [`builtin`] - legacy per-provider extractors and the quality check
//! - [`stream`] - streaming (SSE / json-lines) usage accumulator
//! - [`context`] - program/project/session context resolution
//! - [`device`] - device identity with fingerprint fallback
//! - [`event`] - the persisted event document and redaction
//! - [`security`] - network/debug modes and the admin token
//! - [`counters`] - pipeline counters surfaced by the status endpoint

pub mod builtin;
pub mod context;
pub mod counters;
pub mod device;
pub mod error;
pub mod event;
pub mod extract;
pub mod fieldpath;
pub mod provider;
pub mod security;
pub mod stream;

pub use context::{ClientType, ContextMetadata, ContextResolver};
pub use device::DeviceInfo;
pub use error::{ConfigError, SecurityError};
pub use event::{Event, EventParts};
pub use extract::{RequestDigest, UsageDelta};
pub use provider::{CaptureMode, ProviderDefinition, ProviderRegistry, RegistryHandle};
pub use security::{DebugMode, NetworkMode, SecurityGate};
pub use stream::{StreamAccumulator, StreamOutcome, StreamRules, StreamState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_registry_resolves_known_hosts() {
        let registry = ProviderRegistry::bundled().unwrap();
        assert_eq!(registry.resolve("api.anthropic.com"), Some("anthropic"));
        assert_eq!(registry.resolve("nonsense.example"), None);
    }

    #[test]
    fn registry_handle_snapshots_are_shared() {
        let handle = RegistryHandle::from_registry(ProviderRegistry::bundled().unwrap());
        let a = handle.snapshot();
        let b = handle.snapshot();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
