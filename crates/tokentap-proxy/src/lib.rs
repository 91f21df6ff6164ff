//! Tokentap Proxy - TLS-terminating interception for LLM API traffic.
//!
//! This crate owns the MITM side of the sidecar: the root CA, the per-flow
//! controller, and the server lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! client --TLS--> MITM engine --request hook--> FlowController
//!      resolve provider -> extract digest -> context/device -> flow state
//! MITM engine --response--> FlowController
//!      buffered: decode + extract usage
//!      streamed: forwarding byte tap feeds the accumulator
//! FlowController assembles Event -> EventSink (non-blocking)
//! ```
//!
//! Forwarding is never impeded by extraction: every failure path degrades
//! to passthrough, and no internal error reaches the client.

mod ca;
mod error;
mod handler;
mod proxy;

pub use ca::{CaError, CertAuthority};
pub use error::{ProxyError, Result};
pub use handler::{FlowController, HandlerConfig};
pub use proxy::{
    ProxyConfig, ProxyHandle, ProxyServer, Sidecar, DEFAULT_PROXY_PORT, DEFAULT_SHUTDOWN_GRACE,
};
