//! Device identity resolution.
//!
//! Events are grouped by a stable device id, resolved in priority order:
//!
//! 1. a provider-declared session id found in the request body,
//! 2. a `device_id` field in the request's telemetry metadata,
//! 3. a fingerprint hash of `client_ip || os_token || user_agent_token`.
//!
//! The fingerprint is stable for a single machine but shifts when the IP or
//! user agent changes; stronger identity would require client cooperation
//! the proxy cannot assume.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::extract::RequestDigest;

/// Resolved device identity attached to each event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable grouping id (tiered resolution above).
    pub id: String,
    /// Provider session id, when the request carried one.
    pub session_id: Option<String>,
    /// OS token parsed from the user agent (`other` when unknown).
    pub os: String,
    /// Client IP as observed by the proxy.
    pub ip: String,
    /// Raw user agent.
    pub user_agent: String,
    /// Browser token, if the user agent looks like one.
    pub browser: Option<String>,
}

/// Resolves the device identity for a flow.
pub fn resolve_device(digest: &RequestDigest, client_ip: &str, user_agent: &str) -> DeviceInfo {
    let os = os_token(user_agent).to_string();

    let id = digest
        .session_id
        .clone()
        .or_else(|| telemetry_device_id(digest))
        .unwrap_or_else(|| fingerprint(client_ip, &os, ua_token(user_agent)));

    DeviceInfo {
        id,
        session_id: digest.session_id.clone(),
        os,
        ip: client_ip.to_string(),
        user_agent: user_agent.to_string(),
        browser: browser_token(user_agent).map(str::to_string),
    }
}

fn telemetry_device_id(digest: &RequestDigest) -> Option<String> {
    digest
        .metadata
        .as_ref()
        .and_then(|m| m.get("device_id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// First 16 bytes of SHA-256 over `ip || os || ua_token`, hex-encoded.
pub fn fingerprint(client_ip: &str, os: &str, ua_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(client_ip.as_bytes());
    hasher.update(os.as_bytes());
    hasher.update(ua_token.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest[..16])
}

/// OS token parsed from the user agent.
pub fn os_token(user_agent: &str) -> &'static str {
    let ua = user_agent.to_lowercase();
    if ua.contains("darwin") || ua.contains("mac os") || ua.contains("macos") {
        "macos"
    } else if ua.contains("windows") || ua.contains("win32") || ua.contains("win64") {
        "windows"
    } else if ua.contains("linux") {
        "linux"
    } else {
        "other"
    }
}

/// Browser token, when the user agent looks like a browser.
pub fn browser_token(user_agent: &str) -> Option<&'static str> {
    let ua = user_agent.to_lowercase();
    if ua.contains("edg/") {
        Some("edge")
    } else if ua.contains("firefox/") {
        Some("firefox")
    } else if ua.contains("chrome/") {
        Some("chrome")
    } else if ua.contains("safari/") {
        Some("safari")
    } else {
        None
    }
}

/// The product token the fingerprint keys on: everything before the first
/// space, so version bumps within a release line do not churn identities
/// less than UA rewrites do.
fn ua_token(user_agent: &str) -> &str {
    user_agent.split_whitespace().next().unwrap_or("")
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_takes_priority() {
        let digest = RequestDigest {
            session_id: Some("session-xyz".to_string()),
            metadata: Some(json!({"device_id": "dev-1"})),
            ..Default::default()
        };
        let device = resolve_device(&digest, "127.0.0.1", "claude-code/2.0 (darwin)");
        assert_eq!(device.id, "session-xyz");
        assert_eq!(device.session_id.as_deref(), Some("session-xyz"));
    }

    #[test]
    fn telemetry_device_id_is_second_tier() {
        let digest = RequestDigest {
            metadata: Some(json!({"device_id": "dev-1"})),
            ..Default::default()
        };
        let device = resolve_device(&digest, "127.0.0.1", "curl/8.0");
        assert_eq!(device.id, "dev-1");
    }

    #[test]
    fn fingerprint_is_stable_and_32_hex_chars() {
        let a = fingerprint("10.0.0.5", "linux", "curl/8.0");
        let b = fingerprint("10.0.0.5", "linux", "curl/8.0");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_shifts_with_ip_or_ua() {
        let base = fingerprint("10.0.0.5", "linux", "curl/8.0");
        assert_ne!(base, fingerprint("10.0.0.6", "linux", "curl/8.0"));
        assert_ne!(base, fingerprint("10.0.0.5", "linux", "wget/1.21"));
    }

    #[test]
    fn os_token_parsing() {
        assert_eq!(os_token("claude-code/2.0 (darwin; arm64)"), "macos");
        assert_eq!(os_token("Mozilla/5.0 (Windows NT 10.0)"), "windows");
        assert_eq!(os_token("curl/8.0 (x86_64-pc-linux-gnu)"), "linux");
        assert_eq!(os_token("weird-agent/1.0"), "other");
    }

    #[test]
    fn browser_detection() {
        assert_eq!(
            browser_token("Mozilla/5.0 ... Chrome/120.0 Safari/537.36"),
            Some("chrome")
        );
        assert_eq!(browser_token("Mozilla/5.0 ... Firefox/121.0"), Some("firefox"));
        assert_eq!(browser_token("claude-code/2.0"), None);
    }

    #[test]
    fn fallback_fingerprint_used_without_identifiers() {
        let digest = RequestDigest::default();
        let device = resolve_device(&digest, "192.168.1.7", "curl/8.0 (linux)");
        assert_eq!(device.id.len(), 32);
        assert_eq!(device.os, "linux");
        assert!(device.session_id.is_none());
    }
}
