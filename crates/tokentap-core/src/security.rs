//! Security gate: bind policy, capture policy, admin token.
//!
//! Three operator-controlled switches persisted as owner-only state files:
//!
//! - `network_mode` — `local` binds every listener to 127.0.0.1, `network`
//!   binds 0.0.0.0 and logs a WARN banner at startup.
//! - `debug_mode` — `off` redacts message content and drops raw payloads,
//!   `on` captures everything and logs a WARN banner.
//! - `admin.token` — 32 random bytes (hex) required by destructive dashboard
//!   endpoints; generated on first access, mode 0600 enforced.
//!
//! Flow hooks sample the gate through atomics; changes apply to the next
//! flow, never retroactively.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::SecurityError;

const NETWORK_MODE_FILE: &str = "network_mode";
const DEBUG_MODE_FILE: &str = "debug_mode";
const ADMIN_TOKEN_FILE: &str = "admin.token";

/// Listener bind policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Local,
    Network,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Local => "local",
            NetworkMode::Network => "network",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "local" => Some(NetworkMode::Local),
            "network" => Some(NetworkMode::Network),
            _ => None,
        }
    }

    /// The IP every listener binds under this mode.
    pub fn bind_ip(&self) -> IpAddr {
        match self {
            NetworkMode::Local => IpAddr::V4(Ipv4Addr::LOCALHOST),
            NetworkMode::Network => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Payload capture policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    On,
    Off,
}

impl DebugMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebugMode::On => "on",
            DebugMode::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "on" => Some(DebugMode::On),
            "off" => Some(DebugMode::Off),
            _ => None,
        }
    }
}

/// The process-wide security gate.
#[derive(Debug, Clone)]
pub struct SecurityGate {
    state_dir: PathBuf,
    network: Arc<AtomicBool>,
    debug: Arc<AtomicBool>,
}

impl SecurityGate {
    /// Loads the gate from the state directory, creating defaults
    /// (`local`, `off`) on first run. Emits the WARN banners.
    pub fn load(state_dir: impl AsRef<Path>) -> Result<Self, SecurityError> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir)?;

        let network_mode = read_mode(&state_dir.join(NETWORK_MODE_FILE))
            .and_then(|s| NetworkMode::parse(&s))
            .unwrap_or(NetworkMode::Local);
        let debug_mode = read_mode(&state_dir.join(DEBUG_MODE_FILE))
            .and_then(|s| DebugMode::parse(&s))
            .unwrap_or(DebugMode::Off);

        if network_mode == NetworkMode::Network {
            tracing::warn!(
                "network mode is 'network': listeners bind 0.0.0.0 and are reachable from other hosts"
            );
        }
        if debug_mode == DebugMode::On {
            tracing::warn!(
                "debug mode is ON: raw request/response payloads and unredacted message content will be stored"
            );
        }

        Ok(Self {
            state_dir,
            network: Arc::new(AtomicBool::new(network_mode == NetworkMode::Network)),
            debug: Arc::new(AtomicBool::new(debug_mode == DebugMode::On)),
        })
    }

    /// Loads from the default tokentap state directory.
    pub fn load_default() -> Result<Self, SecurityError> {
        Self::load(default_state_dir()?)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn network_mode(&self) -> NetworkMode {
        if self.network.load(Ordering::Relaxed) {
            NetworkMode::Network
        } else {
            NetworkMode::Local
        }
    }

    pub fn debug_mode(&self) -> DebugMode {
        if self.debug.load(Ordering::Relaxed) {
            DebugMode::On
        } else {
            DebugMode::Off
        }
    }

    /// Convenience for the capture-policy check in flow hooks.
    pub fn debug_capture(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Persists and applies a new network mode (effective for new listeners).
    pub fn set_network_mode(&self, mode: NetworkMode) -> Result<(), SecurityError> {
        write_owner_only(&self.state_dir.join(NETWORK_MODE_FILE), mode.as_str())?;
        self.network
            .store(mode == NetworkMode::Network, Ordering::Relaxed);
        tracing::info!(mode = mode.as_str(), "network mode updated");
        Ok(())
    }

    /// Persists and applies a new debug mode (effective for the next flow).
    pub fn set_debug_mode(&self, mode: DebugMode) -> Result<(), SecurityError> {
        write_owner_only(&self.state_dir.join(DEBUG_MODE_FILE), mode.as_str())?;
        self.debug.store(mode == DebugMode::On, Ordering::Relaxed);
        tracing::info!(mode = mode.as_str(), "debug mode updated");
        Ok(())
    }

    /// Reads the admin token, generating it on first access.
    ///
    /// Refuses to proceed when the token file is readable by other users.
    pub fn admin_token(&self) -> Result<String, SecurityError> {
        let path = self.state_dir.join(ADMIN_TOKEN_FILE);

        if path.exists() {
            check_owner_only(&path)?;
            let token = fs::read_to_string(&path)?.trim().to_string();
            if !token.is_empty() {
                return Ok(token);
            }
        }

        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = hex_encode(&bytes);
        write_owner_only(&path, &token)?;
        tracing::info!(path = %path.display(), "generated admin token");
        Ok(token)
    }

    /// Verifies a presented admin token.
    pub fn verify_admin_token(&self, presented: &str) -> Result<bool, SecurityError> {
        Ok(self.admin_token()? == presented)
    }
}

/// Default state directory (`~/.local/share/tokentap` style, per platform).
pub fn default_state_dir() -> Result<PathBuf, SecurityError> {
    directories::ProjectDirs::from("io", "tokentap", "tokentap")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(SecurityError::NoStateDir)
}

fn read_mode(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn write_owner_only(path: &Path, contents: &str) -> Result<(), SecurityError> {
    fs::write(path, format!("{contents}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn check_owner_only(path: &Path) -> Result<(), SecurityError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(SecurityError::TokenPermissions {
                path: path.display().to_string(),
                mode,
            });
        }
    }
    Ok(())
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
