//! Daemon configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "GPG_BRIDGE_CONFIG";

/// Per-user state directory under `$HOME`.
const STATE_DIR: &str = ".gpg-bridge";

/// Daemon configuration loaded from `~/.gpg-bridge/config.toml`.
///
/// Every field is optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub tls: TlsConfig,
    pub gpg: GpgConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    /// Listen address. Only loopback clients are admitted to the WebSocket
    /// whatever this is set to.
    pub bind: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: gpg_bridge_core::DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    /// Directory holding the key and certificate. Defaults to
    /// `~/.gpg-bridge/cert`.
    pub cert_dir: Option<PathBuf>,
    /// Generate a self-signed pair when the directory has none.
    pub generate: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_dir: None,
            generate: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpgConfig {
    /// Explicit gpg binary; skips discovery.
    pub path: Option<PathBuf>,
    /// Parent for the per-process temp directory. Defaults to the system
    /// temp directory.
    pub temp_dir: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.tls
            .cert_dir
            .clone()
            .unwrap_or_else(|| state_dir().join("cert"))
    }
}

fn state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(STATE_DIR)
}

pub fn parse_config(contents: &str) -> Result<BridgeConfig, toml_edit::de::Error> {
    toml_edit::de::from_str(contents)
}

/// Load the config from `explicit`, `$GPG_BRIDGE_CONFIG`, or
/// `~/.gpg-bridge/config.toml`, in that order.
///
/// A missing file yields defaults; an unreadable or invalid one yields
/// defaults with a warning.
pub fn load_config(explicit: Option<&Path>) -> BridgeConfig {
    let path = explicit.map(Path::to_path_buf).unwrap_or_else(|| {
        std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| state_dir().join("config.toml"))
    });

    let config = match std::fs::read_to_string(&path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => {
                info!("loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("failed to parse config {}: {e}", path.display());
                BridgeConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no config file at {}, using defaults", path.display());
            BridgeConfig::default()
        }
        Err(e) => {
            warn!("failed to read config {}: {e}", path.display());
            BridgeConfig::default()
        }
    };

    if !config.server.bind.is_loopback() {
        warn!(
            "listening on non-loopback address {}; remote WebSocket clients will still be refused",
            config.server.bind
        );
    }
    config
}
