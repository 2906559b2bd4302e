//! Node configuration: TOML file + CLI overrides.

use lattice_core::{LatticeError, LatticeResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub keep_alive: KeepAliveSection,
    #[serde(default)]
    pub session: SessionSection,
    /// Peers to attach to at startup.
    #[serde(default)]
    pub servers: Vec<ServerEntrySection>,
}

/// `[node]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable URL of this node. Defaults to
    /// `http://127.0.0.1:{port}` when empty.
    #[serde(default)]
    pub host_name: String,
    #[serde(default = "default_name")]
    pub name: String,
    /// Serve over HTTPS; controls the `Secure` cookie attribute.
    #[serde(default)]
    pub secure: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            host_name: String::new(),
            name: default_name(),
            secure: false,
        }
    }
}

/// `[gateway]` section: credentials this node accepts from peers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewaySection {
    /// Shared secret peers must present when attaching. Peer attachment is
    /// refused outright when unset.
    #[serde(default)]
    pub passkey: Option<String>,
    /// When set, an attaching peer presenting it is auto-registered back as
    /// a remote of this node.
    #[serde(default)]
    pub auto_attach_passkey: Option<String>,
}

/// `[keep_alive]` section: peer liveness probing and call deadlines.
#[derive(Debug, Clone, Deserialize)]
pub struct KeepAliveSection {
    #[serde(default = "default_ka_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_ka_retry")]
    pub retry_ms: u64,
    #[serde(default = "default_ka_max_retries")]
    pub max_retries: u32,
    /// Deadline for a forwarded call before a synthetic 504. Zero disables.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl Default for KeepAliveSection {
    fn default() -> Self {
        Self {
            interval_ms: default_ka_interval(),
            retry_ms: default_ka_retry(),
            max_retries: default_ka_max_retries(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Session store backend: `memory` or `none`.
    #[serde(default = "default_store")]
    pub store: String,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            store: default_store(),
        }
    }
}

/// One `[[servers]]` entry: a peer this node attaches to at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntrySection {
    pub host: String,
    pub passkey: String,
    /// Maintain a live WebSocket link.
    #[serde(default)]
    pub live: bool,
    /// Mirror the peer's dictionary into this node's registry.
    #[serde(default)]
    pub replica: bool,
    #[serde(default)]
    pub config_name: Option<String>,
}

fn default_port() -> u16 {
    3000
}
fn default_name() -> String {
    "lattice".to_string()
}
fn default_ka_interval() -> u64 {
    30_000
}
fn default_ka_retry() -> u64 {
    5_000
}
fn default_ka_max_retries() -> u32 {
    3
}
fn default_call_timeout() -> u64 {
    30_000
}
fn default_store() -> String {
    "memory".to_string()
}

/// Resolved node configuration (CLI overrides applied, host name computed).
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub port: u16,
    pub host_name: String,
    pub name: String,
    pub secure: bool,
    pub gateway_passkey: Option<String>,
    pub auto_attach_passkey: Option<String>,
    pub keep_alive_interval: Duration,
    pub keep_alive_retry: Duration,
    pub keep_alive_max_retries: u32,
    /// `None` when forwarded calls wait indefinitely.
    pub call_timeout: Option<Duration>,
    pub session_store: String,
    pub servers: Vec<ServerEntrySection>,
}

impl NodeConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_host_name: Option<&str>,
        cli_passkey: Option<&str>,
    ) -> LatticeResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| LatticeError::Config(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let port = cli_port.unwrap_or(file_config.node.port);
        let host_name = cli_host_name
            .map(|s| s.to_string())
            .unwrap_or(file_config.node.host_name);
        let host_name = if host_name.is_empty() {
            let scheme = if file_config.node.secure {
                "https"
            } else {
                "http"
            };
            format!("{scheme}://127.0.0.1:{port}")
        } else {
            host_name
        };
        let gateway_passkey = cli_passkey
            .map(|s| s.to_string())
            .or(file_config.gateway.passkey);

        let call_timeout = match file_config.keep_alive.call_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Self {
            port,
            host_name,
            name: file_config.node.name,
            secure: file_config.node.secure,
            gateway_passkey,
            auto_attach_passkey: file_config.gateway.auto_attach_passkey,
            keep_alive_interval: Duration::from_millis(file_config.keep_alive.interval_ms),
            keep_alive_retry: Duration::from_millis(file_config.keep_alive.retry_ms),
            keep_alive_max_retries: file_config.keep_alive.max_retries,
            call_timeout,
            session_store: file_config.session.store,
            servers: file_config.servers,
        })
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig::load(None, None, None, None).expect("defaults are valid")
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}
