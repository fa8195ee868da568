//! Configuration types

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{settings_path, Result, SettingsError};

/// Cached responses kept before LRU eviction starts.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Well-known mainline DHT routers used when no bootstrap list is
/// configured.
pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

/// Daemon settings, stored as `settings.json` under the repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Fixed UDP port for the DHT/µTP multiplexer; unset means "last used
    /// or default".
    #[serde(default)]
    pub udp_port: Option<u16>,

    /// Local proxy endpoint the front-end listens on.
    #[serde(default = "default_listen_on_tcp")]
    pub listen_on_tcp: String,

    /// Endpoint the peer server binds; port 0 picks one.
    #[serde(default = "default_peer_listen")]
    pub peer_listen: String,

    /// `ed25519=<base64>` tag of the cache signing key whose responses we
    /// accept and serve.
    #[serde(default)]
    pub cache_public_key: Option<String>,

    /// `host:port` bootstrap nodes.
    #[serde(default = "default_bootstrap")]
    pub bootstrap: Vec<String>,

    /// Cached responses kept before eviction.
    #[serde(default = "default_capacity")]
    pub cache_capacity: usize,

    /// Announce tasks allowed in flight at once.
    #[serde(default = "default_simultaneous_announcements")]
    pub simultaneous_announcements: usize,

    /// Advertise and query cache peers on the local network.
    #[serde(default = "default_true")]
    pub local_discovery: bool,
}

fn default_listen_on_tcp() -> String {
    "127.0.0.1:8077".to_string()
}

fn default_peer_listen() -> String {
    "0.0.0.0:0".to_string()
}

fn default_bootstrap() -> Vec<String> {
    DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect()
}

fn default_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_simultaneous_announcements() -> usize {
    16
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            udp_port: None,
            listen_on_tcp: default_listen_on_tcp(),
            peer_listen: default_peer_listen(),
            cache_public_key: None,
            bootstrap: default_bootstrap(),
            cache_capacity: default_capacity(),
            simultaneous_announcements: default_simultaneous_announcements(),
            local_discovery: true,
        }
    }
}

impl Settings {
    /// Load the settings file under `repo`, or defaults when it does not
    /// exist yet. The repository directory is created if needed.
    pub fn load_or_default(repo: &Path) -> Result<Self> {
        fs::create_dir_all(repo).map_err(SettingsError::CreateDir)?;
        let path = settings_path(repo);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path).map_err(SettingsError::Read)?;
        serde_json::from_str(&raw).map_err(SettingsError::Parse)
    }

    pub fn save(&self, repo: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).map_err(SettingsError::Parse)?;
        fs::write(settings_path(repo), raw).map_err(SettingsError::Write)
    }
}
