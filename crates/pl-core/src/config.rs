//! Configuration management for PortLink
//!
//! Holds the peer link settings that can be overridden from a TOML file and
//! the fixed timeouts of the tunnel layer.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PortLinkError, Result};

/// Timeout for dialing a backend service on the server side
pub const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an accepted client connection waits for a connected link
pub const LINK_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a waiting connection re-checks the active link
pub const LINK_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a freshly requested virtual stream may stay unopened
pub const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between client connection attempts
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Receive MTU for the peer transport. Keeps datagrams below common
/// fragmentation thresholds on paths crossing ISPs.
pub const DEFAULT_RECEIVE_MTU: usize = 1200;

/// Public STUN servers used for address discovery
pub const DEFAULT_ICE_SERVERS: [&str; 4] = [
    "stun:stun.hot-chilli.net:3478",
    "stun:stun.miwifi.com:3478",
    "stun:stun.cdnbye.com:3478",
    "stun:fwa.lifesizecloud.com:3478",
];

/// Peer link configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// ICE server URLs (`stun:` or `turn:`)
    pub ice_servers: Vec<String>,

    /// Receive MTU for the underlying datagram transport
    pub receive_mtu: usize,

    /// Regular expressions; local candidates whose address matches any of
    /// them are never advertised to the peer
    pub exclude_candidates: Vec<String>,

    /// Server only: send a PROXY protocol header carrying the client's
    /// address to every backend connection
    pub proxy_protocol: bool,

    /// Enable debug logging
    pub debug: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            receive_mtu: DEFAULT_RECEIVE_MTU,
            exclude_candidates: Vec::new(),
            proxy_protocol: false,
            debug: false,
        }
    }
}

impl LinkConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PortLinkError::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file at `path`, or the default location when `path` is
    /// `None`. A missing default file yields the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_config_path();
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Saves configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents =
            toml::to_string_pretty(self).map_err(|e| PortLinkError::ConfigError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Checks values that serde cannot
    pub fn validate(&self) -> Result<()> {
        if self.receive_mtu < 576 {
            return Err(PortLinkError::ConfigError(format!(
                "receive_mtu {} is below the 576 byte minimum",
                self.receive_mtu
            )));
        }
        for pattern in &self.exclude_candidates {
            regex::Regex::new(pattern).map_err(|e| {
                PortLinkError::ConfigError(format!("bad exclude pattern '{}': {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("portlink")
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Builder pattern: replace the ICE server list
    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Builder pattern: exclude candidates matching a pattern
    pub fn with_excluded_candidates(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_candidates.push(pattern.into());
        self
    }

    /// Builder pattern: enable the PROXY protocol header
    pub fn with_proxy_protocol(mut self, enabled: bool) -> Self {
        self.proxy_protocol = enabled;
        self
    }

    /// Builder pattern: set debug mode
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.ice_servers.len(), 4);
        assert_eq!(config.receive_mtu, 1200);
        assert!(config.exclude_candidates.is_empty());
        assert!(!config.proxy_protocol);
        assert!(!config.debug);
    }

    #[test]
    fn test_builder_pattern() {
        let config = LinkConfig::new()
            .with_ice_servers(vec!["stun:stun.example.org:3478".into()])
            .with_excluded_candidates(r"^192\.168\.")
            .with_proxy_protocol(true)
            .with_debug(true);

        assert_eq!(config.ice_servers, vec!["stun:stun.example.org:3478"]);
        assert_eq!(config.exclude_candidates.len(), 1);
        assert!(config.proxy_protocol);
        assert!(config.debug);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = LinkConfig::new().with_excluded_candidates(r"^100\.");
        config.save(&path).unwrap();

        assert_eq!(LinkConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debug = true\n").unwrap();

        let config = LinkConfig::load(&path).unwrap();
        assert!(config.debug);
        assert_eq!(config.receive_mtu, DEFAULT_RECEIVE_MTU);
        assert_eq!(config.ice_servers.len(), DEFAULT_ICE_SERVERS.len());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "exclude_candidates = [\"(unclosed\"]\n").unwrap();

        assert!(matches!(
            LinkConfig::load(&path),
            Err(PortLinkError::ConfigError(_))
        ));
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(LinkConfig::load_or_default(Some(&missing)).is_err());
    }
}
