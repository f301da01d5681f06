//! Configuration file parsing (`confsync.toml`, `confsync-server.toml`)
//!
//! Both files are optional: a missing file yields the defaults below, and
//! command-line flags override whatever was loaded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::Compression;
use crate::error::{Error, Result};

/// Client config file name
pub const CLIENT_CONFIG_FILE: &str = "confsync.toml";

/// Server config file name
pub const SERVER_CONFIG_FILE: &str = "confsync-server.toml";

/// Well-known server port
pub const DEFAULT_PORT: u16 = 50051;

/// Seconds between push-loop scans, always within `1..=120`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ScanInterval(u64);

impl ScanInterval {
    pub const MIN_SECS: u64 = 1;
    pub const MAX_SECS: u64 = 120;

    /// Validate an interval in seconds
    ///
    /// # Errors
    /// Returns [`Error::InvalidInterval`] outside `1..=120`.
    pub fn new(secs: u64) -> Result<Self> {
        if (Self::MIN_SECS..=Self::MAX_SECS).contains(&secs) {
            Ok(Self(secs))
        } else {
            Err(Error::InvalidInterval(secs))
        }
    }

    #[must_use]
    pub fn secs(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for ScanInterval {
    fn default() -> Self {
        Self(10)
    }
}

impl TryFrom<u64> for ScanInterval {
    type Error = Error;

    fn try_from(secs: u64) -> Result<Self> {
        Self::new(secs)
    }
}

impl From<ScanInterval> for u64 {
    fn from(interval: ScanInterval) -> Self {
        interval.0
    }
}

/// Sync client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Local directory mirrored to the server
    pub root: PathBuf,
    /// Product id selecting the server subtree
    pub product: String,
    /// Server address, `host:port`
    pub server: String,
    /// Version-control reference sent with each request
    pub commit_ref: String,
    /// Seconds between scans
    #[serde(rename = "interval_secs")]
    pub interval: ScanInterval,
    pub fetch_timeout_secs: u64,
    pub apply_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Fixed delay between attempts of a failed push
    pub retry_delay_secs: u64,
    /// Raise an alert after this many consecutive failed attempts
    pub alert_after: u32,
    pub compression: Compression,
    /// Glob patterns left out of scans
    pub exclude: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/tmp"),
            product: "am".to_string(),
            server: format!("localhost:{DEFAULT_PORT}"),
            commit_ref: "master".to_string(),
            interval: ScanInterval::default(),
            fetch_timeout_secs: 120,
            apply_timeout_secs: 10,
            connect_timeout_secs: 10,
            retry_delay_secs: 10,
            alert_after: 6,
            compression: Compression::Off,
            exclude: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load from `path`, or defaults if the file doesn't exist
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        load_or_default(path)
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    #[must_use]
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Versioning settings for the server tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitConfig {
    /// Record each applied change as a commit
    pub enabled: bool,
    /// Initialize a repository at the server root if there is none
    pub init: bool,
    /// Clone this repository into the server root if there is none
    pub remote: Option<String>,
    /// Branch checked out before serving
    pub branch: Option<String>,
    /// Directory holding the `id_rsa` key used to reach `remote` over ssh
    pub ssh_dir: Option<PathBuf>,
    pub user_name: String,
    pub user_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            init: false,
            remote: None,
            branch: None,
            ssh_dir: None,
            user_name: "config-saver".to_string(),
            user_email: "config-saver@localhost".to_string(),
        }
    }
}

/// Config server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Directory holding every product subtree
    pub root: PathBuf,
    /// Listen address
    pub listen: String,
    /// Compression used for Fetch archives
    pub compression: Compression,
    /// Product id to subtree, relative to `root`
    pub products: BTreeMap<String, PathBuf>,
    pub git: GitConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("tmp/frconfig"),
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            compression: Compression::Off,
            products: BTreeMap::from([
                ("am".to_string(), PathBuf::from("docker/am/config-profiles/cdk")),
                ("idm".to_string(), PathBuf::from("docker/idm/config-profiles/cdk")),
            ]),
            git: GitConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or defaults if the file doesn't exist
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the file exists but cannot be parsed or a
    /// product subtree is not a relative path.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_or_default(path)?;
        config.validate().map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// Check that every product subtree stays below the root
    ///
    /// # Errors
    /// Returns [`Error::InvalidPath`] for the first offending subtree.
    pub fn validate(&self) -> Result<()> {
        for subtree in self.products.values() {
            crate::path::normalize(subtree)?;
        }
        Ok(())
    }
}

fn load_or_default<T>(path: &Path) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let config_error = |reason: String| Error::Config {
        path: path.to_path_buf(),
        reason,
    };
    let content = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
    toml::from_str(&content).map_err(|e| config_error(e.to_string()))
}
