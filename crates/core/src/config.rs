//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Persistent storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file path.
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
    /// How long a statement waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./var/provis.sqlite3")
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

/// What to do when two datacenters report the same machine id.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the lookup or refresh outright.
    #[default]
    Reject,
    /// Keep the record from the datacenter listed first.
    PreferFirst,
}

/// Directory cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Lifetime of a bulk snapshot before it is discarded.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Resolution of machine ids reported by more than one datacenter.
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// TCP connect timeout for datacenter requests.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for datacenter requests. A datacenter that
    /// exceeds it counts as failed for that refresh.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_ttl_secs() -> u64 {
    600 // 10 minutes
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            conflict_policy: ConflictPolicy::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl DirectoryConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject settings that would make the cache useless.
    pub fn validate(&self) -> Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("directory.ttl_secs cannot be 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("directory.request_timeout_secs cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Cloud API account and datacenter discovery.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Account (login) the machines belong to.
    pub account: String,
    /// Endpoint used to discover the list of datacenters.
    #[serde(default)]
    pub bootstrap_url: Option<String>,
    /// Static datacenter map (name -> API URL). Skips discovery when set.
    #[serde(default)]
    pub datacenters: Option<BTreeMap<String, String>>,
    /// Delay between datacenter discovery attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Bearer credential presented to the datacenter APIs.
    /// WARNING: Prefer PROVIS_CLOUD__API_TOKEN over storing it in config.
    #[serde(default)]
    pub api_token: Option<String>,
}

fn default_retry_delay_secs() -> u64 {
    5
}

impl CloudConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Either a static datacenter map or a bootstrap URL must be present.
    pub fn validate(&self) -> Result<(), String> {
        if self.account.is_empty() {
            return Err("cloud.account is required".to_string());
        }
        match (self.datacenters.as_ref(), self.bootstrap_url.as_ref()) {
            (Some(dcs), _) if dcs.is_empty() => {
                Err("cloud.datacenters is set but empty".to_string())
            }
            (Some(_), _) | (None, Some(_)) => Ok(()),
            (None, None) => {
                Err("cloud config requires either 'datacenters' or 'bootstrap_url'".to_string())
            }
        }
    }
}

/// `/etc/hosts` rendering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostsConfig {
    /// Appended to machine names for private (10/8, 192.168/16) addresses.
    #[serde(default = "default_internal_suffix")]
    pub internal_suffix: String,
    /// Appended to machine names for every other address.
    #[serde(default = "default_external_suffix")]
    pub external_suffix: String,
}

fn default_internal_suffix() -> String {
    ".int".to_string()
}

fn default_external_suffix() -> String {
    ".ext".to_string()
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            internal_suffix: default_internal_suffix(),
            external_suffix: default_external_suffix(),
        }
    }
}

/// Key-management backend (repository deploy keys).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysConfig {
    /// API base URL.
    #[serde(default = "default_keys_api_url")]
    pub api_url: String,
    /// Repository owner.
    pub owner: String,
    /// Repository the machine keys are granted to.
    pub repo: String,
    /// OAuth token.
    /// WARNING: Prefer PROVIS_KEYS__TOKEN over storing it in config.
    pub token: String,
}

fn default_keys_api_url() -> String {
    "https://api.github.com".to_string()
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    /// Cloud account configuration (required).
    pub cloud: CloudConfig,
    #[serde(default)]
    pub hosts: HostsConfig,
    /// Key-management backend (optional).
    #[serde(default)]
    pub keys: Option<KeysConfig>,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses a single static datacenter on localhost.
    pub fn for_testing() -> Self {
        let mut datacenters = BTreeMap::new();
        datacenters.insert("test-1".to_string(), "http://127.0.0.1:1".to_string());
        Self {
            storage: StorageConfig::default(),
            directory: DirectoryConfig::default(),
            cloud: CloudConfig {
                account: "test-account".to_string(),
                bootstrap_url: None,
                datacenters: Some(datacenters),
                retry_delay_secs: default_retry_delay_secs(),
                api_token: None,
            },
            hosts: HostsConfig::default(),
            keys: None,
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.directory.validate().map_err(crate::Error::Config)?;
        self.cloud.validate().map_err(crate::Error::Config)?;
        Ok(())
    }
}
