use std::collections::HashMap;
use std::fs;
use std::hash::Hash;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use serde::Deserialize;

use crate::error::{Result, SleuthError};
use crate::features::{FeatureTables, ProtocolTable, ServiceTable};
use crate::matcher::DEFAULT_TOLERANCE_MS;

/// Configuration file structure
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub labels: LabelConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    /// Port to service-name overrides, e.g. `9000 = "http"`
    #[serde(default)]
    pub services: HashMap<String, String>,
    /// Protocol-number to name overrides, e.g. `132 = "sctp"`
    #[serde(default)]
    pub protocols: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MatchingConfig {
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LabelConfig {
    /// Comma-separated attacker addresses or networks
    #[serde(default)]
    pub attacker_ips: String,
    #[serde(default)]
    pub normal_ips: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Stop reading a capture after this many packets
    #[serde(default)]
    pub max_packets: Option<u64>,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub delete_processed: bool,
}

// Default value helper functions
fn default_true() -> bool {
    true
}
fn default_tolerance_ms() -> u64 {
    DEFAULT_TOLERANCE_MS
}
fn default_max_pending() -> usize {
    50
}
fn default_settle_secs() -> u64 {
    10
} // skip files written to in the last 10 seconds
fn default_poll_interval() -> u64 {
    10
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            tolerance_ms: default_tolerance_ms(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_packets: None,
            max_pending: default_max_pending(),
            settle_secs: default_settle_secs(),
            poll_interval_secs: default_poll_interval(),
            delete_processed: default_true(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {:?}", path);
        let content = fs::read_to_string(path).map_err(|e| SleuthError::io(path, e))?;
        toml::from_str(&content).map_err(|source| SleuthError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Built-in lookup tables with this config's overrides applied.
    /// Override keys that are not valid numbers are ignored with a warning.
    pub fn feature_tables(&self) -> FeatureTables {
        FeatureTables {
            protocols: ProtocolTable::with_overrides(&numeric_keys(&self.protocols, "protocols")),
            services: ServiceTable::with_overrides(&numeric_keys(&self.services, "services")),
        }
    }
}

fn numeric_keys<K: FromStr + Eq + Hash>(table: &HashMap<String, String>, section: &str) -> HashMap<K, String> {
    table
        .iter()
        .filter_map(|(key, name)| match key.trim().parse::<K>() {
            Ok(k) => Some((k, name.clone())),
            Err(_) => {
                warn!("Ignoring [{}] entry with non-numeric key '{}'", section, key);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.matching.tolerance_ms, 5000);
        assert_eq!(config.capture.max_pending, 50);
        assert!(config.capture.delete_processed);
        assert!(config.capture.max_packets.is_none());
    }

    #[test]
    fn test_load_full_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[matching]
tolerance_ms = 2500

[labels]
attacker_ips = "192.168.1.100, 192.168.1.101"
normal_ips = "192.168.1.200"

[capture]
max_packets = 1000000
max_pending = 5

[services]
9000 = "http_9000"

[protocols]
132 = "sctp"
"#
        )
        .unwrap();
        file.flush().unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.matching.tolerance_ms, 2500);
        assert_eq!(config.labels.normal_ips, "192.168.1.200");
        assert_eq!(config.capture.max_packets, Some(1_000_000));
        assert_eq!(config.capture.max_pending, 5);
        assert_eq!(config.capture.settle_secs, 10);

        let tables = config.feature_tables();
        assert_eq!(tables.services.lookup(9000), "http_9000");
        assert_eq!(tables.services.lookup(22), "ssh");
        assert_eq!(tables.protocols.lookup(132), "sctp");
    }

    #[test]
    fn test_non_numeric_override_keys_ignored() {
        let config: Config =
            toml::from_str("[services]\nweb = \"http\"\n8888 = \"http\"\n").unwrap();
        let tables = config.feature_tables();
        assert_eq!(tables.services.lookup(8888), "http");
        assert_eq!(tables.services.lookup(9999), "other");
    }

    #[test]
    fn test_bad_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[matching]\ntolerance_ms = \"soon\"").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(SleuthError::Config { .. })
        ));
        assert!(matches!(
            Config::load(Path::new("/nonexistent/flow-sleuth.toml")),
            Err(SleuthError::Io { .. })
        ));
    }
}
