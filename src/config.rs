//! Shardlock Configuration
//!
//! Configuration structures for the per-base election service: peer
//! identity, coordination ensemble access, and harassment-run defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main shardlock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardlockConfig {
    /// Local peer configuration
    pub peer: PeerConfig,

    /// Coordination ensemble configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Harassment-run defaults
    #[serde(default)]
    pub harass: HarassSettings,
}

/// Local peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Unique peer identifier
    pub id: String,

    /// Lease duration advertised in candidate nodes, in milliseconds
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
}

/// Coordination ensemble configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Ensemble member addresses (host:port)
    #[serde(default)]
    pub ensemble: Vec<String>,

    /// Bases this peer hosts; admin tooling pre-registers them so they can
    /// be inspected and repaired before any election ran locally
    #[serde(default)]
    pub bases: Vec<String>,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Maximum outstanding requests against the ensemble
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,

    /// Initial retry backoff in milliseconds for transient failures
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Total retry window in milliseconds before a transient failure is
    /// treated as unrecoverable
    #[serde(default = "default_retry_window_ms")]
    pub retry_window_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty or json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Defaults for the harassment driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarassSettings {
    /// Number of bases in the pool
    #[serde(default = "default_harass_bases")]
    pub bases: usize,

    /// Number of concurrent workers
    #[serde(default = "default_harass_workers")]
    pub workers: usize,

    /// Number of simulated peers
    #[serde(default = "default_harass_peers")]
    pub peers: usize,

    /// Run duration in seconds
    #[serde(default = "default_harass_duration")]
    pub duration_secs: u64,

    /// Probability in [0,1] that a hold ends in an injected fault
    #[serde(default = "default_churn_rate")]
    pub churn_rate: f64,

    /// Upper bound on post-churn convergence, in milliseconds
    #[serde(default = "default_convergence_bound_ms")]
    pub convergence_bound_ms: u64,
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_max_outstanding() -> usize {
    64
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_retry_window_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_harass_bases() -> usize {
    50
}

fn default_harass_workers() -> usize {
    20
}

fn default_harass_peers() -> usize {
    3
}

fn default_harass_duration() -> u64 {
    30
}

fn default_churn_rate() -> f64 {
    0.1
}

fn default_convergence_bound_ms() -> u64 {
    2_000
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            ensemble: Vec::new(),
            bases: Vec::new(),
            session_timeout_ms: default_session_timeout_ms(),
            max_outstanding: default_max_outstanding(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_window_ms: default_retry_window_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HarassSettings {
    fn default() -> Self {
        Self {
            bases: default_harass_bases(),
            workers: default_harass_workers(),
            peers: default_harass_peers(),
            duration_secs: default_harass_duration(),
            churn_rate: default_churn_rate(),
            convergence_bound_ms: default_convergence_bound_ms(),
        }
    }
}

impl ShardlockConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardlockConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.peer.id.is_empty() {
            return Err(crate::Error::Config("peer.id cannot be empty".into()));
        }
        if self.coordination.max_outstanding == 0 {
            return Err(crate::Error::Config(
                "coordination.max_outstanding must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.harass.churn_rate) {
            return Err(crate::Error::Config(
                "harass.churn_rate must be within [0, 1]".into(),
            ));
        }
        if self.harass.workers == 0 || self.harass.bases == 0 || self.harass.peers == 0 {
            return Err(crate::Error::Config(
                "harass.bases, harass.workers and harass.peers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get initial retry backoff as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.coordination.retry_backoff_ms)
    }

    /// Get the bounded retry window as Duration
    pub fn retry_window(&self) -> Duration {
        Duration::from_millis(self.coordination.retry_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[peer]
id = "peer-1"
lease_ms = 15000

[coordination]
ensemble = ["zk1:2181", "zk2:2181", "zk3:2181"]
bases = ["acct-7f3a", "acct-00c1"]
max_outstanding = 32

[harass]
bases = 50
workers = 20
churn_rate = 0.1
"#;

        let config = ShardlockConfig::from_str(toml).unwrap();
        assert_eq!(config.peer.id, "peer-1");
        assert_eq!(config.peer.lease_ms, 15_000);
        assert_eq!(config.coordination.ensemble.len(), 3);
        assert_eq!(config.coordination.bases.len(), 2);
        assert_eq!(config.coordination.max_outstanding, 32);
        assert_eq!(config.harass.bases, 50);
        assert_eq!(config.harass.convergence_bound_ms, 2_000);
    }

    #[test]
    fn test_reject_bad_churn_rate() {
        let toml = r#"
[peer]
id = "peer-1"

[harass]
churn_rate = 1.5
"#;
        assert!(ShardlockConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_reject_empty_peer_id() {
        let toml = r#"
[peer]
id = ""
"#;
        assert!(ShardlockConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardlock.toml");
        let config = ShardlockConfig {
            peer: PeerConfig {
                id: "peer-9".to_string(),
                lease_ms: default_lease_ms(),
            },
            coordination: CoordinationConfig::default(),
            logging: LoggingConfig::default(),
            harass: HarassSettings::default(),
        };
        std::fs::write(&path, toml::to_string(&config).unwrap()).unwrap();
        let loaded = ShardlockConfig::from_file(&path).unwrap();
        assert_eq!(loaded.peer.id, "peer-9");
    }
}
