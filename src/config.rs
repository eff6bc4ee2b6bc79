use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_ELECTION_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PURGE_BINLOG_INTERVAL_MS: u64 = 300_000;
const DEFAULT_MYSQL_PORT: u16 = 3306;
const DEFAULT_SEMI_SYNC_TIMEOUT_MS: u64 = 1_000;

/// Node configuration, loaded from a JSON document.
///
/// `peers` is the static membership: every controller in the cluster,
/// excluding the local one. There is no dynamic membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `host:port` this controller answers peer RPCs on.
    pub local_addr: String,
    pub peers: Vec<String>,

    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// How long a candidate waits for vote replies before backing off.
    /// Defaults to the heartbeat timeout.
    #[serde(default)]
    pub candidate_waitfor_votes_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_purge_binlog_interval_ms")]
    pub purge_binlog_interval_ms: u64,

    #[serde(default)]
    pub leader_start_command: String,
    #[serde(default)]
    pub leader_stop_command: String,
    #[serde(default)]
    pub leader_fence_command: String,

    pub mysql_admin: String,
    pub mysql_passwd: String,
    #[serde(default = "default_mysql_port")]
    pub mysql_port: u16,
    pub repl_user: String,
    pub repl_password: String,

    #[serde(default)]
    pub ssl_ca: Option<PathBuf>,
    #[serde(default)]
    pub ssl_cert: Option<PathBuf>,
    #[serde(default)]
    pub ssl_key: Option<PathBuf>,

    /// `rpl_semi_sync_master_wait_for_slave_count` applied on promotion.
    /// Historically configured as `super_id_threshold`.
    #[serde(default = "default_semi_sync_wait_count", alias = "super_id_threshold")]
    pub semi_sync_wait_slave_count: u32,
    #[serde(default = "default_semi_sync_timeout_ms")]
    pub semi_sync_timeout_ms: u64,
}

fn default_election_timeout_ms() -> u64 {
    DEFAULT_ELECTION_TIMEOUT_MS
}

fn default_heartbeat_timeout_ms() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}

fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT_MS
}

fn default_purge_binlog_interval_ms() -> u64 {
    DEFAULT_PURGE_BINLOG_INTERVAL_MS
}

fn default_mysql_port() -> u16 {
    DEFAULT_MYSQL_PORT
}

fn default_semi_sync_wait_count() -> u32 {
    1
}

fn default_semi_sync_timeout_ms() -> u64 {
    DEFAULT_SEMI_SYNC_TIMEOUT_MS
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        // Normalize relative ssl paths to be relative to the config location.
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for entry in [&mut config.ssl_ca, &mut config.ssl_cert, &mut config.ssl_key] {
            if let Some(p) = entry {
                if p.is_relative() {
                    let joined = base.join(p.as_path());
                    *p = joined;
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_addr.is_empty() {
            return Err(ConfigError::Invalid("local_addr must be set".into()));
        }
        if self.peers.iter().any(|p| p == &self.local_addr) {
            return Err(ConfigError::Invalid(format!(
                "peers must not include local_addr {}",
                self.local_addr
            )));
        }
        if self.election_timeout_ms == 0 || self.heartbeat_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "election_timeout_ms and heartbeat_timeout_ms must be non-zero".into(),
            ));
        }
        if self.election_timeout_ms <= self.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "election_timeout_ms ({}) must exceed heartbeat_timeout_ms ({})",
                self.election_timeout_ms, self.heartbeat_timeout_ms
            )));
        }
        if self.query_timeout_ms == 0 {
            return Err(ConfigError::Invalid("query_timeout_ms must be non-zero".into()));
        }
        let ssl_parts =
            [&self.ssl_ca, &self.ssl_cert, &self.ssl_key].iter().filter(|p| p.is_some()).count();
        if ssl_parts != 0 && ssl_parts != 3 {
            return Err(ConfigError::Invalid(
                "ssl_ca, ssl_cert and ssl_key must be configured together".into(),
            ));
        }
        Ok(())
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn candidate_wait(&self) -> Duration {
        let ms = if self.candidate_waitfor_votes_ms == 0 {
            self.heartbeat_timeout_ms
        } else {
            self.candidate_waitfor_votes_ms
        };
        Duration::from_millis(ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn purge_binlog_interval(&self) -> Duration {
        Duration::from_millis(self.purge_binlog_interval_ms)
    }

    /// All three ssl options are present; replication users get `REQUIRE X509`.
    pub fn ssl_enabled(&self) -> bool {
        self.ssl_ca.is_some() && self.ssl_cert.is_some() && self.ssl_key.is_some()
    }

    /// Cluster size including the local node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority of the static peer set, self included.
    pub fn quorum(&self) -> usize {
        self.cluster_size() / 2 + 1
    }
}
