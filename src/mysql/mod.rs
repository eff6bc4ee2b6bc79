mod driver;
mod probe;

pub use driver::{row_field, QueryExecutor, Row};
pub use probe::{MysqlProbe, MysqlUser, PingEntry, SslType};

use std::time::Duration;
use thiserror::Error;

/// Replication source coordinates applied through `CHANGE MASTER TO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repl {
    pub master_host: String,
    pub master_port: u16,
    pub repl_user: String,
    pub repl_password: String,
    /// When non-empty, the local server is reset and `gtid_purged` is seeded
    /// before the topology change.
    pub gtid_purged: String,
}

/// Probe failures, categorized so the state machine can distinguish a dead
/// server from a server answering garbage.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("mysql connect failed: {0}")]
    Connect(String),
    #[error("mysql statement timed out after {timeout:?}: {query}")]
    Timeout { query: String, timeout: Duration },
    #[error("mysql rejected statement: {0}")]
    Syntax(String),
    #[error("mysql permission denied: {0}")]
    Permission(String),
    #[error("unexpected result shape: {0}")]
    Semantic(String),
}

impl ProbeError {
    /// Connectivity-class failures: the server may be gone entirely.
    /// Everything else means the server answered and the answer was wrong.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Connect(_) | ProbeError::Timeout { .. })
    }
}
