use serde::{Deserialize, Serialize};

/// Replication coordinates of a MySQL instance, as observed through
/// `SHOW SLAVE STATUS` / `SHOW MASTER STATUS`.
///
/// Two GTID states are comparable through the server itself:
/// `A` covers `B` iff `GTID_SUBTRACT(B.executed, A.executed)` is empty.
/// The controller never parses GTID sets locally; it always asks MySQL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidState {
    pub master_log_file: String,
    pub read_master_log_pos: u64,
    pub retrieved_gtid_set: String,
    pub executed_gtid_set: String,
    pub slave_io_running: bool,
    pub slave_io_running_str: String,
    pub slave_sql_running: bool,
    pub slave_sql_running_str: String,
    pub seconds_behind_master: String,
    pub last_error: String,
    pub last_io_error: String,
    pub last_sql_error: String,
    pub slave_sql_running_state: String,
}

impl GtidState {
    /// Both replication threads are running.
    pub fn replication_healthy(&self) -> bool {
        self.slave_io_running && self.slave_sql_running
    }

    /// Either replication thread reported an error string.
    pub fn has_thread_error(&self) -> bool {
        !self.last_io_error.is_empty() || !self.last_sql_error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_state_is_not_healthy() {
        let gtid = GtidState::default();
        assert!(!gtid.replication_healthy());
        assert!(!gtid.has_thread_error());
    }

    #[test]
    fn thread_errors_are_detected() {
        let gtid = GtidState {
            slave_io_running: true,
            slave_sql_running: false,
            last_sql_error: "Could not execute Write_rows event".into(),
            ..GtidState::default()
        };
        assert!(!gtid.replication_healthy());
        assert!(gtid.has_thread_error());
    }
}
