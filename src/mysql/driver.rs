use crate::mysql::ProbeError;
use std::collections::HashMap;
use std::time::Duration;

/// One result row, keyed by column name. `SHOW SLAVE STATUS` and friends are
/// consumed positionally-by-name, so a string map is the natural shape.
pub type Row = HashMap<String, String>;

/// Connection seam between the probe and an actual MySQL driver.
///
/// The production binding lives with the embedding process; the controller
/// only depends on these three operations. Implementations are expected to
/// serialize statements per connection and honor the timeout per statement.
pub trait QueryExecutor: Send + Sync {
    fn query(&self, sql: &str, timeout: Duration) -> Result<Vec<Row>, ProbeError>;

    fn execute(&self, sql: &str, timeout: Duration) -> Result<(), ProbeError>;

    /// Runs the statement list on a single privileged connection, aborting at
    /// the first failure. Used for ordered topology changes where partial
    /// application must not be retried blindly.
    fn execute_super_list(&self, stmts: &[String], timeout: Duration) -> Result<(), ProbeError>;
}

/// Missing columns read as empty rather than failing the whole row; MySQL
/// versions differ in which columns they emit.
pub fn row_field(row: &Row, column: &str) -> String {
    row.get(column).cloned().unwrap_or_default()
}

pub(crate) fn row_field_u64(row: &Row, column: &str) -> u64 {
    row.get(column).and_then(|v| v.parse().ok()).unwrap_or(0)
}
