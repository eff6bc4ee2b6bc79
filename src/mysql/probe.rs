use crate::gtid::GtidState;
use crate::mysql::driver::{row_field, row_field_u64, QueryExecutor, Row};
use crate::mysql::{ProbeError, Repl};
use std::sync::Arc;
use std::time::Duration;

// http://dev.mysql.com/doc/refman/5.7/en/privileges-provided.html
const ALL_PRIVILEGES: &[&str] = &["ALL"];

const REPL_PRIVILEGES: &[&str] = &["REPLICATION SLAVE", "REPLICATION CLIENT"];

const NORMAL_PRIVILEGES: &[&str] = &[
    "ALTER",
    "ALTER ROUTINE",
    "CREATE",
    "CREATE ROUTINE",
    "CREATE TEMPORARY TABLES",
    "CREATE VIEW",
    "DELETE",
    "DROP",
    "EXECUTE",
    "EVENT",
    "INDEX",
    "INSERT",
    "LOCK TABLES",
    "PROCESS",
    "RELOAD",
    "SELECT",
    "SHOW DATABASES",
    "SHOW VIEW",
    "UPDATE",
    "TRIGGER",
    "REFERENCES",
    "REPLICATION SLAVE",
    "REPLICATION CLIENT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslType {
    Yes,
    No,
}

impl SslType {
    pub fn parse(raw: &str) -> Result<Self, ProbeError> {
        match raw.to_ascii_uppercase().as_str() {
            "YES" => Ok(SslType::Yes),
            "NO" => Ok(SslType::No),
            other => Err(ProbeError::Semantic(format!(
                "ssl_type must be YES or NO, got {other:?}"
            ))),
        }
    }
}

/// Liveness token: the relay source binlog file the slave threads are
/// currently working from. Empty on a server with no replication configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PingEntry {
    pub relay_master_log_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlUser {
    pub user: String,
    pub host: String,
    pub super_priv: String,
}

/// Issues replication and topology statements against the local MySQL and
/// normalizes the results into typed records.
///
/// Every operation carries the configured query timeout. Multi-statement
/// operations go through the executor's super-query-list path: one
/// connection, first failure aborts.
pub struct MysqlProbe<E: QueryExecutor> {
    executor: Arc<E>,
    query_timeout: Duration,
}

impl<E: QueryExecutor> Clone for MysqlProbe<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            query_timeout: self.query_timeout,
        }
    }
}

impl<E: QueryExecutor> MysqlProbe<E> {
    pub fn new(executor: Arc<E>, query_timeout: Duration) -> Self {
        Self {
            executor,
            query_timeout,
        }
    }

    pub fn set_query_timeout(&mut self, timeout: Duration) {
        self.query_timeout = timeout;
    }

    /// Health check doubling as a probe of the relay source binlog.
    pub fn ping(&self) -> Result<PingEntry, ProbeError> {
        let rows = self.executor.query("SHOW SLAVE STATUS", self.query_timeout)?;
        let mut entry = PingEntry::default();
        if let Some(row) = rows.first() {
            entry.relay_master_log_file = row_field(row, "Relay_Master_Log_File");
        }
        Ok(entry)
    }

    /// GTID state from the default replication channel. A server that has
    /// never been a slave yields the zero record.
    pub fn slave_gtid(&self) -> Result<GtidState, ProbeError> {
        let rows = self.executor.query("SHOW SLAVE STATUS", self.query_timeout)?;
        let mut gtid = GtidState::default();
        if let Some(row) = rows.first() {
            gtid.master_log_file = row_field(row, "Master_Log_File");
            gtid.read_master_log_pos = row_field_u64(row, "Read_Master_Log_Pos");
            gtid.retrieved_gtid_set = row_field(row, "Retrieved_Gtid_Set");
            gtid.executed_gtid_set = row_field(row, "Executed_Gtid_Set");
            gtid.slave_io_running_str = row_field(row, "Slave_IO_Running");
            gtid.slave_io_running = gtid.slave_io_running_str == "Yes";
            gtid.slave_sql_running_str = row_field(row, "Slave_SQL_Running");
            gtid.slave_sql_running = gtid.slave_sql_running_str == "Yes";
            gtid.seconds_behind_master = row_field(row, "Seconds_Behind_Master");
            gtid.last_error = row_field(row, "Last_Error");
            gtid.last_io_error = row_field(row, "Last_IO_Error");
            gtid.last_sql_error = row_field(row, "Last_SQL_Error");
            gtid.slave_sql_running_state = row_field(row, "Slave_SQL_Running_State");
        }
        Ok(gtid)
    }

    /// Binlog coordinates as a master would report them.
    pub fn master_gtid(&self) -> Result<GtidState, ProbeError> {
        let rows = self.executor.query("SHOW MASTER STATUS", self.query_timeout)?;
        let mut gtid = GtidState::default();
        if let Some(row) = rows.first() {
            gtid.master_log_file = row_field(row, "File");
            gtid.read_master_log_pos = row_field_u64(row, "Position");
            gtid.executed_gtid_set = row_field(row, "Executed_Gtid_Set");
            gtid.seconds_behind_master = "0".into();
            gtid.slave_io_running = true;
            gtid.slave_sql_running = true;
        }
        Ok(gtid)
    }

    pub fn uuid(&self) -> Result<String, ProbeError> {
        let rows = self
            .executor
            .query("SELECT @@SERVER_UUID", self.query_timeout)?;
        let row = rows
            .first()
            .ok_or_else(|| ProbeError::Semantic("SELECT @@SERVER_UUID returned no rows".into()))?;
        Ok(row_field(row, "@@SERVER_UUID"))
    }

    /// Sets both `read_only` and `super_read_only` in one pass.
    pub fn set_read_only(&self, read_only: bool) -> Result<(), ProbeError> {
        let enabled = i32::from(read_only);
        let stmts = vec![
            format!("SET GLOBAL read_only = {enabled}"),
            format!("SET GLOBAL super_read_only = {enabled}"),
        ];
        self.executor.execute_super_list(&stmts, self.query_timeout)
    }

    pub fn start_slave(&self) -> Result<(), ProbeError> {
        self.executor.execute("START SLAVE", self.query_timeout)
    }

    pub fn stop_slave(&self) -> Result<(), ProbeError> {
        self.executor.execute("STOP SLAVE", self.query_timeout)
    }

    pub fn start_slave_io_thread(&self) -> Result<(), ProbeError> {
        self.executor
            .execute("START SLAVE IO_THREAD", self.query_timeout)
    }

    pub fn stop_slave_io_thread(&self) -> Result<(), ProbeError> {
        self.executor
            .execute("STOP SLAVE IO_THREAD", self.query_timeout)
    }

    /// Repoints replication at a new source. Contractual statement order:
    /// stop, (reset + seed gtid_purged), change, start.
    pub fn change_master_to(&self, master: &Repl) -> Result<(), ProbeError> {
        let mut stmts = vec!["STOP SLAVE".to_string()];
        if !master.gtid_purged.is_empty() {
            stmts.push("RESET MASTER".into());
            stmts.push("RESET SLAVE ALL".into());
            stmts.push(format!("SET GLOBAL gtid_purged='{}'", master.gtid_purged));
        }
        stmts.push(change_master_statement(master));
        stmts.push("START SLAVE".into());
        self.executor.execute_super_list(&stmts, self.query_timeout)
    }

    /// Forgets the replication source entirely; run on promotion.
    pub fn change_to_master(&self) -> Result<(), ProbeError> {
        // "ALL" makes the server forget the master host:port.
        let stmts = vec!["STOP SLAVE".to_string(), "RESET SLAVE ALL".to_string()];
        self.executor.execute_super_list(&stmts, self.query_timeout)
    }

    pub fn wait_until_after_gtid(&self, target: &str) -> Result<(), ProbeError> {
        let query = format!("SELECT WAIT_UNTIL_SQL_THREAD_AFTER_GTIDS('{target}')");
        self.executor.execute(&query, self.query_timeout)
    }

    /// `GTID_SUBTRACT(subset, set)`: empty result means `set` covers `subset`.
    pub fn gtid_subtract(&self, subset: &str, set: &str) -> Result<String, ProbeError> {
        let query = format!("SELECT GTID_SUBTRACT('{subset}','{set}') as gtid_sub");
        let rows = self.executor.query(&query, self.query_timeout)?;
        Ok(rows.first().map(|row| row_field(row, "gtid_sub")).unwrap_or_default())
    }

    pub fn set_global_sysvar(&self, varsql: &str) -> Result<(), ProbeError> {
        const PREFIX: &str = "SET GLOBAL";
        if !varsql.starts_with(PREFIX) {
            return Err(ProbeError::Semantic(format!(
                "{varsql:?} must start with {PREFIX}"
            )));
        }
        self.executor.execute(varsql, self.query_timeout)
    }

    pub fn reset_master(&self) -> Result<(), ProbeError> {
        self.executor.execute("RESET MASTER", self.query_timeout)
    }

    pub fn reset_slave_all(&self) -> Result<(), ProbeError> {
        let stmts = vec!["STOP SLAVE".to_string(), "RESET SLAVE ALL".to_string()];
        self.executor.execute_super_list(&stmts, self.query_timeout)
    }

    pub fn purge_binlogs_to(&self, binlog: &str) -> Result<(), ProbeError> {
        let stmt = format!("PURGE BINARY LOGS TO '{binlog}'");
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn enable_semi_sync_master(&self) -> Result<(), ProbeError> {
        self.executor
            .execute("SET GLOBAL rpl_semi_sync_master_enabled=ON", self.query_timeout)
    }

    pub fn disable_semi_sync_master(&self) -> Result<(), ProbeError> {
        self.executor
            .execute("SET GLOBAL rpl_semi_sync_master_enabled=OFF", self.query_timeout)
    }

    pub fn enable_semi_sync_slave(&self) -> Result<(), ProbeError> {
        self.executor
            .execute("SET GLOBAL rpl_semi_sync_slave_enabled=ON", self.query_timeout)
    }

    pub fn set_semi_sync_master_timeout(&self, timeout_ms: u64) -> Result<(), ProbeError> {
        let stmt = format!("SET GLOBAL rpl_semi_sync_master_timeout={timeout_ms}");
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn set_semi_sync_wait_slave_count(&self, count: u32) -> Result<(), ProbeError> {
        let stmt = format!("SET GLOBAL rpl_semi_sync_master_wait_for_slave_count = {count}");
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn check_user_exists(&self, user: &str, host: &str) -> Result<bool, ProbeError> {
        let query = format!(
            "SELECT User FROM mysql.user WHERE User = '{user}' and Host = '{host}'"
        );
        let rows = self.executor.query(&query, self.query_timeout)?;
        Ok(!rows.is_empty())
    }

    pub fn get_users(&self) -> Result<Vec<MysqlUser>, ProbeError> {
        let rows = self.executor.query(
            "SELECT User, Host, Super_priv FROM mysql.user",
            self.query_timeout,
        )?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    pub fn create_user(
        &self,
        user: &str,
        host: &str,
        passwd: &str,
        ssl: SslType,
    ) -> Result<(), ProbeError> {
        let mut stmt = format!("CREATE USER `{user}`@`{host}` IDENTIFIED BY '{passwd}'");
        if ssl == SslType::Yes {
            stmt = format!("{stmt} REQUIRE X509");
        }
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn drop_user(&self, user: &str, host: &str) -> Result<(), ProbeError> {
        let stmt = format!("DROP USER `{user}`@`{host}`");
        self.executor.execute(&stmt, self.query_timeout)
    }

    /// Replication accounts are provisioned on every node; keeping the DDL
    /// out of the binlog stops it replicating to peers that already have it.
    pub fn create_repl_user_without_binlog(
        &self,
        user: &str,
        passwd: &str,
    ) -> Result<(), ProbeError> {
        let stmts = vec![
            "SET sql_log_bin=0".to_string(),
            format!("CREATE USER `{user}` IDENTIFIED BY '{passwd}'"),
            format!("GRANT {} ON *.* TO `{user}`", REPL_PRIVILEGES.join(",")),
            "SET sql_log_bin=1".to_string(),
        ];
        self.executor.execute_super_list(&stmts, self.query_timeout)
    }

    pub fn change_user_passwd(
        &self,
        user: &str,
        host: &str,
        passwd: &str,
    ) -> Result<(), ProbeError> {
        let stmt = format!("ALTER USER `{user}`@`{host}` IDENTIFIED BY '{passwd}'");
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn grant_normal_privileges(&self, user: &str, host: &str) -> Result<(), ProbeError> {
        let stmt = format!(
            "GRANT {} ON *.* TO `{user}`@`{host}`",
            NORMAL_PRIVILEGES.join(",")
        );
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn grant_replication_privileges(&self, user: &str) -> Result<(), ProbeError> {
        let stmt = format!("GRANT {} ON *.* TO `{user}`", REPL_PRIVILEGES.join(","));
        self.executor.execute(&stmt, self.query_timeout)
    }

    pub fn grant_all_privileges(
        &self,
        user: &str,
        host: &str,
        passwd: &str,
        ssl: SslType,
    ) -> Result<(), ProbeError> {
        self.create_user(user, host, passwd, ssl)?;
        let stmt = format!(
            "GRANT {} ON *.* TO `{user}`@`{host}` WITH GRANT OPTION",
            ALL_PRIVILEGES.join(",")
        );
        self.executor.execute(&stmt, self.query_timeout)
    }

    /// Creates a user restricted to a privilege subset on one database/table.
    /// The requested privileges must all belong to the normal-privilege set.
    pub fn create_user_with_privileges(
        &self,
        user: &str,
        passwd: &str,
        database: &str,
        table: &str,
        host: &str,
        privs: &str,
        ssl: SslType,
    ) -> Result<(), ProbeError> {
        let requested: Vec<String> = privs
            .trim_end_matches(',')
            .split(',')
            .map(|p| p.trim().to_ascii_uppercase())
            .collect();
        for priv_name in &requested {
            if !NORMAL_PRIVILEGES.contains(&priv_name.as_str()) {
                return Err(ProbeError::Semantic(format!(
                    "cannot create user {user:?} with privilege {priv_name:?}"
                )));
            }
        }
        self.create_user(user, host, passwd, ssl)?;
        let stmt = format!(
            "GRANT {} ON {database}.{table} TO `{user}`@`{host}`",
            requested.join(",")
        );
        self.executor.execute(&stmt, self.query_timeout)
    }
}

fn change_master_statement(master: &Repl) -> String {
    let args = [
        format!("MASTER_HOST = '{}'", master.master_host),
        format!("MASTER_PORT = {}", master.master_port),
        format!("MASTER_USER = '{}'", master.repl_user),
        format!("MASTER_PASSWORD = '{}'", master.repl_password),
        "MASTER_AUTO_POSITION = 1".to_string(),
    ];
    format!("CHANGE MASTER TO\n  {}", args.join(",\n  "))
}

fn user_from_row(row: &Row) -> MysqlUser {
    MysqlUser {
        user: row_field(row, "User"),
        host: row_field(row, "Host"),
        super_priv: row_field(row, "Super_priv"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records every statement and answers queries from a canned row set.
    #[derive(Default)]
    struct Recorder {
        statements: Mutex<Vec<String>>,
        rows: Mutex<HashMap<String, Vec<Row>>>,
    }

    impl Recorder {
        fn with_rows(query: &str, rows: Vec<Row>) -> Self {
            let recorder = Recorder::default();
            recorder.rows.lock().insert(query.to_string(), rows);
            recorder
        }

        fn statements(&self) -> Vec<String> {
            self.statements.lock().clone()
        }
    }

    impl QueryExecutor for Recorder {
        fn query(&self, sql: &str, _timeout: Duration) -> Result<Vec<Row>, ProbeError> {
            self.statements.lock().push(sql.to_string());
            Ok(self.rows.lock().get(sql).cloned().unwrap_or_default())
        }

        fn execute(&self, sql: &str, _timeout: Duration) -> Result<(), ProbeError> {
            self.statements.lock().push(sql.to_string());
            Ok(())
        }

        fn execute_super_list(
            &self,
            stmts: &[String],
            _timeout: Duration,
        ) -> Result<(), ProbeError> {
            self.statements.lock().extend(stmts.iter().cloned());
            Ok(())
        }
    }

    fn probe(recorder: Arc<Recorder>) -> MysqlProbe<Recorder> {
        MysqlProbe::new(recorder, Duration::from_secs(10))
    }

    fn slave_row() -> Row {
        let mut row = Row::new();
        row.insert("Master_Log_File".into(), "mysql-bin.000042".into());
        row.insert("Read_Master_Log_Pos".into(), "1099".into());
        row.insert("Executed_Gtid_Set".into(), "uuid1:1-100".into());
        row.insert("Retrieved_Gtid_Set".into(), "uuid1:1-100".into());
        row.insert("Slave_IO_Running".into(), "Yes".into());
        row.insert("Slave_SQL_Running".into(), "Connecting".into());
        row.insert("Seconds_Behind_Master".into(), "3".into());
        row.insert("Last_SQL_Error".into(), "".into());
        row
    }

    #[test]
    fn slave_gtid_normalizes_the_status_row() {
        let recorder = Arc::new(Recorder::with_rows("SHOW SLAVE STATUS", vec![slave_row()]));
        let gtid = probe(recorder).slave_gtid().unwrap();
        assert_eq!(gtid.master_log_file, "mysql-bin.000042");
        assert_eq!(gtid.read_master_log_pos, 1099);
        assert_eq!(gtid.executed_gtid_set, "uuid1:1-100");
        assert!(gtid.slave_io_running);
        assert!(!gtid.slave_sql_running);
        assert_eq!(gtid.slave_sql_running_str, "Connecting");
    }

    #[test]
    fn slave_gtid_on_fresh_server_is_the_zero_record() {
        let recorder = Arc::new(Recorder::default());
        let gtid = probe(recorder).slave_gtid().unwrap();
        assert_eq!(gtid, GtidState::default());
    }

    #[test]
    fn set_read_only_covers_super_read_only() {
        let recorder = Arc::new(Recorder::default());
        probe(recorder.clone()).set_read_only(true).unwrap();
        assert_eq!(
            recorder.statements(),
            vec!["SET GLOBAL read_only = 1", "SET GLOBAL super_read_only = 1"]
        );
    }

    #[test]
    fn change_master_orders_statements_contractually() {
        let recorder = Arc::new(Recorder::default());
        let master = Repl {
            master_host: "10.0.0.9".into(),
            master_port: 3306,
            repl_user: "repl".into(),
            repl_password: "replpass".into(),
            gtid_purged: "uuid1:1-50".into(),
        };
        probe(recorder.clone()).change_master_to(&master).unwrap();
        let stmts = recorder.statements();
        assert_eq!(stmts[0], "STOP SLAVE");
        assert_eq!(stmts[1], "RESET MASTER");
        assert_eq!(stmts[2], "RESET SLAVE ALL");
        assert_eq!(stmts[3], "SET GLOBAL gtid_purged='uuid1:1-50'");
        assert!(stmts[4].starts_with("CHANGE MASTER TO"));
        assert!(stmts[4].contains("MASTER_AUTO_POSITION = 1"));
        assert_eq!(stmts[5], "START SLAVE");
    }

    #[test]
    fn change_master_without_purge_skips_the_reset() {
        let recorder = Arc::new(Recorder::default());
        let master = Repl {
            master_host: "10.0.0.9".into(),
            master_port: 3306,
            repl_user: "repl".into(),
            repl_password: "replpass".into(),
            gtid_purged: String::new(),
        };
        probe(recorder.clone()).change_master_to(&master).unwrap();
        let stmts = recorder.statements();
        assert_eq!(stmts.len(), 3);
        assert!(!stmts.iter().any(|s| s.contains("RESET MASTER")));
    }

    #[test]
    fn set_global_sysvar_refuses_other_statements() {
        let recorder = Arc::new(Recorder::default());
        let err = probe(recorder)
            .set_global_sysvar("FLUSH LOGS")
            .unwrap_err();
        assert!(matches!(err, ProbeError::Semantic(_)));
    }

    #[test]
    fn ssl_user_creation_requires_x509() {
        let recorder = Arc::new(Recorder::default());
        probe(recorder.clone())
            .create_user("app", "%", "secret", SslType::Yes)
            .unwrap();
        let stmts = recorder.statements();
        assert!(stmts[0].ends_with("REQUIRE X509"));
    }

    #[test]
    fn repl_user_creation_stays_out_of_the_binlog() {
        let recorder = Arc::new(Recorder::default());
        probe(recorder.clone())
            .create_repl_user_without_binlog("repl", "replpass")
            .unwrap();
        let stmts = recorder.statements();
        assert_eq!(stmts.first().map(String::as_str), Some("SET sql_log_bin=0"));
        assert_eq!(stmts.last().map(String::as_str), Some("SET sql_log_bin=1"));
        assert!(stmts[2].contains("REPLICATION SLAVE"));
    }

    #[test]
    fn unknown_privilege_is_refused_before_any_ddl() {
        let recorder = Arc::new(Recorder::default());
        let err = probe(recorder.clone())
            .create_user_with_privileges("app", "pw", "db", "*", "%", "SELECT,SUPER", SslType::No)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Semantic(_)));
        assert!(recorder.statements().is_empty());
    }

    #[test]
    fn gtid_subtract_reads_the_aliased_column() {
        let mut row = Row::new();
        row.insert("gtid_sub".into(), "uuid1:51-100".into());
        let query = "SELECT GTID_SUBTRACT('uuid1:1-100','uuid1:1-50') as gtid_sub";
        let recorder = Arc::new(Recorder::with_rows(query, vec![row]));
        let diff = probe(recorder)
            .gtid_subtract("uuid1:1-100", "uuid1:1-50")
            .unwrap();
        assert_eq!(diff, "uuid1:51-100");
    }
}
