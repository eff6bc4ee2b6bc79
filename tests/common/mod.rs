#![allow(dead_code)]

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use relayguard::{
    Config, Event, GtidState, MessageKind, MysqlProbe, PeerCall, ProbeCommand, ProbeError,
    QueryExecutor, RaftResponse, RetCode, Role, Row,
};
use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// In-memory stand-in for a MySQL server. Answers the status queries the
/// probe issues, evaluates `GTID_SUBTRACT` over simple `uuid:1-N` interval
/// sets, and records every statement for assertions.
pub struct FakeMysql {
    state: Mutex<FakeState>,
}

struct FakeState {
    healthy: bool,
    executed_gtid: String,
    master_log_file: String,
    statements: Vec<String>,
}

impl FakeMysql {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                healthy: true,
                executed_gtid: String::new(),
                master_log_file: "mysql-bin.000001".into(),
                statements: Vec::new(),
            }),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.state.lock().healthy = healthy;
    }

    pub fn set_executed_gtid(&self, gtid: &str) {
        self.state.lock().executed_gtid = gtid.to_string();
    }

    pub fn set_master_log_file(&self, file: &str) {
        self.state.lock().master_log_file = file.to_string();
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn statement_count(&self, needle: &str) -> usize {
        self.state
            .lock()
            .statements
            .iter()
            .filter(|stmt| stmt.contains(needle))
            .count()
    }

    fn check(&self) -> Result<(), ProbeError> {
        if self.state.lock().healthy {
            Ok(())
        } else {
            Err(ProbeError::Connect("fake mysql is down".into()))
        }
    }

    fn status_row(&self, as_master: bool) -> Row {
        let state = self.state.lock();
        let mut row = Row::new();
        if as_master {
            row.insert("File".into(), state.master_log_file.clone());
            row.insert("Position".into(), "4".into());
            row.insert("Executed_Gtid_Set".into(), state.executed_gtid.clone());
        } else {
            row.insert("Master_Log_File".into(), state.master_log_file.clone());
            row.insert("Relay_Master_Log_File".into(), state.master_log_file.clone());
            row.insert("Read_Master_Log_Pos".into(), "4".into());
            row.insert("Executed_Gtid_Set".into(), state.executed_gtid.clone());
            row.insert("Retrieved_Gtid_Set".into(), state.executed_gtid.clone());
            row.insert("Slave_IO_Running".into(), "Yes".into());
            row.insert("Slave_SQL_Running".into(), "Yes".into());
            row.insert("Seconds_Behind_Master".into(), "0".into());
        }
        row
    }
}

impl QueryExecutor for FakeMysql {
    fn query(&self, sql: &str, _timeout: Duration) -> Result<Vec<Row>, ProbeError> {
        self.check()?;
        self.state.lock().statements.push(sql.to_string());
        if sql == "SHOW SLAVE STATUS" {
            return Ok(vec![self.status_row(false)]);
        }
        if sql == "SHOW MASTER STATUS" {
            return Ok(vec![self.status_row(true)]);
        }
        if sql == "SELECT @@SERVER_UUID" {
            let mut row = Row::new();
            row.insert("@@SERVER_UUID".into(), "f0000000-0000-0000-0000-000000000001".into());
            return Ok(vec![row]);
        }
        if let Some((subset, set)) = parse_subtract(sql) {
            let mut row = Row::new();
            row.insert("gtid_sub".into(), gtid_subtract_eval(&subset, &set));
            return Ok(vec![row]);
        }
        // User lookups during provisioning find nothing; the DDL that
        // follows is recorded like any other statement.
        Ok(Vec::new())
    }

    fn execute(&self, sql: &str, _timeout: Duration) -> Result<(), ProbeError> {
        self.check()?;
        self.state.lock().statements.push(sql.to_string());
        Ok(())
    }

    fn execute_super_list(&self, stmts: &[String], _timeout: Duration) -> Result<(), ProbeError> {
        self.check()?;
        self.state.lock().statements.extend(stmts.iter().cloned());
        Ok(())
    }
}

fn parse_subtract(sql: &str) -> Option<(String, String)> {
    let args = sql.strip_prefix("SELECT GTID_SUBTRACT('")?;
    let (subset, rest) = args.split_once("','")?;
    let (set, _) = rest.split_once("')")?;
    Some((subset.to_string(), set.to_string()))
}

/// `GTID_SUBTRACT` over sets of `uuid:1-N` entries (the shapes the tests
/// use): returns what remains of `subset` after removing `set`.
pub fn gtid_subtract_eval(subset: &str, set: &str) -> String {
    let covered = parse_intervals(set);
    let mut missing = Vec::new();
    for (uuid, upper) in parse_intervals(subset) {
        match covered.get(&uuid) {
            Some(have) if *have >= upper => {}
            Some(have) => missing.push(format!("{uuid}:{}-{upper}", have + 1)),
            None => missing.push(format!("{uuid}:1-{upper}")),
        }
    }
    missing.join(",")
}

fn parse_intervals(set: &str) -> HashMap<String, u64> {
    let mut intervals = HashMap::new();
    for entry in set.split(',').filter(|entry| !entry.is_empty()) {
        let Some((uuid, range)) = entry.split_once(':') else {
            continue;
        };
        let upper = range
            .rsplit_once('-')
            .map(|(_, hi)| hi)
            .unwrap_or(range)
            .parse()
            .unwrap_or(0);
        intervals.insert(uuid.to_string(), upper);
    }
    intervals
}

/// A GTID state whose executed set is `gtid`, threads running.
pub fn gtid_state(gtid: &str) -> GtidState {
    GtidState {
        executed_gtid_set: gtid.to_string(),
        retrieved_gtid_set: gtid.to_string(),
        slave_io_running: true,
        slave_sql_running: true,
        seconds_behind_master: "0".into(),
        ..GtidState::default()
    }
}

pub fn next_loopback() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr.to_string()
}

pub fn node_config(local: &str, peers: &[&str], election_ms: u64, heartbeat_ms: u64) -> Config {
    serde_json::from_value(serde_json::json!({
        "local_addr": local,
        "peers": peers,
        "election_timeout_ms": election_ms,
        "heartbeat_timeout_ms": heartbeat_ms,
        "mysql_admin": "root",
        "mysql_passwd": "rootpass",
        "repl_user": "repl",
        "repl_password": "replpass"
    }))
    .expect("node config")
}

/// Polls `predicate` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
}

/// Drives probe commands against a fake server, standing in for the
/// production probe worker when the machine is wired by hand. Purged binlog
/// files are recorded for assertions.
pub fn spawn_probe_echo(
    fake: Arc<FakeMysql>,
    commands: Receiver<ProbeCommand>,
    events: Sender<Event>,
    purges: Arc<Mutex<Vec<String>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let probe = MysqlProbe::new(fake, Duration::from_secs(1));
        for command in commands {
            let outcome = match command {
                ProbeCommand::Report { as_master } => {
                    let gtid = if as_master {
                        probe.master_gtid()
                    } else {
                        probe.slave_gtid()
                    };
                    match gtid {
                        Ok(gtid) => events.send(Event::ProbeReport {
                            healthy: true,
                            trusted: true,
                            gtid,
                        }),
                        Err(_) => events.send(Event::ProbeReport {
                            healthy: false,
                            trusted: false,
                            gtid: GtidState::default(),
                        }),
                    }
                }
                ProbeCommand::Subtract { token, subset, set } => {
                    let result = probe.gtid_subtract(&subset, &set);
                    events.send(Event::SubtractResult { token, result })
                }
                ProbeCommand::PurgeTo { file } => {
                    purges.lock().push(file);
                    Ok(())
                }
            };
            if outcome.is_err() {
                break;
            }
        }
    })
}

/// Completes effector jobs immediately and records them, standing in for
/// the production effector worker.
pub fn spawn_effector_echo(
    jobs: Receiver<relayguard::EffectorJob>,
    events: Sender<Event>,
    record: Arc<Mutex<Vec<relayguard::EffectorJobKind>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for job in jobs {
            record.lock().push(job.kind.clone());
            let done = Event::EffectorDone {
                kind: job.kind,
                term: job.term,
                result: Ok(()),
            };
            if events.send(done).is_err() {
                break;
            }
        }
    })
}

/// A peer that answers from a script: votes are granted or refused
/// wholesale, heartbeats are acked with the configured GTID.
pub fn spawn_scripted_peer(
    addr: String,
    calls: Receiver<PeerCall>,
    events: Sender<Event>,
    grant_votes: bool,
    gtid: GtidState,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for call in calls {
            let meta = &call.msg.meta;
            let response = RaftResponse {
                from: addr.clone(),
                view_id: meta.view_id,
                epoch_id: meta.epoch_id,
                retcode: match call.msg.kind {
                    MessageKind::RequestVote if !grant_votes => RetCode::InvalidGtid,
                    _ => RetCode::Ok,
                },
                state: Role::Follower,
                gtid: match call.msg.kind {
                    MessageKind::Heartbeat | MessageKind::Status => Some(gtid.clone()),
                    _ => None,
                },
            };
            let event = Event::PeerReply {
                peer: addr.clone(),
                kind: call.msg.kind,
                sent_view: meta.view_id,
                result: Ok(response),
            };
            if events.send(event).is_err() {
                break;
            }
        }
    })
}
