use crate::hook::{HookKind, HookOutcome, HookRunner};
use crate::mysql::{MysqlProbe, ProbeError, QueryExecutor, Repl};
use crate::raft::SharedState;
use log::{error, info, warn};
use std::sync::Arc;

/// Applies role transitions to the local MySQL and runs the transition
/// hooks. All methods execute on the effector worker, one job at a time,
/// which is what serializes hooks across role changes.
pub struct LeaderEffector<E: QueryExecutor> {
    probe: MysqlProbe<E>,
    hooks: HookRunner,
    repl_user: String,
    repl_password: String,
    mysql_port: u16,
    semi_sync_timeout_ms: u64,
    semi_sync_wait_count: u32,
    shared: Arc<SharedState>,
}

impl<E: QueryExecutor> LeaderEffector<E> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        probe: MysqlProbe<E>,
        hooks: HookRunner,
        repl_user: String,
        repl_password: String,
        mysql_port: u16,
        semi_sync_timeout_ms: u64,
        semi_sync_wait_count: u32,
        shared: Arc<SharedState>,
    ) -> Self {
        Self {
            probe,
            hooks,
            repl_user,
            repl_password,
            mysql_port,
            semi_sync_timeout_ms,
            semi_sync_wait_count,
            shared,
        }
    }

    /// LEADER entry: leader-start hook, forget the old source, switch on
    /// semi-sync master mode, open the server for writes. A MySQL failure
    /// mid-sequence rolls the server back to read-only and balances the
    /// start hook with a stop hook before reporting the error.
    pub fn promote(&self) -> Result<(), ProbeError> {
        self.run_hook(HookKind::LeaderStart);
        if let Err(err) = self.apply_master_state() {
            error!("event=promote_failed error={err}");
            if let Err(rollback) = self.probe.set_read_only(true) {
                error!("event=promote_rollback_failed error={rollback}");
            }
            self.run_hook(HookKind::LeaderStop);
            return Err(err);
        }
        info!("event=promote_applied");
        Ok(())
    }

    fn apply_master_state(&self) -> Result<(), ProbeError> {
        // Drain the relay log first: everything this server has retrieved
        // must be applied before it starts a new lineage.
        let slave = self.probe.slave_gtid()?;
        if !slave.retrieved_gtid_set.is_empty() {
            self.probe.wait_until_after_gtid(&slave.retrieved_gtid_set)?;
        }
        self.probe.change_to_master()?;
        self.probe.enable_semi_sync_master()?;
        self.probe
            .set_semi_sync_master_timeout(self.semi_sync_timeout_ms)?;
        self.probe
            .set_semi_sync_wait_slave_count(self.semi_sync_wait_count)?;
        self.probe.set_read_only(false)
    }

    /// LEADER exit. Best-effort: the demoted role applies even when the
    /// local MySQL no longer answers, so every step logs instead of failing
    /// the transition. `fence` marks an unhealthy exit.
    pub fn demote(&self, fence: bool) {
        self.run_hook(HookKind::LeaderStop);
        if fence {
            self.run_hook(HookKind::LeaderFence);
        }
        if let Err(err) = self.probe.set_read_only(true) {
            warn!("event=demote_read_only_failed error={err}");
        }
        if let Err(err) = self.probe.disable_semi_sync_master() {
            warn!("event=demote_semi_sync_master_failed error={err}");
        }
        if let Err(err) = self.probe.enable_semi_sync_slave() {
            warn!("event=demote_semi_sync_slave_failed error={err}");
        }
        info!("event=demote_applied fence={fence}");
    }

    /// Repoints local replication at the current leader. Semi-sync slave
    /// mode goes on before the slave threads start.
    pub fn configure_replication(&self, leader_addr: &str) -> Result<(), ProbeError> {
        let master_host = host_of(leader_addr);
        if master_host.is_empty() {
            return Err(ProbeError::Semantic(format!(
                "leader address {leader_addr:?} has no host part"
            )));
        }
        self.probe.enable_semi_sync_slave()?;
        let master = Repl {
            master_host: master_host.to_string(),
            master_port: self.mysql_port,
            repl_user: self.repl_user.clone(),
            repl_password: self.repl_password.clone(),
            gtid_purged: String::new(),
        };
        self.probe.change_master_to(&master)?;
        info!("event=replication_configured master={master_host}:{}", self.mysql_port);
        Ok(())
    }

    fn run_hook(&self, kind: HookKind) {
        match self.hooks.run(kind) {
            Ok(HookOutcome::Success) => {}
            Ok(_) => self.shared.stats.inc_hook_failures(),
            Err(err) => {
                self.shared.stats.inc_hook_failures();
                warn!("event=hook_spawn_failed kind={} error={err}", kind.as_str());
            }
        }
    }
}

/// The peer address is the controller's `host:port`; MySQL lives on the
/// same host at the configured MySQL port.
fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}
