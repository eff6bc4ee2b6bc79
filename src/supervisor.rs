use crate::config::{Config, ConfigError};
use crate::hook::HookRunner;
use crate::mysql::{MysqlProbe, ProbeError, QueryExecutor, SslType};
use crate::net::{spawn_rpc_server, NetError, RpcServerConfig, RpcServerHandle};
use crate::raft::effector::LeaderEffector;
use crate::raft::machine::{
    AdminCommand, DeliverError, EffectorJob, MachineConfig, MachineHandle, Outbound, PeerCall,
    PeerHandle, ProbeCommand, RaftMachine,
};
use crate::raft::workers::{spawn_effector_worker, spawn_peer_worker, spawn_probe_worker};
use crate::raft::{NodeStatus, SharedState};
use crossbeam_channel::bounded;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const PEER_QUEUE_CAPACITY: usize = 8;
const PROBE_QUEUE_CAPACITY: usize = 32;
const EFFECTOR_QUEUE_CAPACITY: usize = 16;
const HOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("mysql provisioning failed: {0}")]
    Provision(ProbeError),
    #[error(transparent)]
    Network(#[from] NetError),
    #[error(transparent)]
    Machine(#[from] DeliverError),
}

impl SupervisorError {
    /// Process exit code the embedding binary should use: 1 for
    /// configuration problems, 2 for fatal MySQL provisioning at boot.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::Provision(_) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub local_addr: String,
    pub peers: Vec<String>,
    pub node: NodeStatus,
}

/// Owns the whole controller: the state machine, the probe and effector
/// workers, one client worker per peer, and the RPC server. Construction
/// wires everything; `stop` tears it down in reverse.
pub struct Supervisor {
    local_addr: String,
    peers: Vec<String>,
    machine: Arc<RaftMachine>,
    machine_handle: Option<MachineHandle>,
    server: Option<RpcServerHandle>,
    workers: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn start<E: QueryExecutor + 'static>(
        config: &Config,
        executor: Arc<E>,
    ) -> Result<Supervisor, SupervisorError> {
        config.validate()?;
        let bind = config
            .local_addr
            .to_socket_addrs()
            .map_err(|err| {
                ConfigError::Invalid(format!("local_addr {:?}: {err}", config.local_addr))
            })?
            .next()
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "local_addr {:?} resolves to no address",
                    config.local_addr
                ))
            })?;

        let probe = MysqlProbe::new(executor, config.query_timeout());
        provision_mysql(&probe, config)?;

        let shared = Arc::new(SharedState::new());
        let hooks = HookRunner::new(
            config.leader_start_command.clone(),
            config.leader_stop_command.clone(),
            config.leader_fence_command.clone(),
            HOOK_TIMEOUT,
        );
        let effector = LeaderEffector::new(
            probe.clone(),
            hooks,
            config.repl_user.clone(),
            config.repl_password.clone(),
            config.mysql_port,
            config.semi_sync_timeout_ms,
            config.semi_sync_wait_slave_count,
            shared.clone(),
        );

        let (probe_tx, probe_rx) = bounded::<ProbeCommand>(PROBE_QUEUE_CAPACITY);
        let (effector_tx, effector_rx) = bounded::<EffectorJob>(EFFECTOR_QUEUE_CAPACITY);
        let mut peer_handles = Vec::with_capacity(config.peers.len());
        let mut peer_queues = Vec::with_capacity(config.peers.len());
        for peer in &config.peers {
            let (tx, rx) = bounded::<PeerCall>(PEER_QUEUE_CAPACITY);
            peer_handles.push(PeerHandle {
                addr: peer.clone(),
                tx,
            });
            peer_queues.push((peer.clone(), rx));
        }
        let outbound = Outbound {
            peers: peer_handles,
            probe: probe_tx,
            effector: effector_tx,
        };

        let machine_config = MachineConfig::from_config(config, election_seed(&config.local_addr));
        let (machine, machine_handle) = RaftMachine::spawn(machine_config, outbound, shared);
        let machine = Arc::new(machine);

        let events = machine.event_sender();
        let mut workers = Vec::with_capacity(config.peers.len() + 2);
        workers.push(spawn_probe_worker(probe.clone(), probe_rx, events.clone()));
        workers.push(spawn_effector_worker(effector, effector_rx, events.clone()));
        for (addr, rx) in peer_queues {
            workers.push(spawn_peer_worker(addr, rx, events.clone()));
        }

        let server = spawn_rpc_server(RpcServerConfig { bind }, machine.clone())?;
        info!(
            "event=supervisor_started local={} peers={}",
            config.local_addr,
            config.peers.len()
        );
        Ok(Supervisor {
            local_addr: config.local_addr.clone(),
            peers: config.peers.clone(),
            machine,
            machine_handle: Some(machine_handle),
            server: Some(server),
            workers,
        })
    }

    pub fn machine(&self) -> &Arc<RaftMachine> {
        &self.machine
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            local_addr: self.local_addr.clone(),
            peers: self.peers.clone(),
            node: self.machine.snapshot(),
        }
    }

    pub fn set_idle(&self, idle: bool) -> Result<(), SupervisorError> {
        Ok(self.machine.admin(AdminCommand::SetIdle(idle))?)
    }

    pub fn set_skip_purge_binlog(&self, skip: bool) -> Result<(), SupervisorError> {
        Ok(self.machine.admin(AdminCommand::SetSkipPurgeBinlog(skip))?)
    }

    pub fn set_skip_check_semi_sync(&self, skip: bool) -> Result<(), SupervisorError> {
        Ok(self.machine.admin(AdminCommand::SetSkipCheckSemiSync(skip))?)
    }

    pub fn step_down(&self) -> Result<(), SupervisorError> {
        Ok(self.machine.admin(AdminCommand::StepDown)?)
    }

    /// Stops accepting RPCs, demotes if leading, and joins every worker.
    pub fn stop(mut self) {
        info!("event=supervisor_stopping local={}", self.local_addr);
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
        if let Some(handle) = self.machine_handle.take() {
            handle.shutdown();
        }
        // The state loop dropped the outbound channels on exit; workers
        // observe the disconnect and drain out.
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("event=worker_panic local={}", self.local_addr);
            }
        }
        info!("event=supervisor_stopped local={}", self.local_addr);
    }
}

/// Ensures the replication account exists before the first promotion can
/// hand it to peers. A MySQL that is down at boot is tolerated (the node
/// starts INVALID and recovers); a MySQL that refuses the DDL is fatal.
fn provision_mysql<E: QueryExecutor>(
    probe: &MysqlProbe<E>,
    config: &Config,
) -> Result<(), SupervisorError> {
    if let Err(err) = probe.set_read_only(true) {
        if err.is_transient() {
            warn!("event=boot_read_only_skipped error={err}");
            return Ok(());
        }
        return Err(SupervisorError::Provision(err));
    }
    match probe.check_user_exists(&config.repl_user, "%") {
        Ok(true) => Ok(()),
        Ok(false) => {
            info!("event=repl_user_provisioning user={}", config.repl_user);
            let created = if config.ssl_enabled() {
                probe
                    .create_user(&config.repl_user, "%", &config.repl_password, SslType::Yes)
                    .and_then(|()| probe.grant_replication_privileges(&config.repl_user))
            } else {
                probe.create_repl_user_without_binlog(&config.repl_user, &config.repl_password)
            };
            created.map_err(SupervisorError::Provision)
        }
        Err(err) if err.is_transient() => {
            warn!("event=repl_user_check_skipped error={err}");
            Ok(())
        }
        Err(err) => Err(SupervisorError::Provision(err)),
    }
}

/// Per-node RNG seed: address fingerprint mixed with the boot clock so
/// restarts do not replay the same election jitter.
fn election_seed(local_addr: &str) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(local_addr.as_bytes());
    let addr_hash = u64::from(hasher.finalize());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0);
    addr_hash.wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ nanos
}
