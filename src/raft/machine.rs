use crate::config::Config;
use crate::gtid::GtidState;
use crate::mysql::ProbeError;
use crate::net::NetError;
use crate::raft::election::{
    evaluate_vote_request, randomized_timeout, ElectionTimer, VoteGate, VoteTally,
};
use crate::raft::rpc::{MessageKind, MessageMeta, RaftMessage, RaftResponse, RetCode};
use crate::raft::{NodeStatus, Role, SharedState};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const INBOX_CAPACITY: usize = 256;

/// Everything the state loop can be asked to process. The loop drains these
/// in FIFO order; handling one event is atomic with respect to node state.
pub enum Event {
    /// Inbound RPC with its reply slot. The submitting thread parks on the
    /// receiver until the loop answers or the caller's deadline fires.
    Rpc {
        msg: RaftMessage,
        reply: Sender<RaftResponse>,
    },
    /// Completion of an outbound call issued through a peer worker.
    PeerReply {
        peer: String,
        kind: MessageKind,
        sent_view: u64,
        result: Result<RaftResponse, NetError>,
    },
    /// Periodic local MySQL observation.
    ProbeReport {
        healthy: bool,
        trusted: bool,
        gtid: GtidState,
    },
    /// Completion of a `GTID_SUBTRACT` issued for a parked decision.
    SubtractResult {
        token: u64,
        result: Result<String, ProbeError>,
    },
    /// Completion of an effector job.
    EffectorDone {
        kind: EffectorJobKind,
        term: u64,
        result: Result<(), ProbeError>,
    },
    Admin(AdminCommand),
    /// Forces an immediate deadline sweep.
    Tick,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    SetIdle(bool),
    SetSkipPurgeBinlog(bool),
    SetSkipCheckSemiSync(bool),
    StepDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectorJobKind {
    Promote,
    Demote { fence: bool },
    ConfigureReplication { leader: String },
}

/// Unit of work for the effector worker. Jobs run strictly one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectorJob {
    pub kind: EffectorJobKind,
    pub term: u64,
}

/// Unit of work for the probe worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeCommand {
    /// Observe health and GTID state; `as_master` selects the master-side
    /// status query.
    Report { as_master: bool },
    /// `GTID_SUBTRACT(subset, set)` for a parked decision.
    Subtract {
        token: u64,
        subset: String,
        set: String,
    },
    PurgeTo { file: String },
}

/// Outbound call handed to a per-peer worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCall {
    pub msg: RaftMessage,
    pub deadline: Duration,
}

pub struct PeerHandle {
    pub addr: String,
    pub tx: Sender<PeerCall>,
}

/// Channels to the worker tasks. The machine owns the sending side; workers
/// post completions back into the inbox.
pub struct Outbound {
    pub peers: Vec<PeerHandle>,
    pub probe: Sender<ProbeCommand>,
    pub effector: Sender<EffectorJob>,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub local_addr: String,
    pub peers: Vec<String>,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub candidate_wait: Duration,
    pub rpc_timeout: Duration,
    pub probe_interval: Duration,
    pub purge_interval: Duration,
    pub seed: u64,
}

impl MachineConfig {
    pub fn from_config(config: &Config, seed: u64) -> Self {
        Self {
            local_addr: config.local_addr.clone(),
            peers: config.peers.clone(),
            election_timeout: config.election_timeout(),
            heartbeat_interval: config.heartbeat_timeout(),
            candidate_wait: config.candidate_wait(),
            rpc_timeout: config.heartbeat_timeout(),
            probe_interval: config.heartbeat_timeout(),
            purge_interval: config.purge_binlog_interval(),
            seed,
        }
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Stable fingerprint of the configured membership.
    fn epoch_id(&self) -> u64 {
        let mut members: Vec<&str> = self.peers.iter().map(String::as_str).collect();
        members.push(&self.local_addr);
        members.sort_unstable();
        let mut hasher = crc32fast::Hasher::new();
        for member in members {
            hasher.update(member.as_bytes());
            hasher.update(b"\n");
        }
        u64::from(hasher.finalize())
    }
}

#[derive(Debug, Error)]
pub enum DeliverError {
    #[error("state machine inbox closed")]
    Closed,
    #[error("state machine reply timed out")]
    Timeout,
}

/// Handle to the running state loop. `deliver` suspends the caller until the
/// loop answers; `snapshot` never touches the loop.
pub struct RaftMachine {
    inbox: Sender<Event>,
    shared: Arc<SharedState>,
    rpc_timeout: Duration,
}

impl RaftMachine {
    pub fn spawn(
        cfg: MachineConfig,
        outbound: Outbound,
        shared: Arc<SharedState>,
    ) -> (RaftMachine, MachineHandle) {
        let (tx, rx) = bounded(INBOX_CAPACITY);
        let rpc_timeout = cfg.rpc_timeout;
        let machine = RaftMachine {
            inbox: tx.clone(),
            shared: shared.clone(),
            rpc_timeout,
        };
        let join = thread::spawn(move || StateLoop::new(cfg, outbound, shared, rx).run());
        let handle = MachineHandle {
            inbox: tx,
            join: Some(join),
        };
        (machine, handle)
    }

    pub fn deliver(&self, msg: RaftMessage) -> Result<RaftResponse, DeliverError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.inbox
            .send_timeout(Event::Rpc { msg, reply: reply_tx }, self.rpc_timeout)
            .map_err(|_| DeliverError::Closed)?;
        reply_rx
            .recv_timeout(self.rpc_timeout)
            .map_err(|_| DeliverError::Timeout)
    }

    pub fn admin(&self, command: AdminCommand) -> Result<(), DeliverError> {
        self.inbox
            .send(Event::Admin(command))
            .map_err(|_| DeliverError::Closed)
    }

    pub fn tick(&self) {
        let _ = self.inbox.try_send(Event::Tick);
    }

    pub fn snapshot(&self) -> NodeStatus {
        self.shared.snapshot()
    }

    /// Inbox handle for worker wiring and test drivers.
    pub fn event_sender(&self) -> Sender<Event> {
        self.inbox.clone()
    }
}

impl crate::net::server::RaftService for RaftMachine {
    fn dispatch(&self, msg: RaftMessage) -> Result<RaftResponse, DeliverError> {
        self.deliver(msg)
    }
}

pub struct MachineHandle {
    inbox: Sender<Event>,
    join: Option<thread::JoinHandle<()>>,
}

impl MachineHandle {
    /// Asks the loop to demote (if leading) and exit, then joins it.
    pub fn shutdown(mut self) {
        let _ = self.inbox.send(Event::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("event=state_loop_panic");
            }
        }
    }
}

impl Drop for MachineHandle {
    fn drop(&mut self) {
        let _ = self.inbox.send(Event::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct PendingVote {
    candidate: String,
    term: u64,
    token: u64,
    reply: Sender<RaftResponse>,
}

enum SubtractPurpose {
    Vote,
    DirtyCheck { leader: String },
}

struct StateLoop {
    cfg: MachineConfig,
    quorum: usize,
    epoch_id: u64,
    rng: ChaCha20Rng,
    shared: Arc<SharedState>,
    inbox: Receiver<Event>,
    outbound: Outbound,

    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader: Option<String>,
    skip_purge_binlog: bool,
    skip_check_semi_sync: bool,

    local_gtid: GtidState,
    mysql_healthy: bool,
    gtid_trusted: bool,

    dirty_leaders: HashSet<String>,
    dirty_checked: HashSet<String>,

    election_timer: ElectionTimer,
    candidate_backoff: bool,
    heartbeat_deadline: Option<Instant>,
    probe_deadline: Instant,
    purge_deadline: Instant,

    tally: Option<VoteTally>,
    pending_vote: Option<PendingVote>,
    next_token: u64,
    pending_subtracts: HashMap<u64, SubtractPurpose>,

    pending_role: Option<Role>,
    transition_jobs: usize,

    peer_last_ack: HashMap<String, Instant>,
    peer_gtids: HashMap<String, GtidState>,

    shutting_down: bool,
}

impl StateLoop {
    fn new(
        cfg: MachineConfig,
        outbound: Outbound,
        shared: Arc<SharedState>,
        inbox: Receiver<Event>,
    ) -> Self {
        let now = Instant::now();
        let quorum = cfg.quorum();
        let epoch_id = cfg.epoch_id();
        let mut rng = ChaCha20Rng::seed_from_u64(cfg.seed);
        let first_timeout = randomized_timeout(&mut rng, cfg.election_timeout);
        let probe_deadline = now;
        let purge_deadline = now + cfg.purge_interval;
        shared.publish_role(Role::Follower);
        Self {
            quorum,
            epoch_id,
            rng,
            shared,
            inbox,
            outbound,
            role: Role::Follower,
            current_term: 0,
            voted_for: None,
            leader: None,
            skip_purge_binlog: false,
            skip_check_semi_sync: false,
            local_gtid: GtidState::default(),
            // Until the first probe answers, the node neither campaigns nor
            // certifies votes.
            mysql_healthy: false,
            gtid_trusted: false,
            dirty_leaders: HashSet::new(),
            dirty_checked: HashSet::new(),
            election_timer: ElectionTimer::new(now, first_timeout),
            candidate_backoff: false,
            heartbeat_deadline: None,
            probe_deadline,
            purge_deadline,
            tally: None,
            pending_vote: None,
            next_token: 0,
            pending_subtracts: HashMap::new(),
            pending_role: None,
            transition_jobs: 0,
            peer_last_ack: HashMap::new(),
            peer_gtids: HashMap::new(),
            shutting_down: false,
            cfg,
        }
    }

    fn run(mut self) {
        info!(
            "event=state_loop_start local={} peers={} quorum={}",
            self.cfg.local_addr,
            self.cfg.peers.len(),
            self.quorum
        );
        loop {
            let deadline = self.next_deadline();
            match self.inbox.recv_deadline(deadline) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => self.handle_deadlines(Instant::now()),
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.shutting_down && self.transition_jobs == 0 {
                break;
            }
        }
        if let Some(pending) = self.pending_vote.take() {
            let response = self.response(RetCode::InvalidRequest, None);
            let _ = pending.reply.send(response);
        }
        info!("event=state_loop_stop local={}", self.cfg.local_addr);
    }

    fn next_deadline(&self) -> Instant {
        let mut deadline = self.probe_deadline;
        match self.role {
            Role::Follower | Role::Candidate => {
                deadline = deadline.min(self.election_timer.deadline());
            }
            Role::Leader => {
                if let Some(hb) = self.heartbeat_deadline {
                    deadline = deadline.min(hb);
                }
                if !self.skip_purge_binlog {
                    deadline = deadline.min(self.purge_deadline);
                }
            }
            Role::Idle | Role::Invalid => {}
        }
        deadline
    }

    fn handle_deadlines(&mut self, now: Instant) {
        if now >= self.probe_deadline {
            self.request_probe_report();
            self.probe_deadline = now + self.cfg.probe_interval;
        }
        match self.role {
            Role::Follower if self.election_timer.expired(now) => {
                if self.can_campaign() {
                    self.start_election(now);
                } else {
                    debug!(
                        "event=election_skipped reason=mysql_unsafe healthy={} trusted={}",
                        self.mysql_healthy, self.gtid_trusted
                    );
                    self.reset_election_timer(now);
                }
            }
            Role::Candidate if self.election_timer.expired(now) => {
                if self.pending_role.is_some() {
                    // Promotion already in flight; let it settle.
                    self.reset_election_timer(now);
                } else if self.candidate_backoff {
                    if self.can_campaign() {
                        self.start_election(now);
                    } else {
                        self.step_down_to_follower_locally(now);
                    }
                } else {
                    // The vote window closed without a majority; back off a
                    // randomized interval before the next term.
                    self.candidate_backoff = true;
                    let backoff = randomized_timeout(&mut self.rng, self.cfg.election_timeout);
                    self.election_timer.reset(now, backoff);
                    if let Some(tally) = &self.tally {
                        if tally.quorum_impossible(self.cfg.peers.len() + 1, self.quorum) {
                            warn!(
                                "event=election_no_quorum term={} unreachable={}",
                                self.current_term,
                                tally.voters_unreachable()
                            );
                        }
                    }
                }
            }
            Role::Leader => {
                if self
                    .heartbeat_deadline
                    .map(|deadline| now >= deadline)
                    .unwrap_or(false)
                {
                    self.broadcast_heartbeats(now);
                    self.heartbeat_deadline = Some(now + self.cfg.heartbeat_interval);
                    self.check_leader_quorum(now);
                }
                if !self.skip_purge_binlog && now >= self.purge_deadline {
                    self.purge_binlogs();
                    self.purge_deadline = now + self.cfg.purge_interval;
                }
            }
            _ => {}
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Rpc { msg, reply } => self.handle_rpc(msg, reply),
            Event::PeerReply {
                peer,
                kind,
                sent_view,
                result,
            } => self.handle_peer_reply(peer, kind, sent_view, result),
            Event::ProbeReport {
                healthy,
                trusted,
                gtid,
            } => self.handle_probe_report(healthy, trusted, gtid),
            Event::SubtractResult { token, result } => self.handle_subtract(token, result),
            Event::EffectorDone { kind, term, result } => {
                self.handle_effector_done(kind, term, result)
            }
            Event::Admin(command) => self.handle_admin(command),
            Event::Tick => self.handle_deadlines(Instant::now()),
            Event::Shutdown => {
                self.shutting_down = true;
                if self.is_leading() {
                    self.step_down(Role::Follower, false);
                }
            }
        }
    }

    // ---- inbound RPCs ----

    fn handle_rpc(&mut self, msg: RaftMessage, reply: Sender<RaftResponse>) {
        let kind = msg.kind;
        let meta = msg.meta;

        // Pings and status probes answer regardless of epoch or term.
        match kind {
            MessageKind::Ping => {
                let _ = reply.send(self.response(RetCode::Ok, None));
                return;
            }
            MessageKind::Status => {
                let gtid = Some(self.local_gtid.clone());
                let _ = reply.send(self.response(RetCode::Ok, gtid));
                return;
            }
            _ => {}
        }

        if meta.epoch_id != self.epoch_id {
            warn!(
                "event=epoch_mismatch from={} theirs={:x} ours={:x}",
                meta.from, meta.epoch_id, self.epoch_id
            );
            let _ = reply.send(self.response(RetCode::InvalidRequest, None));
            return;
        }

        if meta.view_id > self.current_term {
            self.adopt_term(meta.view_id);
        }

        match kind {
            MessageKind::Heartbeat => self.handle_heartbeat(meta, reply),
            MessageKind::RequestVote => self.handle_request_vote(meta, reply),
            MessageKind::Ping | MessageKind::Status => unreachable!("handled above"),
        }
    }

    fn handle_heartbeat(&mut self, meta: MessageMeta, reply: Sender<RaftResponse>) {
        if meta.view_id < self.current_term {
            let _ = reply.send(self.response(RetCode::InvalidViewId, None));
            return;
        }
        match self.role {
            Role::Idle | Role::Invalid => {
                let _ = reply.send(self.response(RetCode::InvalidRequest, None));
                return;
            }
            Role::Leader => {
                if self.pending_role.is_none() {
                    // Same term, another node claims leadership: dual-leader
                    // symptom. Reject and alert; the term rule untangles it.
                    error!(
                        "event=dual_leader_heartbeat from={} term={}",
                        meta.from, meta.view_id
                    );
                } else {
                    // Demotion in flight; answer with the pre-transition
                    // role and let the sender retry.
                    debug!(
                        "event=heartbeat_deferred from={} reason=transition_pending",
                        meta.from
                    );
                }
                let _ = reply.send(self.response(RetCode::InvalidRequest, None));
                return;
            }
            Role::Candidate => {
                // A leader exists for this term; concede.
                self.tally = None;
                self.candidate_backoff = false;
                self.set_role(Role::Follower);
            }
            Role::Follower => {}
        }

        if let Some(current) = &self.leader {
            if current != &meta.from {
                warn!(
                    "event=conflicting_leader_heartbeat from={} recorded={} term={}",
                    meta.from, current, self.current_term
                );
                let _ = reply.send(self.response(RetCode::InvalidRequest, None));
                return;
            }
        }

        let leader_changed = self.leader.as_deref() != Some(meta.from.as_str());
        if leader_changed {
            info!(
                "event=leader_recorded leader={} term={}",
                meta.from, self.current_term
            );
            self.set_leader(Some(meta.from.clone()));
            self.submit_effector_job(EffectorJobKind::ConfigureReplication {
                leader: meta.from.clone(),
            });
        }
        self.reset_election_timer(Instant::now());

        // Dirty-leader check: a leader whose GTID trails ours loses its
        // eligibility for future votes, but the heartbeat itself is still
        // acknowledged to avoid split elections.
        if !self.skip_check_semi_sync
            && !self.dirty_checked.contains(&meta.from)
            && !meta.gtid.executed_gtid_set.is_empty()
            && !self.local_gtid.executed_gtid_set.is_empty()
        {
            self.dirty_checked.insert(meta.from.clone());
            let token = self.allocate_token(SubtractPurpose::DirtyCheck {
                leader: meta.from.clone(),
            });
            self.request_subtract(
                token,
                self.local_gtid.executed_gtid_set.clone(),
                meta.gtid.executed_gtid_set.clone(),
            );
        }

        let gtid = Some(self.local_gtid.clone());
        let _ = reply.send(self.response(RetCode::Ok, gtid));
    }

    fn handle_request_vote(&mut self, meta: MessageMeta, reply: Sender<RaftResponse>) {
        if !self.mysql_healthy {
            let _ = reply.send(self.response(RetCode::MysqlUnreachable, None));
            return;
        }
        let gate = evaluate_vote_request(
            self.role,
            self.current_term,
            self.voted_for.as_deref(),
            self.pending_vote.is_some(),
            &self.dirty_leaders,
            &meta.from,
            meta.view_id,
        );
        match gate {
            VoteGate::Refuse(code) => {
                debug!(
                    "event=vote_refused candidate={} term={} code={}",
                    meta.from,
                    meta.view_id,
                    code.as_str()
                );
                let _ = reply.send(self.response(code, None));
            }
            VoteGate::CheckGtid => {
                let token = self.allocate_token(SubtractPurpose::Vote);
                self.pending_vote = Some(PendingVote {
                    candidate: meta.from.clone(),
                    term: meta.view_id,
                    token,
                    reply,
                });
                self.request_subtract(
                    token,
                    self.local_gtid.executed_gtid_set.clone(),
                    meta.gtid.executed_gtid_set.clone(),
                );
            }
        }
    }

    // ---- worker completions ----

    fn handle_peer_reply(
        &mut self,
        peer: String,
        kind: MessageKind,
        sent_view: u64,
        result: Result<RaftResponse, NetError>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                debug!(
                    "event=peer_call_failed peer={} kind={} error={}",
                    peer,
                    kind.as_str(),
                    err
                );
                return;
            }
        };
        if response.view_id > self.current_term {
            self.adopt_term(response.view_id);
            return;
        }
        match kind {
            MessageKind::RequestVote => {
                if self.role != Role::Candidate || sent_view != self.current_term {
                    return;
                }
                let Some(tally) = self.tally.as_mut() else {
                    return;
                };
                match response.retcode {
                    RetCode::Ok => tally.record_grant(peer),
                    RetCode::MysqlUnreachable => tally.record_unreachable(peer),
                    _ => tally.record_reject(peer),
                }
                if tally.quorum_reached(self.quorum) {
                    self.begin_promotion();
                }
            }
            MessageKind::Heartbeat => {
                if self.role != Role::Leader || sent_view != self.current_term {
                    return;
                }
                if response.retcode == RetCode::Ok {
                    self.peer_last_ack.insert(peer.clone(), Instant::now());
                    self.shared.stats.inc_heartbeats_acked();
                    if let Some(gtid) = response.gtid {
                        self.peer_gtids.insert(peer, gtid);
                    }
                } else {
                    debug!(
                        "event=heartbeat_refused peer={} code={}",
                        peer,
                        response.retcode.as_str()
                    );
                }
            }
            MessageKind::Ping | MessageKind::Status => {}
        }
    }

    fn handle_probe_report(&mut self, healthy: bool, trusted: bool, gtid: GtidState) {
        let was_healthy = self.mysql_healthy;
        self.mysql_healthy = healthy;
        self.gtid_trusted = trusted;
        if healthy && trusted {
            self.local_gtid = gtid;
        }
        if !healthy {
            match self.role {
                Role::Leader => {
                    warn!("event=leader_mysql_unreachable term={}", self.current_term);
                    self.step_down(Role::Invalid, true);
                }
                Role::Candidate => {
                    if self.pending_role.is_some() {
                        // Promotion in flight against a dead server; the
                        // effector will fail it and we fall back below.
                        return;
                    }
                    self.tally = None;
                    self.step_down_to_follower_locally(Instant::now());
                }
                Role::Follower => {
                    warn!("event=mysql_unreachable role=follower");
                    self.set_role(Role::Invalid);
                }
                Role::Idle | Role::Invalid => {}
            }
        } else if self.role == Role::Invalid {
            info!(
                "event=mysql_recovered term={} role=follower",
                self.current_term
            );
            self.set_role(Role::Follower);
            self.reset_election_timer(Instant::now());
        } else if !was_healthy {
            debug!("event=mysql_recovered role={}", self.role.as_str());
        }
    }

    fn handle_subtract(&mut self, token: u64, result: Result<String, ProbeError>) {
        let Some(purpose) = self.pending_subtracts.remove(&token) else {
            return;
        };
        match purpose {
            SubtractPurpose::Vote => self.finish_vote(token, result),
            SubtractPurpose::DirtyCheck { leader } => match result {
                Ok(diff) if diff.is_empty() => {
                    self.dirty_leaders.remove(&leader);
                }
                Ok(_) => {
                    warn!(
                        "event=dirty_leader_detected leader={} term={}",
                        leader, self.current_term
                    );
                    self.dirty_leaders.insert(leader);
                }
                Err(err) => {
                    // Re-check on the next leader change.
                    debug!("event=dirty_check_failed leader={} error={}", leader, err);
                    self.dirty_checked.remove(&leader);
                }
            },
        }
    }

    fn finish_vote(&mut self, token: u64, result: Result<String, ProbeError>) {
        let Some(pending) = self.pending_vote.take() else {
            return;
        };
        if pending.token != token {
            self.pending_vote = Some(pending);
            return;
        }
        if pending.term != self.current_term || !self.role.can_vote() {
            let _ = pending.reply.send(self.response(RetCode::InvalidViewId, None));
            return;
        }
        match result {
            Ok(diff) if diff.is_empty() => {
                // Grant: the candidate's executed set covers ours.
                self.voted_for = Some(pending.candidate.clone());
                self.shared.stats.inc_votes_granted();
                self.reset_election_timer(Instant::now());
                info!(
                    "event=vote_granted candidate={} term={}",
                    pending.candidate, self.current_term
                );
                let _ = pending.reply.send(self.response(RetCode::Ok, None));
            }
            Ok(diff) => {
                info!(
                    "event=vote_refused candidate={} term={} missing={}",
                    pending.candidate, self.current_term, diff
                );
                let _ = pending.reply.send(self.response(RetCode::InvalidGtid, None));
            }
            Err(err) => {
                warn!(
                    "event=vote_check_failed candidate={} error={}",
                    pending.candidate, err
                );
                let _ = pending
                    .reply
                    .send(self.response(RetCode::MysqlUnreachable, None));
            }
        }
    }

    fn handle_effector_done(
        &mut self,
        kind: EffectorJobKind,
        term: u64,
        result: Result<(), ProbeError>,
    ) {
        match kind {
            EffectorJobKind::ConfigureReplication { leader } => {
                if let Err(err) = result {
                    warn!(
                        "event=replication_configure_failed leader={} error={}",
                        leader, err
                    );
                }
                return;
            }
            EffectorJobKind::Promote => {
                self.transition_jobs = self.transition_jobs.saturating_sub(1);
                match result {
                    Ok(()) if self.pending_role == Some(Role::Leader)
                        && term == self.current_term =>
                    {
                        self.apply_leadership();
                    }
                    Ok(()) => {
                        // Superseded mid-flight; a demotion job is queued
                        // behind this one and will settle the role.
                        debug!(
                            "event=promotion_superseded term={} current={}",
                            term, self.current_term
                        );
                    }
                    Err(err) => {
                        error!("event=promotion_failed term={} error={}", term, err);
                        if self.pending_role == Some(Role::Leader) {
                            self.pending_role = None;
                            self.tally = None;
                            self.step_down_to_follower_locally(Instant::now());
                        }
                    }
                }
            }
            EffectorJobKind::Demote { .. } => {
                self.transition_jobs = self.transition_jobs.saturating_sub(1);
                if self.transition_jobs == 0 {
                    if let Some(target) = self.pending_role.take() {
                        self.shared.stats.inc_demotes();
                        self.set_role(target);
                        if target == Role::Follower {
                            self.reset_election_timer(Instant::now());
                        }
                        info!(
                            "event=demotion_applied role={} term={}",
                            target.as_str(),
                            self.current_term
                        );
                    }
                }
            }
        }
    }

    fn handle_admin(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::SetIdle(true) => {
                if self.role == Role::Idle {
                    return;
                }
                info!("event=admin_idle term={}", self.current_term);
                if self.is_leading() {
                    self.step_down(Role::Idle, false);
                } else {
                    self.tally = None;
                    self.set_role(Role::Idle);
                }
            }
            AdminCommand::SetIdle(false) => {
                if self.role == Role::Idle {
                    info!("event=admin_unidle term={}", self.current_term);
                    self.set_role(Role::Follower);
                    self.reset_election_timer(Instant::now());
                }
            }
            AdminCommand::SetSkipPurgeBinlog(skip) => {
                info!("event=admin_skip_purge_binlog skip={skip}");
                if self.skip_purge_binlog && !skip {
                    // Purging resumes at the next scheduled interval, not
                    // immediately on re-enable.
                    self.purge_deadline = Instant::now() + self.cfg.purge_interval;
                }
                self.skip_purge_binlog = skip;
            }
            AdminCommand::SetSkipCheckSemiSync(skip) => {
                info!("event=admin_skip_check_semi_sync skip={skip}");
                self.skip_check_semi_sync = skip;
            }
            AdminCommand::StepDown => {
                if self.is_leading() {
                    info!("event=admin_step_down term={}", self.current_term);
                    self.step_down(Role::Follower, false);
                }
            }
        }
    }

    // ---- transitions ----

    fn can_campaign(&self) -> bool {
        self.mysql_healthy
            && self.gtid_trusted
            && self.pending_role.is_none()
            && !self.shutting_down
    }

    fn start_election(&mut self, now: Instant) {
        self.current_term += 1;
        self.shared.publish_term(self.current_term);
        self.voted_for = Some(self.cfg.local_addr.clone());
        self.set_leader(None);
        self.set_role(Role::Candidate);
        self.candidate_backoff = false;
        self.tally = Some(VoteTally::new(
            self.current_term,
            self.cfg.local_addr.clone(),
        ));
        self.shared.stats.inc_elections_started();
        info!(
            "event=election_started term={} peers={}",
            self.current_term,
            self.cfg.peers.len()
        );
        let msg = self.message(MessageKind::RequestVote);
        self.broadcast(msg);
        self.election_timer.reset(now, self.cfg.candidate_wait);
        // Single-node cluster: the self vote is already a majority.
        if self
            .tally
            .as_ref()
            .map(|tally| tally.quorum_reached(self.quorum))
            .unwrap_or(false)
        {
            self.begin_promotion();
        }
    }

    fn begin_promotion(&mut self) {
        if self.pending_role.is_some() {
            return;
        }
        info!(
            "event=promotion_started term={} votes={}",
            self.current_term,
            self.tally.as_ref().map(VoteTally::votes_granted).unwrap_or(0)
        );
        self.pending_role = Some(Role::Leader);
        self.tally = None;
        self.submit_transition(EffectorJobKind::Promote);
    }

    fn apply_leadership(&mut self) {
        self.pending_role = None;
        self.set_role(Role::Leader);
        self.set_leader(Some(self.cfg.local_addr.clone()));
        self.shared.stats.inc_promotes();
        let now = Instant::now();
        self.peer_last_ack.clear();
        for peer in &self.cfg.peers {
            self.peer_last_ack.insert(peer.clone(), now);
        }
        self.peer_gtids.clear();
        self.heartbeat_deadline = Some(now);
        self.purge_deadline = now + self.cfg.purge_interval;
        info!("event=promotion_applied term={}", self.current_term);
        self.handle_deadlines(now);
    }

    /// Leader (or pending leader) relinquishes leadership through the
    /// effector; everyone else just changes role.
    fn step_down(&mut self, target: Role, fence: bool) {
        self.set_leader(None);
        self.tally = None;
        self.heartbeat_deadline = None;
        match self.pending_role {
            Some(Role::Leader) => {
                // Promotion in flight: queue the demotion behind it so the
                // effector settles both in order.
                self.pending_role = Some(target);
                self.submit_transition(EffectorJobKind::Demote { fence });
            }
            Some(_) => {
                // A demotion is already in flight; retarget it instead of
                // running the hooks a second time.
                self.pending_role = Some(target);
            }
            None if self.role == Role::Leader => {
                self.pending_role = Some(target);
                self.submit_transition(EffectorJobKind::Demote { fence });
            }
            None => {
                self.set_role(target);
                if target == Role::Follower {
                    self.reset_election_timer(Instant::now());
                }
            }
        }
    }

    fn step_down_to_follower_locally(&mut self, now: Instant) {
        self.candidate_backoff = false;
        self.set_role(Role::Follower);
        self.reset_election_timer(now);
    }

    /// A higher term was observed. Takes effect before any further event.
    fn adopt_term(&mut self, term: u64) {
        debug_assert!(term > self.current_term);
        info!(
            "event=term_adopted old={} new={} role={}",
            self.current_term,
            term,
            self.role.as_str()
        );
        self.current_term = term;
        self.shared.publish_term(term);
        self.voted_for = None;
        self.dirty_checked.clear();
        if let Some(pending) = self.pending_vote.take() {
            let response = self.response(RetCode::InvalidViewId, None);
            let _ = pending.reply.send(response);
        }
        match self.role {
            Role::Leader => self.step_down(Role::Follower, false),
            Role::Candidate => {
                if self.pending_role == Some(Role::Leader) {
                    self.step_down(Role::Follower, false);
                } else {
                    self.tally = None;
                    self.step_down_to_follower_locally(Instant::now());
                    self.set_leader(None);
                }
            }
            Role::Follower => self.set_leader(None),
            // Idle and invalid keep their role but track the epoch so a
            // later re-entry joins at the right term.
            Role::Idle | Role::Invalid => self.set_leader(None),
        }
    }

    // ---- leader duties ----

    fn broadcast_heartbeats(&mut self, _now: Instant) {
        let msg = self.message(MessageKind::Heartbeat);
        self.broadcast(msg);
        self.shared
            .stats
            .add_heartbeats_sent(self.cfg.peers.len() as u64);
    }

    fn check_leader_quorum(&mut self, now: Instant) {
        let window = self.cfg.election_timeout;
        let fresh = self
            .peer_last_ack
            .values()
            .filter(|ack| now.saturating_duration_since(**ack) < window)
            .count();
        if fresh + 1 < self.quorum {
            warn!(
                "event=leader_lost_quorum term={} fresh_acks={} quorum={}",
                self.current_term, fresh, self.quorum
            );
            self.step_down(Role::Follower, false);
        }
    }

    fn purge_binlogs(&mut self) {
        if !self.mysql_healthy {
            return;
        }
        // Only purge up to binlogs every peer has retrieved; a peer we have
        // not heard from blocks purging entirely.
        let mut files = Vec::with_capacity(self.cfg.peers.len());
        for peer in &self.cfg.peers {
            match self.peer_gtids.get(peer) {
                Some(gtid) if !gtid.master_log_file.is_empty() => {
                    files.push(gtid.master_log_file.clone());
                }
                _ => {
                    debug!("event=purge_skipped reason=peer_position_unknown peer={peer}");
                    return;
                }
            }
        }
        let Some(file) = files.into_iter().min() else {
            return;
        };
        info!("event=purge_binlogs to={file}");
        self.shared.stats.inc_binlog_purges();
        if let Err(err) = self.outbound.probe.try_send(ProbeCommand::PurgeTo { file }) {
            warn!("event=purge_submit_failed error={err}");
        }
    }

    // ---- plumbing ----

    fn message(&self, kind: MessageKind) -> RaftMessage {
        RaftMessage {
            kind,
            meta: MessageMeta {
                from: self.cfg.local_addr.clone(),
                view_id: self.current_term,
                epoch_id: self.epoch_id,
                peers: self.cfg.peers.clone(),
                leader: self.leader.clone().unwrap_or_default(),
                gtid: self.local_gtid.clone(),
            },
        }
    }

    fn response(&self, retcode: RetCode, gtid: Option<GtidState>) -> RaftResponse {
        RaftResponse {
            from: self.cfg.local_addr.clone(),
            view_id: self.current_term,
            epoch_id: self.epoch_id,
            retcode,
            state: self.role,
            gtid,
        }
    }

    fn broadcast(&self, msg: RaftMessage) {
        for peer in &self.outbound.peers {
            let call = PeerCall {
                msg: msg.clone(),
                deadline: self.cfg.rpc_timeout,
            };
            match peer.tx.try_send(call) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!("event=peer_queue_full peer={}", peer.addr);
                }
                Err(TrySendError::Disconnected(_)) => {
                    debug!("event=peer_worker_gone peer={}", peer.addr);
                }
            }
        }
    }

    fn request_probe_report(&self) {
        let as_master = self.role == Role::Leader || self.pending_role == Some(Role::Leader);
        if self
            .outbound
            .probe
            .try_send(ProbeCommand::Report { as_master })
            .is_err()
        {
            debug!("event=probe_worker_unavailable");
        }
    }

    fn request_subtract(&mut self, token: u64, subset: String, set: String) {
        let command = ProbeCommand::Subtract { token, subset, set };
        if self.outbound.probe.try_send(command).is_err() {
            // Worker gone: fail the parked decision immediately.
            self.handle_subtract(
                token,
                Err(ProbeError::Connect("probe worker unavailable".into())),
            );
        }
    }

    fn allocate_token(&mut self, purpose: SubtractPurpose) -> u64 {
        self.next_token += 1;
        self.pending_subtracts.insert(self.next_token, purpose);
        self.next_token
    }

    fn submit_transition(&mut self, kind: EffectorJobKind) {
        self.transition_jobs += 1;
        if !self.submit_effector_job(kind.clone()) {
            // No effector: settle the transition locally so the machine
            // cannot wedge.
            error!("event=effector_unavailable kind={kind:?}");
            self.handle_effector_done(kind, self.current_term, Ok(()));
        }
    }

    fn submit_effector_job(&self, kind: EffectorJobKind) -> bool {
        let job = EffectorJob {
            kind,
            term: self.current_term,
        };
        match self.outbound.effector.try_send(job) {
            Ok(()) => true,
            Err(err) => {
                warn!("event=effector_submit_failed error={err}");
                false
            }
        }
    }

    fn set_role(&mut self, role: Role) {
        if self.role != role {
            info!(
                "event=role_changed from={} to={} term={}",
                self.role.as_str(),
                role.as_str(),
                self.current_term
            );
        }
        self.role = role;
        self.shared.publish_role(role);
    }

    fn set_leader(&mut self, leader: Option<String>) {
        self.leader = leader.clone();
        self.shared.publish_leader(leader);
    }

    fn is_leading(&self) -> bool {
        self.role == Role::Leader || self.pending_role == Some(Role::Leader)
    }

    fn reset_election_timer(&mut self, now: Instant) {
        let timeout = randomized_timeout(&mut self.rng, self.cfg.election_timeout);
        self.election_timer.reset(now, timeout);
    }
}
