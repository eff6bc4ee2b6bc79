pub mod effector;
pub mod election;
pub mod machine;
pub mod rpc;
pub(crate) mod workers;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Controller roles. FOLLOWER/CANDIDATE/LEADER are the election states;
/// IDLE is administratively paused (answers pings, neither votes nor
/// campaigns); INVALID means the local MySQL is unreachable or inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Idle,
    Invalid,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Follower => "FOLLOWER",
            Role::Candidate => "CANDIDATE",
            Role::Leader => "LEADER",
            Role::Idle => "IDLE",
            Role::Invalid => "INVALID",
        }
    }

    /// Only followers and candidates take part in elections.
    pub fn can_vote(&self) -> bool {
        matches!(self, Role::Follower | Role::Candidate)
    }

    pub(crate) fn wire_code(&self) -> u8 {
        match self {
            Role::Follower => 1,
            Role::Candidate => 2,
            Role::Leader => 3,
            Role::Idle => 4,
            Role::Invalid => 5,
        }
    }

    pub(crate) fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Role::Follower),
            2 => Some(Role::Candidate),
            3 => Some(Role::Leader),
            4 => Some(Role::Idle),
            5 => Some(Role::Invalid),
            _ => None,
        }
    }
}

/// Monotonic counters, incremented by the state loop, read by anyone.
#[derive(Debug, Default)]
pub struct RaftStats {
    promotes: AtomicU64,
    demotes: AtomicU64,
    elections_started: AtomicU64,
    votes_granted: AtomicU64,
    heartbeats_sent: AtomicU64,
    heartbeats_acked: AtomicU64,
    hook_failures: AtomicU64,
    binlog_purges: AtomicU64,
}

impl RaftStats {
    pub fn inc_promotes(&self) {
        self.promotes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_demotes(&self) {
        self.demotes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_elections_started(&self) {
        self.elections_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_votes_granted(&self) {
        self.votes_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_heartbeats_sent(&self, count: u64) {
        self.heartbeats_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_heartbeats_acked(&self) {
        self.heartbeats_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_hook_failures(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_binlog_purges(&self) {
        self.binlog_purges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            promotes: self.promotes.load(Ordering::Relaxed),
            demotes: self.demotes.load(Ordering::Relaxed),
            elections_started: self.elections_started.load(Ordering::Relaxed),
            votes_granted: self.votes_granted.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_acked: self.heartbeats_acked.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            binlog_purges: self.binlog_purges.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub promotes: u64,
    pub demotes: u64,
    pub elections_started: u64,
    pub votes_granted: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_acked: u64,
    pub hook_failures: u64,
    pub binlog_purges: u64,
}

/// Published node state. The state loop is the sole writer; everything else
/// reads through [`SharedState::snapshot`] without touching the loop.
#[derive(Debug, Default)]
pub struct SharedState {
    role: AtomicU8,
    term: AtomicU64,
    leader: RwLock<Option<String>>,
    pub stats: RaftStats,
}

impl SharedState {
    pub fn new() -> Self {
        let shared = SharedState::default();
        shared.publish_role(Role::Follower);
        shared
    }

    pub fn role(&self) -> Role {
        Role::from_wire(self.role.load(Ordering::Acquire)).unwrap_or(Role::Invalid)
    }

    pub fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    pub fn leader(&self) -> Option<String> {
        self.leader.read().clone()
    }

    pub(crate) fn publish_role(&self, role: Role) {
        self.role.store(role.wire_code(), Ordering::Release);
    }

    pub(crate) fn publish_term(&self, term: u64) {
        self.term.store(term, Ordering::Release);
    }

    pub(crate) fn publish_leader(&self, leader: Option<String>) {
        *self.leader.write() = leader;
    }

    pub fn snapshot(&self) -> NodeStatus {
        NodeStatus {
            role: self.role(),
            term: self.term(),
            leader: self.leader(),
            stats: self.stats.snapshot(),
        }
    }
}

/// Point-in-time view of the node, safe to serialize into admin surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub role: Role,
    pub term: u64,
    pub leader: Option<String>,
    pub stats: StatsSnapshot,
}
