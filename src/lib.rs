//! relayguard: a high-availability controller for MySQL.
//!
//! One controller runs next to each mysqld. The controllers elect a single
//! leader with a Raft-style protocol whose vote rule is augmented by a GTID
//! dominance check against the local server, then drive the replication
//! topology: the leader's MySQL becomes the writable source, every other
//! node is repointed at it, and shell hooks fence a failed leader away from
//! clients.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod config;
pub mod gtid;
pub mod hook;
pub mod mysql;
pub mod net;
pub mod raft;
pub mod supervisor;

pub use config::{Config, ConfigError};
pub use gtid::GtidState;
pub use hook::{HookError, HookKind, HookOutcome, HookRunner};
pub use mysql::{MysqlProbe, MysqlUser, PingEntry, ProbeError, QueryExecutor, Repl, Row, SslType};
pub use net::{NetError, PeerClient, ProtocolError};
pub use raft::machine::{
    AdminCommand, DeliverError, EffectorJob, EffectorJobKind, Event, MachineConfig, MachineHandle,
    Outbound, PeerCall, PeerHandle, ProbeCommand, RaftMachine,
};
pub use raft::rpc::{
    FrameError, MessageKind, MessageMeta, RaftMessage, RaftResponse, RetCode, OP_HEARTBEAT,
    OP_PING, OP_REQUEST_VOTE, OP_STATUS,
};
pub use raft::{NodeStatus, RaftStats, Role, SharedState, StatsSnapshot};
pub use supervisor::{Supervisor, SupervisorError, SupervisorStatus};
