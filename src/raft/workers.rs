use crate::gtid::GtidState;
use crate::mysql::{MysqlProbe, QueryExecutor};
use crate::net::client::PeerClient;
use crate::raft::effector::LeaderEffector;
use crate::raft::machine::{EffectorJob, EffectorJobKind, Event, PeerCall, ProbeCommand};
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, warn};
use std::thread;

/// Runs local MySQL observations off the state loop. Reports distinguish
/// "server gone" (unhealthy) from "server answered garbage" (untrusted):
/// the latter keeps the node a follower but blocks campaigning.
pub(crate) fn spawn_probe_worker<E: QueryExecutor + 'static>(
    probe: MysqlProbe<E>,
    commands: Receiver<ProbeCommand>,
    inbox: Sender<Event>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for command in commands {
            match command {
                ProbeCommand::Report { as_master } => {
                    let event = observe(&probe, as_master);
                    if inbox.send(event).is_err() {
                        break;
                    }
                }
                ProbeCommand::Subtract { token, subset, set } => {
                    let result = probe.gtid_subtract(&subset, &set);
                    if inbox.send(Event::SubtractResult { token, result }).is_err() {
                        break;
                    }
                }
                ProbeCommand::PurgeTo { file } => {
                    if let Err(err) = probe.purge_binlogs_to(&file) {
                        warn!("event=purge_binlogs_failed to={file} error={err}");
                    }
                }
            }
        }
    })
}

fn observe<E: QueryExecutor>(probe: &MysqlProbe<E>, as_master: bool) -> Event {
    if let Err(err) = probe.ping() {
        return if err.is_transient() {
            debug!("event=probe_ping_failed error={err}");
            Event::ProbeReport {
                healthy: false,
                trusted: false,
                gtid: GtidState::default(),
            }
        } else {
            error!("event=probe_semantic_error op=ping error={err}");
            Event::ProbeReport {
                healthy: true,
                trusted: false,
                gtid: GtidState::default(),
            }
        };
    }
    let gtid = if as_master {
        probe.master_gtid()
    } else {
        probe.slave_gtid()
    };
    match gtid {
        Ok(gtid) => Event::ProbeReport {
            healthy: true,
            trusted: true,
            gtid,
        },
        Err(err) if err.is_transient() => {
            debug!("event=probe_gtid_failed error={err}");
            Event::ProbeReport {
                healthy: false,
                trusted: false,
                gtid: GtidState::default(),
            }
        }
        Err(err) => {
            error!("event=probe_semantic_error op=gtid error={err}");
            Event::ProbeReport {
                healthy: true,
                trusted: false,
                gtid: GtidState::default(),
            }
        }
    }
}

/// Executes role-transition jobs strictly in order; this serialization is
/// what keeps hooks from overlapping across transitions.
pub(crate) fn spawn_effector_worker<E: QueryExecutor + 'static>(
    effector: LeaderEffector<E>,
    jobs: Receiver<EffectorJob>,
    inbox: Sender<Event>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for job in jobs {
            let result = match &job.kind {
                EffectorJobKind::Promote => effector.promote(),
                EffectorJobKind::Demote { fence } => {
                    effector.demote(*fence);
                    Ok(())
                }
                EffectorJobKind::ConfigureReplication { leader } => {
                    effector.configure_replication(leader)
                }
            };
            let done = Event::EffectorDone {
                kind: job.kind,
                term: job.term,
                result,
            };
            if inbox.send(done).is_err() {
                break;
            }
        }
    })
}

/// One worker per peer: calls stay in send order and a slow peer only
/// stalls its own queue.
pub(crate) fn spawn_peer_worker(
    addr: String,
    calls: Receiver<PeerCall>,
    inbox: Sender<Event>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let client = PeerClient::new(addr.clone());
        for call in calls {
            let kind = call.msg.kind;
            let sent_view = call.msg.meta.view_id;
            let result = client.call(&call.msg, call.deadline);
            let event = Event::PeerReply {
                peer: addr.clone(),
                kind,
                sent_view,
                result,
            };
            if inbox.send(event).is_err() {
                break;
            }
        }
    })
}
