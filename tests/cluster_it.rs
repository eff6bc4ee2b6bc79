mod common;

use common::{next_loopback, wait_until, FakeMysql};
use relayguard::{Config, Role, Supervisor};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ELECTION_MS: u64 = 300;
const HEARTBEAT_MS: u64 = 100;

struct Cluster {
    addrs: Vec<String>,
    fakes: Vec<Arc<FakeMysql>>,
    nodes: Vec<Option<Supervisor>>,
    _hooks_dir: TempDir,
    hooks_dir_path: std::path::PathBuf,
}

fn start_cluster(size: usize) -> Cluster {
    let _ = env_logger::builder().is_test(true).try_init();
    let hooks_dir = TempDir::new().expect("hook dir");
    let addrs: Vec<String> = (0..size).map(|_| next_loopback()).collect();
    let mut fakes = Vec::with_capacity(size);
    let mut nodes = Vec::with_capacity(size);
    for (i, addr) in addrs.iter().enumerate() {
        let peers: Vec<&str> = addrs
            .iter()
            .filter(|peer| *peer != addr)
            .map(String::as_str)
            .collect();
        let dir = hooks_dir.path().display();
        let config: Config = serde_json::from_value(serde_json::json!({
            "local_addr": addr,
            "peers": peers,
            "election_timeout_ms": ELECTION_MS,
            "heartbeat_timeout_ms": HEARTBEAT_MS,
            "mysql_admin": "root",
            "mysql_passwd": "rootpass",
            "repl_user": "repl",
            "repl_password": "replpass",
            "leader_start_command": format!("echo up >> {dir}/start_{i}"),
            "leader_stop_command": format!("echo down >> {dir}/stop_{i}"),
            "leader_fence_command": format!("echo fenced >> {dir}/fence_{i}")
        }))
        .expect("cluster node config");
        let fake = FakeMysql::new();
        let node = Supervisor::start(&config, fake.clone()).expect("supervisor starts");
        fakes.push(fake);
        nodes.push(Some(node));
    }
    let hooks_dir_path = hooks_dir.path().to_path_buf();
    Cluster {
        addrs,
        fakes,
        nodes,
        _hooks_dir: hooks_dir,
        hooks_dir_path,
    }
}

impl Cluster {
    fn roles(&self) -> Vec<Option<Role>> {
        self.nodes
            .iter()
            .map(|node| node.as_ref().map(|n| n.status().node.role))
            .collect()
    }

    fn leader_index(&self) -> Option<usize> {
        let leaders: Vec<usize> = self
            .roles()
            .iter()
            .enumerate()
            .filter(|(_, role)| **role == Some(Role::Leader))
            .map(|(i, _)| i)
            .collect();
        if leaders.len() == 1 {
            Some(leaders[0])
        } else {
            None
        }
    }

    fn hook_count(&self, name: &str) -> usize {
        let path = self.hooks_dir_path.join(name);
        line_count(&path)
    }

    fn stop_all(mut self) {
        for node in self.nodes.iter_mut() {
            if let Some(node) = node.take() {
                node.stop();
            }
        }
    }
}

fn line_count(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|content| content.lines().count())
        .unwrap_or(0)
}

#[test]
fn three_nodes_elect_exactly_one_leader() {
    let cluster = start_cluster(3);

    assert!(
        wait_until(Duration::from_secs(10), || cluster.leader_index().is_some()),
        "no single leader emerged: {:?}",
        cluster.roles()
    );
    let leader = cluster.leader_index().unwrap();
    let leader_status = cluster.nodes[leader].as_ref().unwrap().status();
    assert!(leader_status.node.term >= 1, "leadership requires term >= 1");

    // The followers learn the leader address through heartbeats.
    assert!(wait_until(Duration::from_secs(5), || {
        cluster.nodes.iter().enumerate().all(|(i, node)| {
            let status = node.as_ref().unwrap().status();
            i == leader
                || (status.node.role == Role::Follower
                    && status.node.leader.as_deref() == Some(cluster.addrs[leader].as_str()))
        })
    }));

    // Followers were repointed at the new source.
    assert!(wait_until(Duration::from_secs(5), || {
        cluster
            .fakes
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != leader)
            .all(|(_, fake)| fake.statement_count("CHANGE MASTER TO") >= 1)
    }));
    // The leader's MySQL was opened for writes.
    assert!(cluster.fakes[leader].statement_count("SET GLOBAL read_only = 0") >= 1);
    assert!(
        cluster.fakes[leader].statement_count("SET GLOBAL rpl_semi_sync_master_enabled=ON") >= 1
    );

    cluster.stop_all();
}

#[test]
fn leader_mysql_crash_fails_over_with_fencing() {
    let cluster = start_cluster(3);
    assert!(wait_until(Duration::from_secs(10), || cluster
        .leader_index()
        .is_some()));
    let old_leader = cluster.leader_index().unwrap();
    let old_term = cluster.nodes[old_leader].as_ref().unwrap().status().node.term;

    cluster.fakes[old_leader].set_healthy(false);

    // The failed leader isolates itself...
    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster.nodes[old_leader].as_ref().unwrap().status().node.role == Role::Invalid
        }),
        "failed leader never reached INVALID: {:?}",
        cluster.roles()
    );
    // ...and a survivor takes over at a higher term.
    assert!(
        wait_until(Duration::from_secs(10), || {
            cluster.nodes.iter().enumerate().any(|(i, node)| {
                i != old_leader
                    && node.as_ref().map(|n| {
                        let status = n.status().node;
                        status.role == Role::Leader && status.term > old_term
                    }) == Some(true)
            })
        }),
        "no failover leader emerged: {:?}",
        cluster.roles()
    );

    // The unhealthy exit ran the stop hook and the fence hook exactly once.
    assert!(wait_until(Duration::from_secs(5), || {
        cluster.hook_count(&format!("fence_{old_leader}")) == 1
    }));
    assert_eq!(cluster.hook_count(&format!("fence_{old_leader}")), 1);
    assert!(cluster.hook_count(&format!("stop_{old_leader}")) >= 1);

    cluster.stop_all();
}

#[test]
fn idle_peer_blocks_failover_until_unidled() {
    let cluster = start_cluster(3);
    assert!(wait_until(Duration::from_secs(10), || cluster
        .leader_index()
        .is_some()));
    let leader = cluster.leader_index().unwrap();
    let idle = (leader + 1) % 3;
    let active = (leader + 2) % 3;

    cluster.nodes[idle].as_ref().unwrap().set_idle(true).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        cluster.nodes[idle].as_ref().unwrap().status().node.role == Role::Idle
    }));

    // Take the leader away; one active voter cannot reach the quorum of two.
    let mut cluster = cluster;
    cluster.nodes[leader].take().unwrap().stop();
    std::thread::sleep(Duration::from_millis(ELECTION_MS * 8));
    for i in [idle, active] {
        let role = cluster.nodes[i].as_ref().unwrap().status().node.role;
        assert_ne!(role, Role::Leader, "node {i} must not win without quorum");
    }

    // Un-idling restores the quorum and a leader emerges.
    cluster.nodes[idle].as_ref().unwrap().set_idle(false).unwrap();
    assert!(
        wait_until(Duration::from_secs(15), || {
            [idle, active].iter().any(|i| {
                cluster.nodes[*i].as_ref().unwrap().status().node.role == Role::Leader
            })
        }),
        "no leader after un-idle: {:?}",
        cluster.roles()
    );

    cluster.stop_all();
}

#[test]
fn stale_replica_cannot_win_votes() {
    let cluster = start_cluster(3);
    // Node 0 is ahead of the others.
    cluster.fakes[0].set_executed_gtid("uuid1:1-100");
    cluster.fakes[1].set_executed_gtid("uuid1:1-100");
    cluster.fakes[2].set_executed_gtid("uuid1:1-50");

    assert!(wait_until(Duration::from_secs(10), || cluster
        .leader_index()
        .is_some()));
    let leader = cluster.leader_index().unwrap();
    assert_ne!(
        leader, 2,
        "the stale replica must never collect a vote majority"
    );

    cluster.stop_all();
}
