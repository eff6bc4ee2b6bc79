use crate::raft::rpc::RetCode;
use crate::raft::Role;
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Samples an election interval from `[timeout, 2*timeout)`. Randomization
/// is what keeps simultaneous candidates from colliding forever.
pub fn randomized_timeout(rng: &mut ChaCha20Rng, timeout: Duration) -> Duration {
    let base = timeout.as_millis() as u64;
    if base == 0 {
        return timeout;
    }
    let jitter = rng.gen_range(0..base);
    Duration::from_millis(base + jitter)
}

/// Deadline-based election timer; the state loop injects `now`.
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    timeout: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn reset(&mut self, now: Instant, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = now + timeout;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Vote bookkeeping for one candidacy round. The candidate's own vote is
/// recorded at construction.
#[derive(Debug, Clone)]
pub struct VoteTally {
    term: u64,
    granted: HashSet<String>,
    rejected: HashSet<String>,
    unreachable: HashSet<String>,
}

impl VoteTally {
    pub fn new(term: u64, candidate: impl Into<String>) -> Self {
        let mut granted = HashSet::new();
        granted.insert(candidate.into());
        Self {
            term,
            granted,
            rejected: HashSet::new(),
            unreachable: HashSet::new(),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn record_grant(&mut self, voter: impl Into<String>) {
        let voter = voter.into();
        self.rejected.remove(&voter);
        self.unreachable.remove(&voter);
        self.granted.insert(voter);
    }

    pub fn record_reject(&mut self, voter: impl Into<String>) {
        let voter = voter.into();
        self.granted.remove(&voter);
        self.rejected.insert(voter);
    }

    /// The voter's MySQL was down; it could not evaluate the GTID rule.
    /// Not a rejection, but evidence a quorum may be impossible.
    pub fn record_unreachable(&mut self, voter: impl Into<String>) {
        let voter = voter.into();
        if !self.granted.contains(&voter) && !self.rejected.contains(&voter) {
            self.unreachable.insert(voter);
        }
    }

    pub fn votes_granted(&self) -> usize {
        self.granted.len()
    }

    pub fn votes_rejected(&self) -> usize {
        self.rejected.len()
    }

    pub fn voters_unreachable(&self) -> usize {
        self.unreachable.len()
    }

    pub fn quorum_reached(&self, quorum: usize) -> bool {
        self.granted.len() >= quorum
    }

    /// Enough voters answered "cannot check" that a quorum is arithmetically
    /// out of reach this round.
    pub fn quorum_impossible(&self, cluster_size: usize, quorum: usize) -> bool {
        let reachable = cluster_size.saturating_sub(self.unreachable.len() + self.rejected.len());
        reachable < quorum
    }
}

/// First, cheap half of the §4.2 vote rule: everything that can be decided
/// without asking MySQL. Passing means the GTID dominance check decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteGate {
    Refuse(RetCode),
    CheckGtid,
}

#[allow(clippy::too_many_arguments)]
pub fn evaluate_vote_request(
    role: Role,
    current_term: u64,
    voted_for: Option<&str>,
    vote_in_flight: bool,
    dirty_leaders: &HashSet<String>,
    candidate: &str,
    candidate_term: u64,
) -> VoteGate {
    if candidate_term < current_term {
        return VoteGate::Refuse(RetCode::InvalidViewId);
    }
    if !role.can_vote() {
        return VoteGate::Refuse(RetCode::InvalidRequest);
    }
    if dirty_leaders.contains(candidate) {
        return VoteGate::Refuse(RetCode::InvalidGtid);
    }
    // One vote per term: the first request wins, even against a candidate
    // with a superior GTID.
    match voted_for {
        Some(existing) if existing != candidate => {
            return VoteGate::Refuse(RetCode::InvalidRequest)
        }
        _ => {}
    }
    if vote_in_flight {
        return VoteGate::Refuse(RetCode::InvalidRequest);
    }
    VoteGate::CheckGtid
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn randomized_timeout_stays_in_the_window() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let base = Duration::from_millis(300);
        for _ in 0..50 {
            let timeout = randomized_timeout(&mut rng, base);
            assert!(timeout >= base && timeout < base * 2, "{timeout:?}");
        }
    }

    #[test]
    fn timer_expiry_tracks_the_injected_clock() {
        let now = Instant::now();
        let timer = ElectionTimer::new(now, Duration::from_millis(200));
        assert!(!timer.expired(now));
        assert!(timer.expired(now + Duration::from_millis(200)));
        assert_eq!(
            timer.remaining(now + Duration::from_millis(150)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn tally_counts_self_and_reaches_quorum() {
        let mut tally = VoteTally::new(4, "a:8801");
        assert_eq!(tally.votes_granted(), 1);
        assert!(!tally.quorum_reached(2));
        tally.record_grant("b:8801");
        assert!(tally.quorum_reached(2));
    }

    #[test]
    fn unreachable_voters_feed_the_no_quorum_diagnosis() {
        let mut tally = VoteTally::new(4, "a:8801");
        tally.record_unreachable("b:8801");
        tally.record_unreachable("c:8801");
        assert_eq!(tally.voters_unreachable(), 2);
        assert!(tally.quorum_impossible(3, 2));
        // A later grant from the same voter supersedes the unreachable mark.
        tally.record_grant("b:8801");
        assert_eq!(tally.voters_unreachable(), 1);
        assert!(tally.quorum_reached(2));
    }

    #[test]
    fn stale_term_votes_are_refused() {
        let gate = evaluate_vote_request(
            Role::Follower,
            5,
            None,
            false,
            &HashSet::new(),
            "b:8801",
            4,
        );
        assert_eq!(gate, VoteGate::Refuse(RetCode::InvalidViewId));
    }

    #[test]
    fn non_voting_roles_refuse() {
        for role in [Role::Leader, Role::Idle, Role::Invalid] {
            let gate =
                evaluate_vote_request(role, 5, None, false, &HashSet::new(), "b:8801", 5);
            assert_eq!(gate, VoteGate::Refuse(RetCode::InvalidRequest));
        }
    }

    #[test]
    fn first_vote_wins_the_term() {
        let gate = evaluate_vote_request(
            Role::Follower,
            5,
            Some("b:8801"),
            false,
            &HashSet::new(),
            "c:8801",
            5,
        );
        assert_eq!(gate, VoteGate::Refuse(RetCode::InvalidRequest));
        // Re-asking for the same candidate passes the gate again.
        let gate = evaluate_vote_request(
            Role::Follower,
            5,
            Some("c:8801"),
            false,
            &HashSet::new(),
            "c:8801",
            5,
        );
        assert_eq!(gate, VoteGate::CheckGtid);
    }

    #[test]
    fn dirty_leaders_are_refused_on_gtid_grounds() {
        let mut dirty = HashSet::new();
        dirty.insert("b:8801".to_string());
        let gate = evaluate_vote_request(Role::Follower, 5, None, false, &dirty, "b:8801", 5);
        assert_eq!(gate, VoteGate::Refuse(RetCode::InvalidGtid));
    }

    #[test]
    fn concurrent_vote_evaluation_blocks_competitors() {
        let gate = evaluate_vote_request(
            Role::Follower,
            5,
            None,
            true,
            &HashSet::new(),
            "c:8801",
            5,
        );
        assert_eq!(gate, VoteGate::Refuse(RetCode::InvalidRequest));
    }
}
