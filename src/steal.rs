//! Adaptive work stealing (spec §4.8)
//!
//! A two-phase asymmetric protocol: probe a random peer for its work-type
//! counts, then decide whether to pull a fraction of its excess. Grounded
//! on `original_source/lb/code/src/steal.c` for the halving-fraction
//! formula and `backoffs.c` for the post-failure back-off.

use crate::backoff::Backoff;
use crate::layout::Rank;
use crate::workqueue::Task;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Default number of tasks streamed per chunk during a steal transfer.
pub const STEAL_CHUNK_SIZE: u32 = 16;

/// One chunk of a streamed steal transfer (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StealChunk {
    /// Stolen tasks in this chunk.
    pub tasks: Vec<Task>,
    /// True iff this is the final chunk of the transfer.
    pub last: bool,
}

/// Tunables for the steal policy (spec §6.3 `ADLB_*` knobs feeding this).
#[derive(Debug, Clone)]
pub struct StealConfig {
    /// Maximum outstanding probes this server may have in flight.
    pub concurrency_limit: usize,
    /// Minimum interval between probes to the same peer.
    pub rate_limit: Duration,
    /// Back-off applied after `servers` consecutive failed attempts.
    pub backoff: Duration,
    /// Total server count, used as the failure threshold before backing off.
    pub servers: i32,
}

/// Per-server steal state: outstanding probes, last-probe timestamps, and
/// the consecutive-failure back-off.
pub struct StealEngine {
    config: StealConfig,
    outstanding: HashSet<Rank>,
    last_probe: HashMap<Rank, Instant>,
    consecutive_failures: u32,
    backoff: Backoff,
}

impl StealEngine {
    /// A new steal engine under `config`.
    pub fn new(config: StealConfig) -> Self {
        let backoff = Backoff::new(Duration::from_millis(1), config.backoff, 2);
        StealEngine { config, outstanding: HashSet::new(), last_probe: HashMap::new(), consecutive_failures: 0, backoff }
    }

    /// Whether we are under the concurrency limit and not presently
    /// backed off (spec §4.10 step 6: "if pending requests and stale
    /// steal timer, initiate a probe").
    pub fn can_probe(&self, now: Instant) -> bool {
        if self.outstanding.len() >= self.config.concurrency_limit {
            return false;
        }
        if self.consecutive_failures >= self.config.servers.max(1) as u32 {
            return now.duration_since(self.last_any_probe().unwrap_or(now)) >= self.config.backoff;
        }
        true
    }

    fn last_any_probe(&self) -> Option<Instant> {
        self.last_probe.values().max().copied()
    }

    /// Whether `peer` is individually rate-limited.
    pub fn peer_rate_limited(&self, peer: Rank, now: Instant) -> bool {
        self.last_probe
            .get(&peer)
            .map(|t| now.duration_since(*t) < self.config.rate_limit)
            .unwrap_or(false)
    }

    /// Choose a random peer among `servers`, excluding `self_rank` and any
    /// currently-outstanding target, biased toward none (uniform).
    pub fn choose_peer(&self, servers: std::ops::Range<Rank>, self_rank: Rank, rng: &mut impl Rng) -> Option<Rank> {
        let candidates: Vec<Rank> = servers
            .filter(|&r| r != self_rank && !self.outstanding.contains(&r))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        Some(candidates[rng.gen_range(0..candidates.len())])
    }

    /// Mark a probe as sent to `peer`.
    pub fn begin_probe(&mut self, peer: Rank, now: Instant) {
        self.outstanding.insert(peer);
        self.last_probe.insert(peer, now);
    }

    /// Record that a probe to `peer` completed, either finding work to
    /// steal (`found_work = true`) or not.
    pub fn complete_probe(&mut self, peer: Rank, found_work: bool) {
        self.outstanding.remove(&peer);
        if found_work {
            self.backoff.record_success();
            self.consecutive_failures = 0;
        } else {
            self.backoff.record_failure();
            self.consecutive_failures += 1;
        }
    }

    /// Given our own and a peer's per-type work counts, decide how many
    /// units of each type to request. The fraction stolen halves the
    /// peer's excess: `(peer_count - my_count) / (2 * peer_count)`, with a
    /// floor of 1 whenever the peer has any work of that type and we have
    /// unmatched demand.
    pub fn decide(
        &self,
        my_counts: &HashMap<i32, u32>,
        my_requests: &HashMap<i32, u32>,
        peer_counts: &HashMap<i32, u32>,
    ) -> HashMap<i32, u32> {
        let mut plan = HashMap::new();
        for (&ty, &peer_count) in peer_counts {
            if peer_count == 0 {
                continue;
            }
            let my_count = my_counts.get(&ty).copied().unwrap_or(0);
            let my_request = my_requests.get(&ty).copied().unwrap_or(0);
            if my_request == 0 || peer_count <= my_count {
                continue;
            }
            let excess = peer_count - my_count;
            let fraction = excess as f64 / (2.0 * peer_count as f64);
            let mut amount = (peer_count as f64 * fraction).floor() as u32;
            if amount == 0 {
                amount = 1;
            }
            plan.insert(ty, amount.min(peer_count));
        }
        plan
    }

    /// Split `total` work units into `STEAL_CHUNK_SIZE`-sized chunks, the
    /// last one flagged as final (spec §4.8 "streams back a batch...
    /// terminating with a last=true header").
    pub fn chunk_plan(total: u32) -> Vec<(u32, bool)> {
        if total == 0 {
            return vec![(0, true)];
        }
        let mut chunks = Vec::new();
        let mut remaining = total;
        while remaining > 0 {
            let n = remaining.min(STEAL_CHUNK_SIZE);
            remaining -= n;
            chunks.push((n, remaining == 0));
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn engine() -> StealEngine {
        StealEngine::new(StealConfig {
            concurrency_limit: 1,
            rate_limit: Duration::from_millis(10),
            backoff: Duration::from_millis(50),
            servers: 4,
        })
    }

    #[test]
    fn halving_fraction_floors_at_one() {
        let e = engine();
        let mut my_counts = HashMap::new();
        my_counts.insert(0, 0);
        let mut my_requests = HashMap::new();
        my_requests.insert(0, 5);
        let mut peer_counts = HashMap::new();
        peer_counts.insert(0, 1);
        let plan = e.decide(&my_counts, &my_requests, &peer_counts);
        assert_eq!(plan.get(&0), Some(&1));
    }

    #[test]
    fn no_steal_when_peer_has_no_excess() {
        let e = engine();
        let mut my_counts = HashMap::new();
        my_counts.insert(0, 10);
        let my_requests = HashMap::from([(0, 5)]);
        let mut peer_counts = HashMap::new();
        peer_counts.insert(0, 5);
        let plan = e.decide(&my_counts, &my_requests, &peer_counts);
        assert!(plan.get(&0).is_none());
        my_counts.clear();
    }

    #[test]
    fn concurrency_limit_blocks_additional_probes() {
        let mut e = engine();
        let now = Instant::now();
        assert!(e.can_probe(now));
        e.begin_probe(1, now);
        assert!(!e.can_probe(now));
    }

    #[test]
    fn chunking_terminates_with_last_flag() {
        let chunks = StealEngine::chunk_plan(40);
        assert_eq!(chunks, vec![(16, false), (16, false), (8, true)]);
    }

    #[test]
    fn choose_peer_excludes_self_and_outstanding() {
        let mut e = engine();
        e.begin_probe(2, Instant::now());
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let peer = e.choose_peer(0..4, 1, &mut rng).unwrap();
            assert_ne!(peer, 1);
            assert_ne!(peer, 2);
        }
    }
}
