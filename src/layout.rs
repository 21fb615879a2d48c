//! Worker/server rank partition and host grouping (spec §4.1)
//!
//! Pure and frozen at construction: workers occupy `[0..W)`, servers
//! `[W..W+S)`. Server `s` owns workers `[s*chunk .. (s+1)*chunk)` where
//! `chunk = ceil(W/S)`.

use std::collections::HashMap;

/// An MPI-style rank.
pub type Rank = i32;

/// An opaque host identifier used to group worker ranks sharing a node.
pub type HostId = u32;

/// Frozen worker/server layout for one job.
#[derive(Debug, Clone)]
pub struct Layout {
    workers: i32,
    servers: i32,
    chunk: i32,
    /// host -> sorted worker ranks on that host.
    host_workers: HashMap<HostId, Vec<Rank>>,
    /// worker -> host, for reverse lookups.
    worker_host: HashMap<Rank, HostId>,
}

impl Layout {
    /// Build a layout for `workers` worker ranks and `servers` server
    /// ranks, given a function mapping worker rank to its host id (tests
    /// supply a deterministic host assignment in place of a real
    /// cluster's hostname resolution).
    pub fn new(workers: i32, servers: i32, host_id: impl Fn(Rank) -> HostId) -> Self {
        assert!(workers > 0 && servers > 0);
        let chunk = (workers + servers - 1) / servers;

        let mut host_workers: HashMap<HostId, Vec<Rank>> = HashMap::new();
        let mut worker_host = HashMap::new();
        for w in 0..workers {
            let host = host_id(w);
            host_workers.entry(host).or_default().push(w);
            worker_host.insert(w, host);
        }
        for v in host_workers.values_mut() {
            v.sort_unstable();
        }

        Layout {
            workers,
            servers,
            chunk,
            host_workers,
            worker_host,
        }
    }

    /// Total worker count.
    pub fn workers(&self) -> i32 {
        self.workers
    }

    /// Total server count.
    pub fn servers(&self) -> i32 {
        self.servers
    }

    /// First server rank (servers occupy `[first_server()..first_server()+servers)`).
    pub fn first_server(&self) -> Rank {
        self.workers
    }

    /// Map a worker rank to its home server rank.
    pub fn server_for_worker(&self, worker: Rank) -> Rank {
        assert!((0..self.workers).contains(&worker), "worker rank out of range");
        self.first_server() + worker / self.chunk
    }

    /// The contiguous worker range owned by server index `s` (0-based
    /// among servers, not the absolute server rank).
    pub fn workers_for_server(&self, server_index: i32) -> std::ops::Range<Rank> {
        let lo = (server_index * self.chunk).min(self.workers);
        let hi = ((server_index + 1) * self.chunk).min(self.workers);
        lo..hi
    }

    /// True if `rank` is a server rank.
    pub fn is_server(&self, rank: Rank) -> bool {
        rank >= self.first_server() && rank < self.first_server() + self.servers
    }

    /// Workers sharing a host with `worker`, sorted ascending, including
    /// `worker` itself. Empty if the layout was built with hostmap
    /// disabled (no host ever registered for `worker`).
    pub fn host_peers(&self, worker: Rank) -> &[Rank] {
        self.worker_host
            .get(&worker)
            .and_then(|h| self.host_workers.get(h))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Datum home-server rank, a pure function of id (spec §3.1 /
    /// Testable Property 7: locate determinism).
    pub fn locate(&self, id: u64) -> Rank {
        self.first_server() + (id % self.servers as u64) as Rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_of_four_per_node(w: Rank) -> HostId {
        (w / 4) as HostId
    }

    #[test]
    fn server_for_worker_chunks_evenly() {
        let layout = Layout::new(10, 3, host_of_four_per_node);
        // chunk = ceil(10/3) = 4
        assert_eq!(layout.server_for_worker(0), 10);
        assert_eq!(layout.server_for_worker(3), 10);
        assert_eq!(layout.server_for_worker(4), 11);
        assert_eq!(layout.server_for_worker(7), 11);
        assert_eq!(layout.server_for_worker(8), 12);
        assert_eq!(layout.server_for_worker(9), 12);
    }

    #[test]
    fn host_peers_group_by_host() {
        let layout = Layout::new(8, 2, host_of_four_per_node);
        assert_eq!(layout.host_peers(1), &[0, 1, 2, 3]);
        assert_eq!(layout.host_peers(5), &[4, 5, 6, 7]);
    }

    #[test]
    fn locate_is_deterministic() {
        let layout = Layout::new(8, 3, host_of_four_per_node);
        let s1 = layout.locate(12345);
        let s2 = layout.locate(12345);
        assert_eq!(s1, s2);
        assert!(layout.is_server(s1));
    }
}
