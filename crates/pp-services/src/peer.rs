//! Supervisor peer records: what this node knows about each SP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use pp_core::SpInfo;

/// Connection state of one supervisor.
///
/// `Unknown → Connecting → Connected → Disconnected | Failed`. A
/// `Disconnected` or `Failed` peer goes back to `Connecting` on the next
/// probe or on-demand connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Dial address; the record's key.
    pub network_address: String,

    pub p2p_address: String,

    pub p2p_public_key: String,

    pub status: PeerStatus,

    /// Round trip of the last answered latency probe.
    pub latency: Option<Duration>,

    /// Last time this peer answered anything.
    pub last_seen: Option<Instant>,

    /// Consecutive failed connects or sends. Reset on success.
    pub failures: u32,

    /// Position in the SP list as distributed.
    pub rank: usize,
}

impl PeerRecord {
    pub fn from_info(info: &SpInfo, rank: usize) -> Self {
        Self {
            network_address: info.network_address.clone(),
            p2p_address: info.p2p_address.clone(),
            p2p_public_key: info.p2p_public_key.clone(),
            status: PeerStatus::Unknown,
            latency: None,
            last_seen: None,
            failures: 0,
            rank,
        }
    }

    pub fn mark_connecting(&mut self) {
        self.status = PeerStatus::Connecting;
    }

    pub fn mark_connected(&mut self) {
        self.status = PeerStatus::Connected;
        self.failures = 0;
        self.last_seen = Some(Instant::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = PeerStatus::Failed;
        self.failures = self.failures.saturating_add(1);
    }

    pub fn mark_disconnected(&mut self) {
        if self.status != PeerStatus::Failed {
            self.status = PeerStatus::Disconnected;
        }
    }

    pub fn record_latency(&mut self, latency: Duration) {
        self.latency = Some(latency);
        self.mark_connected();
    }

    /// Sort key for connection attempts: healthy before failed, measured
    /// before unmeasured, faster before slower, then list order.
    fn candidate_key(&self) -> (bool, bool, Duration, usize) {
        (
            self.status == PeerStatus::Failed,
            self.latency.is_none(),
            self.latency.unwrap_or(Duration::MAX),
            self.rank,
        )
    }
}

/// SP records keyed on network address.
pub type PeerTable = Arc<DashMap<String, PeerRecord>>;

pub fn new_peer_table() -> PeerTable {
    Arc::new(DashMap::new())
}

/// Addresses in the order connection attempts should try them.
pub fn candidate_order(table: &PeerTable) -> Vec<String> {
    let mut records: Vec<PeerRecord> = table.iter().map(|r| r.value().clone()).collect();
    records.sort_by_key(|r| r.candidate_key());
    records.into_iter().map(|r| r.network_address).collect()
}
