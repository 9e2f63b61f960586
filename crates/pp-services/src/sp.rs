//! Supervisor (SP) connection manager.
//!
//! Keeps the SP list, one active SP connection, and a buffer of probe
//! connections opened during latency sweeps. The active connection lives in
//! the shared `ConnectionRegistry`; probe connections stay out of it until
//! one is promoted. Nothing here retries: a failed
//! connect or send marks the peer `Failed`, is logged, and is returned to the
//! caller. The next scheduled job or on-demand use tries again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pp_core::message::{
    ReqGetPpStatus, ReqGetSpList, ReqLatencyCheck, ReqRegisterNewPp, RspLatencyCheck,
};
use pp_core::{Message, SpInfo};

use crate::connection::{Connection, ConnectionRegistry, TransportError};
use crate::peer::{candidate_order, new_peer_table, PeerRecord, PeerStatus, PeerTable};

/// Latency sweeps need at least this many SPs to be worth running.
pub const MIN_SWEEP_PEERS: usize = 2;

/// Who this node is, as told to the SPs.
#[derive(Debug, Clone, Default)]
pub struct SpIdentity {
    pub p2p_address: String,
    pub p2p_public_key: String,
    pub wallet_address: String,
}

pub struct SpManager {
    identity: SpIdentity,
    registry: Arc<ConnectionRegistry>,
    peers: PeerTable,
    active: Mutex<Option<Connection>>,
    buffered: Mutex<Vec<Connection>>,
}

impl SpManager {
    pub fn new(
        identity: SpIdentity,
        registry: Arc<ConnectionRegistry>,
        bootstrap: &[SpInfo],
    ) -> Self {
        let peers = new_peer_table();
        for (rank, info) in bootstrap.iter().enumerate() {
            peers.insert(info.network_address.clone(), PeerRecord::from_info(info, rank));
        }
        Self {
            identity,
            registry,
            peers,
            active: Mutex::new(None),
            buffered: Mutex::new(Vec::new()),
        }
    }

    pub fn identity(&self) -> &SpIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Snapshot of the SP list in list order.
    pub fn peers(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.peers.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.rank);
        records
    }

    pub fn peer(&self, addr: &str) -> Option<PeerRecord> {
        self.peers.get(addr).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The active SP connection, if it is still alive.
    pub fn active(&self) -> Option<Connection> {
        let mut active = lock(&self.active);
        match active.as_ref() {
            Some(conn) if conn.is_alive() => Some(conn.clone()),
            Some(conn) => {
                tracing::info!(addr = conn.addr(), "active SP connection lost");
                self.update(conn.addr(), PeerRecord::mark_disconnected);
                self.registry.discard(conn);
                *active = None;
                None
            }
            None => None,
        }
    }

    pub fn active_addr(&self) -> Option<String> {
        self.active().map(|c| c.addr().to_string())
    }

    /// Number of probe connections waiting for `select_fastest`.
    pub fn buffered_len(&self) -> usize {
        lock(&self.buffered).len()
    }

    pub fn is_buffered(&self, addr: &str) -> bool {
        lock(&self.buffered).iter().any(|c| c.addr() == addr)
    }

    // ── Connecting ───────────────────────────────────────────────────────────

    /// Reuse the active SP connection or open one, trying the fastest known
    /// SP first and previously failed ones last.
    pub async fn ensure_connected(&self) -> Result<Connection, SpError> {
        if let Some(conn) = self.active() {
            return Ok(conn);
        }

        let candidates = candidate_order(&self.peers);
        if candidates.is_empty() {
            return Err(SpError::NoSupervisor);
        }

        let mut last_err = None;
        for addr in candidates {
            self.update(&addr, PeerRecord::mark_connecting);
            match self.registry.get_or_connect(&addr).await {
                Ok(conn) => {
                    self.update(&addr, PeerRecord::mark_connected);
                    return Ok(self.install_active(conn));
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "SP connect failed");
                    self.update(&addr, PeerRecord::mark_failed);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.map(SpError::Transport).unwrap_or(SpError::NoSupervisor))
    }

    // A concurrent caller may have installed a connection while we dialed.
    fn install_active(&self, conn: Connection) -> Connection {
        let mut active = lock(&self.active);
        if let Some(existing) = active.as_ref().filter(|c| c.is_alive()) {
            let existing = existing.clone();
            if !existing.same(&conn) {
                self.registry.discard(&conn);
            }
            return existing;
        }
        tracing::info!(addr = conn.addr(), "active SP connection established");
        *active = Some(conn.clone());
        conn
    }

    /// Send `msg` to the active SP, connecting first if needed.
    pub async fn send_to_sp(&self, msg: &Message) -> Result<(), SpError> {
        let conn = self.ensure_connected().await?;
        if let Err(e) = conn.send(msg, 0) {
            tracing::warn!(addr = conn.addr(), msg_type = %msg.message_type(), error = %e, "send to SP failed");
            self.update(conn.addr(), PeerRecord::mark_failed);
            self.drop_active(&conn);
            return Err(e.into());
        }
        Ok(())
    }

    fn drop_active(&self, conn: &Connection) {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|c| c.same(conn)) {
            self.registry.discard(conn);
            *active = None;
        }
    }

    // ── SP list ──────────────────────────────────────────────────────────────

    /// Ask the active SP for the current SP list. The answer arrives as
    /// `RspGetSpList` and is applied by `replace_sp_list`.
    pub async fn refresh_sp_list(&self) -> Result<(), SpError> {
        let req = Message::ReqGetSpList(ReqGetSpList {
            p2p_address: self.identity.p2p_address.clone(),
            wallet_address: self.identity.wallet_address.clone(),
        });
        self.send_to_sp(&req).await
    }

    /// Replace the SP list. Retained addresses keep their status and latency;
    /// the active connection is dropped only if its address disappeared.
    /// An empty list is ignored.
    pub fn replace_sp_list(&self, list: Vec<SpInfo>) {
        if list.is_empty() {
            tracing::warn!("received empty SP list, keeping current one");
            return;
        }

        let keep: HashSet<&str> = list.iter().map(|i| i.network_address.as_str()).collect();
        self.peers.retain(|addr, _| keep.contains(addr.as_str()));

        for (rank, info) in list.iter().enumerate() {
            self.peers
                .entry(info.network_address.clone())
                .and_modify(|r| {
                    r.rank = rank;
                    r.p2p_address = info.p2p_address.clone();
                    r.p2p_public_key = info.p2p_public_key.clone();
                })
                .or_insert_with(|| PeerRecord::from_info(info, rank));
        }

        {
            let mut active = lock(&self.active);
            if let Some(conn) = active.as_ref() {
                if !keep.contains(conn.addr()) {
                    tracing::info!(addr = conn.addr(), "active SP dropped from list");
                    self.registry.discard(conn);
                    *active = None;
                }
            }
        }
        lock(&self.buffered).retain(|c| {
            let kept = keep.contains(c.addr());
            if !kept {
                c.close();
            }
            kept
        });

        tracing::info!(count = list.len(), "SP list replaced");
    }

    // ── Latency ──────────────────────────────────────────────────────────────

    /// Send a timestamped latency probe to `addr`. Probe connections to SPs
    /// other than the active one are buffered for `select_fastest`.
    pub async fn probe_latency(&self, addr: &str) -> Result<(), SpError> {
        let active = self.active().filter(|c| c.addr() == addr);
        let is_active = active.is_some();

        let conn = match active {
            Some(conn) => conn,
            None => {
                self.update(addr, PeerRecord::mark_connecting);
                match self.registry.open(addr).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::debug!(addr, error = %e, "latency probe connect failed");
                        self.update(addr, PeerRecord::mark_failed);
                        return Err(e.into());
                    }
                }
            }
        };

        let req = Message::ReqLatencyCheck(ReqLatencyCheck {
            p2p_address_pp: self.identity.p2p_address.clone(),
            network_address_sp: addr.to_string(),
            ping_time: unix_nanos(),
        });
        if let Err(e) = conn.send(&req, 0) {
            tracing::debug!(addr, error = %e, "latency probe send failed");
            self.update(addr, PeerRecord::mark_failed);
            if is_active {
                self.drop_active(&conn);
            } else {
                conn.close();
            }
            return Err(e.into());
        }

        if !is_active {
            self.buffer(conn);
        }
        Ok(())
    }

    fn buffer(&self, conn: Connection) {
        let mut buffered = lock(&self.buffered);
        if let Some(pos) = buffered.iter().position(|c| c.addr() == conn.addr()) {
            let old = std::mem::replace(&mut buffered[pos], conn);
            old.close();
        } else {
            buffered.push(conn);
        }
    }

    /// Probe every SP concurrently. Returns how many probes went out.
    ///
    /// Skipped while there is no active SP connection, or when the list is
    /// too short to choose between.
    pub async fn latency_sweep(&self) -> Result<usize, SpError> {
        let addrs: Vec<String> = self.peers().into_iter().map(|r| r.network_address).collect();
        if addrs.len() < MIN_SWEEP_PEERS {
            tracing::warn!(count = addrs.len(), "not enough SPs for a latency sweep");
            return Err(SpError::NotEnoughSupervisors(addrs.len()));
        }
        if self.active().is_none() {
            tracing::debug!("latency sweep skipped until SP connection recovers");
            return Err(SpError::NoSupervisor);
        }

        let results = futures::future::join_all(addrs.iter().map(|a| self.probe_latency(a))).await;
        let sent = results.iter().filter(|r| r.is_ok()).count();
        tracing::debug!(probed = addrs.len(), sent, "latency sweep done");
        Ok(sent)
    }

    /// Record the round trip of an answered probe. Returns the latency, or
    /// `None` if the SP isn't in the list.
    pub fn on_latency_response(&self, rsp: &RspLatencyCheck) -> Option<Duration> {
        let elapsed = unix_nanos().saturating_sub(rsp.ping_time).max(0);
        let latency = Duration::from_nanos(elapsed as u64);

        let mut record = self.peers.get_mut(&rsp.network_address_sp)?;
        record.record_latency(latency);
        tracing::debug!(
            addr = %rsp.network_address_sp,
            latency_us = latency.as_micros() as u64,
            "SP latency measured"
        );
        Some(latency)
    }

    /// Switch to the fastest buffered probe connection if it beats the active
    /// SP, then close the rest of the buffer. Returns the new active address
    /// when a switch happened.
    pub fn select_fastest(&self) -> Option<String> {
        let buffered = std::mem::take(&mut *lock(&self.buffered));
        let latency_of = |addr: &str| self.peers.get(addr).and_then(|r| r.latency);

        let best = buffered
            .iter()
            .filter(|c| c.is_alive())
            .filter_map(|c| latency_of(c.addr()).map(|l| (l, c)))
            .min_by_key(|(l, _)| *l)
            .map(|(l, c)| (l, c.clone()));

        let mut switched = None;
        if let Some((best_latency, best_conn)) = best {
            let mut active = lock(&self.active);
            let current = active
                .as_ref()
                .filter(|c| c.is_alive())
                .map(|c| latency_of(c.addr()).unwrap_or(Duration::MAX));
            if current.map_or(true, |l| best_latency < l) {
                if let Some(old) = active.replace(best_conn.clone()) {
                    self.registry.discard(&old);
                    self.update(old.addr(), PeerRecord::mark_disconnected);
                }
                self.registry.adopt(best_conn.clone());
                tracing::info!(
                    addr = best_conn.addr(),
                    latency_us = best_latency.as_micros() as u64,
                    "switched to faster SP"
                );
                switched = Some(best_conn.addr().to_string());
            }
        }

        for conn in buffered {
            if switched.as_deref() != Some(conn.addr()) {
                conn.close();
            }
        }
        switched
    }

    // ── Node requests ────────────────────────────────────────────────────────

    /// Ask the SP for this node's status, optionally with a fresh PP list.
    pub async fn get_pp_status(&self, init_pp_list: bool) -> Result<(), SpError> {
        let req = Message::ReqGetPpStatus(ReqGetPpStatus {
            p2p_address: self.identity.p2p_address.clone(),
            init_pp_list,
        });
        self.send_to_sp(&req).await
    }

    /// Ask the SP to register this node as a storage peer.
    pub async fn register_new_pp(&self) -> Result<(), SpError> {
        let req = Message::ReqRegisterNewPp(ReqRegisterNewPp {
            p2p_address: self.identity.p2p_address.clone(),
            p2p_public_key: self.identity.p2p_public_key.clone(),
            wallet_address: self.identity.wallet_address.clone(),
        });
        self.send_to_sp(&req).await
    }

    fn update(&self, addr: &str, f: impl FnOnce(&mut PeerRecord)) {
        if let Some(mut record) = self.peers.get_mut(addr) {
            f(&mut record);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SpError {
    #[error("no supervisor available")]
    NoSupervisor,

    #[error("not enough supervisors: {0}")]
    NotEnoughSupervisors(usize),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
