//! Inbound message handlers for the storage peer daemon.
//!
//! Handlers run on the connection's reader task, so anything that sends to an
//! SP and may connect first (sweeps, list reloads) is spawned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;

use pp_core::message::{Heartbeat, PpState, RspLatencyCheck};
use pp_core::{Message, MessageType};
use pp_services::file_rpc::wallet_key;
use pp_services::{Connection, ConnectionRegistry, FileRpc, HandlerRegistry, SpManager};

/// How long after a sweep the probe answers are given to arrive before the
/// fastest SP is picked.
pub const SWEEP_SETTLE: Duration = Duration::from_secs(3);

/// What the SPs have told this node about itself.
#[derive(Debug, Default)]
pub struct NodeState {
    is_pp: AtomicBool,
    synced_with_sp: AtomicBool,
    is_active: AtomicBool,
    state: Mutex<Option<PpState>>,
}

impl NodeState {
    pub fn is_pp(&self) -> bool {
        self.is_pp.load(Ordering::Acquire)
    }

    pub fn synced_with_sp(&self) -> bool {
        self.synced_with_sp.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Acquire)
    }

    pub fn state(&self) -> Option<PpState> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_registered(&self) {
        self.is_pp.store(true, Ordering::Release);
        self.synced_with_sp.store(true, Ordering::Release);
    }

    fn set_status(&self, state: PpState, is_active: bool) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state);
        self.is_active.store(is_active, Ordering::Release);
        if state != PpState::Unregistered {
            self.set_registered();
        }
    }
}

/// Everything the handlers touch.
#[derive(Clone)]
pub struct NodeContext {
    pub p2p_address: String,
    pub sp: Arc<SpManager>,
    /// Live SP and storage-peer connections; the same registry `sp` uses.
    pub registry: Arc<ConnectionRegistry>,
    pub file_rpc: Arc<FileRpc>,
    pub node: Arc<NodeState>,
}

/// Run a latency sweep, wait for answers, and switch to the fastest SP.
pub async fn sweep_and_select(sp: Arc<SpManager>) {
    match sp.latency_sweep().await {
        Ok(sent) if sent > 0 => {
            tokio::time::sleep(SWEEP_SETTLE).await;
            if let Some(addr) = sp.select_fastest() {
                tracing::info!(addr = %addr, "now using fastest SP");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "latency sweep not run"),
    }
}

pub fn register(registry: &mut HandlerRegistry, ctx: NodeContext) {
    // ── SP list / latency ────────────────────────────────────────────────────

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::RspGetSpList,
            move |conn: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                let Message::RspGetSpList(rsp) = msg else {
                    anyhow::bail!("expected RspGetSpList");
                };
                if !rsp.result.is_success() {
                    tracing::warn!(addr = conn.addr(), reason = %rsp.result.msg, "SP list request failed");
                    return Ok(());
                }
                ctx.sp.replace_sp_list(rsp.sp_list);
                tracing::debug!(
                    peer_connections = ctx.registry.len(),
                    still_connected = ctx.registry.is_connected(conn.addr()),
                    "SP list applied"
                );
                Ok(())
            },
        );
    }

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::ReqLatencyCheck,
            move |conn: &Connection, req_id: i64, msg: Message| -> anyhow::Result<()> {
                let Message::ReqLatencyCheck(req) = msg else {
                    anyhow::bail!("expected ReqLatencyCheck");
                };
                tracing::trace!(from = %req.p2p_address_pp, me = %ctx.p2p_address, "echoing latency probe");
                let rsp = Message::RspLatencyCheck(RspLatencyCheck {
                    p2p_address_pp: req.p2p_address_pp,
                    network_address_sp: req.network_address_sp,
                    ping_time: req.ping_time,
                });
                conn.send(&rsp, req_id).context("latency echo")?;
                Ok(())
            },
        );
    }

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::RspLatencyCheck,
            move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                let Message::RspLatencyCheck(rsp) = msg else {
                    anyhow::bail!("expected RspLatencyCheck");
                };
                if ctx.sp.on_latency_response(&rsp).is_none() {
                    tracing::debug!(addr = %rsp.network_address_sp, "latency answer from unknown SP");
                }
                Ok(())
            },
        );
    }

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::ReqSpLatencyCheck,
            move |conn: &Connection, _: i64, _: Message| -> anyhow::Result<()> {
                tracing::debug!(addr = conn.addr(), "SP requested a latency sweep");
                tokio::spawn(sweep_and_select(ctx.sp.clone()));
                Ok(())
            },
        );
    }

    // ── Heartbeat ────────────────────────────────────────────────────────────

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::ReqHeartbeat,
            move |conn: &Connection, req_id: i64, _: Message| -> anyhow::Result<()> {
                let rsp = Message::RspHeartbeat(Heartbeat {
                    p2p_address: ctx.p2p_address.clone(),
                });
                conn.send(&rsp, req_id).context("heartbeat reply")?;
                Ok(())
            },
        );
    }

    registry.register(
        MessageType::RspHeartbeat,
        |conn: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
            if let Message::RspHeartbeat(hb) = msg {
                tracing::trace!(addr = conn.addr(), peer = %hb.p2p_address, "heartbeat answered");
            }
            Ok(())
        },
    );

    // ── Node status ──────────────────────────────────────────────────────────

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::RspGetPpStatus,
            move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                let Message::RspGetPpStatus(rsp) = msg else {
                    anyhow::bail!("expected RspGetPpStatus");
                };
                if !rsp.result.is_success() {
                    tracing::warn!(reason = %rsp.result.msg, "PP status request failed");
                    return Ok(());
                }
                ctx.node.set_status(rsp.state, rsp.is_active);
                tracing::info!(state = ?rsp.state, is_active = rsp.is_active, "PP status updated");
                if rsp.state == PpState::Unregistered {
                    tracing::warn!("this node is not registered as a PP, registering");
                    let sp = ctx.sp.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sp.register_new_pp().await {
                            tracing::warn!(error = %e, "PP registration request failed");
                        }
                    });
                }
                if rsp.init_pp_list {
                    let sp = ctx.sp.clone();
                    tokio::spawn(async move {
                        if let Err(e) = sp.refresh_sp_list().await {
                            tracing::warn!(error = %e, "SP list reload failed");
                        }
                    });
                }
                Ok(())
            },
        );
    }

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::RspRegisterNewPp,
            move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                let Message::RspRegisterNewPp(rsp) = msg else {
                    anyhow::bail!("expected RspRegisterNewPp");
                };
                if rsp.result.is_success() {
                    tracing::info!("registered as PP");
                    ctx.node.set_registered();
                } else if rsp.already_pp {
                    tracing::info!(reason = %rsp.result.msg, "already registered as PP");
                    ctx.node.set_registered();
                } else {
                    tracing::warn!(reason = %rsp.result.msg, "PP registration failed");
                }
                Ok(())
            },
        );
    }

    // ── RPC results ──────────────────────────────────────────────────────────

    {
        let ctx = ctx.clone();
        registry.register(
            MessageType::RspFindMyFileList,
            move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                let Message::RspFindMyFileList(rsp) = msg else {
                    anyhow::bail!("expected RspFindMyFileList");
                };
                let key = wallet_key(&rsp.wallet_address, &rsp.req_id);
                ctx.file_rpc.file_lists().set(key, rsp.result);
                Ok(())
            },
        );
    }

    registry.register(
        MessageType::RspGetOzone,
        move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
            let Message::RspGetOzone(rsp) = msg else {
                anyhow::bail!("expected RspGetOzone");
            };
            let key = wallet_key(&rsp.wallet_address, &rsp.req_id);
            ctx.file_rpc.ozone().set(key, rsp.result);
            Ok(())
        },
    );
}
