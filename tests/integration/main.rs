//! ppd integration test harness.
//!
//! Everything runs over loopback TCP inside the test process: a `FakeSp`
//! plays the supervising peer, a `Node` wires the same transport, dispatch
//! and SP manager the daemon uses.
//!
//!   cargo test --test integration

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use pp_core::message::{ResponseResult, RspGetSpList, RspLatencyCheck};
use pp_core::wire::encode_frame;
use pp_core::{Message, MessageType, SpInfo};
use pp_services::transport::{read_frame, Frame};
use pp_services::{
    Connection, ConnectionRegistry, EventDispatcher, HandlerRegistry, SpIdentity, SpManager,
    TcpConnector,
};

mod file_flow;
mod inbound;
mod sp_link;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const APP_VER: u16 = 1;
pub const WAIT: Duration = Duration::from_secs(5);

/// Decides the fake SP's answer to one inbound message. Gets the SP's own
/// listen address.
pub type Responder = Arc<dyn Fn(&str, &Message) -> Option<Message> + Send + Sync>;

/// A scripted SP on a loopback port. Records every message it receives.
pub struct FakeSp {
    pub addr: String,
    received: mpsc::UnboundedReceiver<Message>,
    accepted: Arc<AtomicUsize>,
    shutdown: broadcast::Sender<()>,
}

impl FakeSp {
    /// An SP that only echoes latency probes.
    pub async fn start() -> FakeSp {
        Self::with_responder(|_, msg| echo_latency(msg)).await
    }

    pub async fn with_responder(
        f: impl Fn(&str, &Message) -> Option<Message> + Send + Sync + 'static,
    ) -> FakeSp {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake SP");
        let addr = listener.local_addr().expect("local addr").to_string();
        let (tx, received) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        let accepted = Arc::new(AtomicUsize::new(0));
        let responder: Responder = Arc::new(f);

        {
            let addr = addr.clone();
            let accepted = accepted.clone();
            let mut stop = shutdown.subscribe();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.recv() => break,
                        accepted_conn = listener.accept() => {
                            let Ok((stream, _)) = accepted_conn else { break };
                            accepted.fetch_add(1, Ordering::SeqCst);
                            tokio::spawn(serve_sp_conn(
                                stream,
                                addr.clone(),
                                tx.clone(),
                                responder.clone(),
                                shutdown.subscribe(),
                            ));
                        }
                    }
                }
            });
        }

        FakeSp {
            addr,
            received,
            accepted,
            shutdown,
        }
    }

    /// Next message the SP received, failing the test after `WAIT`.
    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.received.recv())
            .await
            .expect("fake SP got nothing in time")
            .expect("fake SP channel closed")
    }

    /// Skip messages until one of `msg_type` arrives.
    pub async fn expect(&mut self, msg_type: MessageType) -> Message {
        loop {
            let msg = self.next_message().await;
            if msg.message_type() == msg_type {
                return msg;
            }
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close the listener and every accepted connection.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for FakeSp {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_sp_conn(
    stream: TcpStream,
    own_addr: String,
    tx: mpsc::UnboundedSender<Message>,
    responder: Responder,
    mut stop: broadcast::Receiver<()>,
) {
    let (mut reader, mut writer) = stream.into_split();
    loop {
        tokio::select! {
            _ = stop.recv() => break,
            frame = read_frame(&mut reader) => {
                let Ok(Some(Frame { header, message: Ok(msg) })) = frame else { break };
                let reply = responder(&own_addr, &msg);
                let _ = tx.send(msg);
                if let Some(reply) = reply {
                    let bytes = frame_of(&reply, header.req_id());
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

pub fn frame_of(msg: &Message, req_id: i64) -> Vec<u8> {
    let payload = msg.encode_payload().expect("encode payload");
    encode_frame(APP_VER, msg.message_type(), req_id, &payload).expect("encode frame")
}

pub fn echo_latency(msg: &Message) -> Option<Message> {
    match msg {
        Message::ReqLatencyCheck(req) => Some(Message::RspLatencyCheck(RspLatencyCheck {
            p2p_address_pp: req.p2p_address_pp.clone(),
            network_address_sp: req.network_address_sp.clone(),
            ping_time: req.ping_time,
        })),
        _ => None,
    }
}

pub fn sp_list_reply(list: Vec<SpInfo>) -> Message {
    Message::RspGetSpList(RspGetSpList {
        result: ResponseResult::success(),
        sp_list: list,
    })
}

pub fn sp_info(addr: &str) -> SpInfo {
    SpInfo {
        p2p_address: format!("stsp-{addr}"),
        p2p_public_key: format!("stsppub-{addr}"),
        network_address: addr.to_string(),
    }
}

/// An address nothing listens on.
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    drop(listener);
    addr
}

/// The daemon's SP side: TCP connector, dispatch table, SP manager.
pub struct Node {
    pub sp: Arc<SpManager>,
    pub dispatcher: Arc<EventDispatcher>,
}

impl Node {
    /// Build a node knowing `bootstrap`. `extra` may add handlers beyond
    /// the latency and SP-list ones every node has.
    pub fn new(bootstrap: &[&str], extra: impl FnOnce(&mut HandlerRegistry)) -> Node {
        let dispatcher = Arc::new(EventDispatcher::new());
        let connector = Arc::new(TcpConnector::new(dispatcher.clone(), APP_VER, WAIT));
        let registry = Arc::new(ConnectionRegistry::new(connector));
        let identity = SpIdentity {
            p2p_address: "stpp-test".into(),
            p2p_public_key: "stpppub-test".into(),
            wallet_address: "stw-test".into(),
        };
        let infos: Vec<SpInfo> = bootstrap.iter().map(|a| sp_info(a)).collect();
        let sp = Arc::new(SpManager::new(identity, registry, &infos));

        let mut registry = HandlerRegistry::new();
        {
            let sp = sp.clone();
            registry.register(
                MessageType::RspLatencyCheck,
                move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                    if let Message::RspLatencyCheck(rsp) = msg {
                        sp.on_latency_response(&rsp);
                    }
                    Ok(())
                },
            );
        }
        {
            let sp = sp.clone();
            registry.register(
                MessageType::RspGetSpList,
                move |_: &Connection, _: i64, msg: Message| -> anyhow::Result<()> {
                    if let Message::RspGetSpList(rsp) = msg {
                        sp.replace_sp_list(rsp.sp_list);
                    }
                    Ok(())
                },
            );
        }
        extra(&mut registry);
        dispatcher.install(registry).expect("install dispatch table");

        Node { sp, dispatcher }
    }
}

/// Poll `cond` every 10ms until it holds, failing the test after `WAIT`.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
