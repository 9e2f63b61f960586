//! Inbound connections: the peer listener, dispatch, and outbound transfers.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use pp_core::message::{Heartbeat, ReqLatencyCheck};
use pp_core::wire::{MessageHeader, FRAME_MAGIC, HEADER_LEN};
use pp_core::{Message, MessageType};
use pp_services::transport::{read_frame, serve};
use pp_services::{Connection, ConnectionRegistry, EventDispatcher, HandlerRegistry, TcpConnector};

use crate::*;

async fn start_listener() -> (String, broadcast::Sender<()>) {
    let mut registry = HandlerRegistry::new();
    registry.register(
        MessageType::ReqHeartbeat,
        |conn: &Connection, req_id: i64, _: Message| -> anyhow::Result<()> {
            conn.send(
                &Message::RspHeartbeat(Heartbeat {
                    p2p_address: "stpp-test".into(),
                }),
                req_id,
            )?;
            Ok(())
        },
    );
    registry.register(
        MessageType::ReqLatencyCheck,
        |conn: &Connection, req_id: i64, msg: Message| -> anyhow::Result<()> {
            if let Some(rsp) = echo_latency(&msg) {
                conn.send(&rsp, req_id)?;
            }
            Ok(())
        },
    );
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher.install(registry).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(serve(listener, dispatcher, APP_VER, shutdown.subscribe()));
    (addr, shutdown)
}

#[tokio::test]
async fn heartbeat_answered_with_request_id() {
    let (addr, _shutdown) = start_listener().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    let req = Message::ReqHeartbeat(Heartbeat {
        p2p_address: "stsp-1".into(),
    });
    stream.write_all(&frame_of(&req, 42)).await.unwrap();

    let frame = tokio::time::timeout(WAIT, read_frame(&mut stream))
        .await
        .expect("reply in time")
        .unwrap()
        .expect("frame");
    assert_eq!(frame.header.req_id(), 42);
    assert_eq!(frame.header.version(), APP_VER);
    assert_eq!(
        frame.message.unwrap(),
        Message::RspHeartbeat(Heartbeat {
            p2p_address: "stpp-test".into()
        })
    );
}

#[tokio::test]
async fn unknown_frame_skipped_and_stream_stays_usable() {
    let (addr, _shutdown) = start_listener().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();

    // A frame with an unassigned type tag, then a real request.
    let mut bytes = Vec::new();
    let mut head = frame_of(&Message::ReqSpLatencyCheck, 0);
    head.truncate(HEADER_LEN);
    assert_eq!(head[0], FRAME_MAGIC);
    let unknown = MessageHeader::parse(&head).unwrap();
    assert_eq!(unknown.length(), 0);
    // msg_type is the u16 after magic and version.
    head[3] = 0x7f;
    head[4] = 0x00;
    bytes.extend_from_slice(&head);

    let latency_check = Message::ReqLatencyCheck(ReqLatencyCheck {
        p2p_address_pp: "stsp-1".into(),
        network_address_sp: addr.clone(),
        ping_time: 7,
    });
    bytes.extend(frame_of(&latency_check, 9));
    stream.write_all(&bytes).await.unwrap();

    let frame = tokio::time::timeout(WAIT, read_frame(&mut stream))
        .await
        .expect("reply in time")
        .unwrap()
        .expect("frame");
    assert_eq!(frame.header.req_id(), 9);
    assert_eq!(frame.message.unwrap().message_type(), MessageType::RspLatencyCheck);
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (addr, shutdown) = start_listener().await;
    shutdown.send(()).unwrap();

    let mut refused = false;
    for _ in 0..100 {
        if TcpStream::connect(&addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(refused, "listener still accepting after shutdown");
}

#[tokio::test]
async fn registry_transfers_over_one_connection() {
    let mut sp = FakeSp::start().await;
    let dispatcher = Arc::new(EventDispatcher::new());
    dispatcher.install(HandlerRegistry::new()).unwrap();
    let registry = ConnectionRegistry::new(Arc::new(TcpConnector::new(dispatcher, APP_VER, WAIT)));

    for n in 0..3 {
        let hb = Message::ReqHeartbeat(Heartbeat {
            p2p_address: format!("stpp-{n}"),
        });
        registry.transfer(&sp.addr, &hb, n).await.expect("transfer");
    }
    for n in 0..3 {
        let Message::ReqHeartbeat(hb) = sp.next_message().await else {
            panic!("expected heartbeat")
        };
        assert_eq!(hb.p2p_address, format!("stpp-{n}"));
    }
    assert_eq!(sp.accepted(), 1);
    assert!(registry.is_connected(&sp.addr));

    registry.remove(&sp.addr);
    assert!(!registry.is_connected(&sp.addr));
}
