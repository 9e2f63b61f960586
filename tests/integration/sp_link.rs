//! SP connection management over real sockets.

use pp_core::{Message, MessageType};
use pp_services::{PeerStatus, SpError};

use crate::*;

#[tokio::test]
async fn connects_to_first_reachable_sp() {
    let live = FakeSp::start().await;
    let dead = closed_port().await;
    let node = Node::new(&[&dead, &live.addr], |_| {});

    let conn = node.sp.ensure_connected().await.expect("connect");
    assert_eq!(conn.addr(), live.addr);
    assert_eq!(node.sp.active_addr().as_deref(), Some(live.addr.as_str()));
    assert!(node.sp.registry().is_connected(&live.addr));
    assert!(!node.sp.registry().is_connected(&dead));

    let failed = node.sp.peer(&dead).expect("dead SP still listed");
    assert_eq!(failed.status, PeerStatus::Failed);
    assert_eq!(failed.failures, 1);
    assert_eq!(node.sp.peer(&live.addr).unwrap().status, PeerStatus::Connected);

    let again = node.sp.ensure_connected().await.unwrap();
    assert!(again.same(&conn));
    assert_eq!(live.accepted(), 1);
}

#[tokio::test]
async fn no_reachable_sp_is_an_error() {
    let a = closed_port().await;
    let b = closed_port().await;
    let node = Node::new(&[&a, &b], |_| {});

    let err = node.sp.ensure_connected().await.unwrap_err();
    assert!(matches!(err, SpError::Transport(_)), "{err:?}");
    assert!(node.sp.active().is_none());
    for addr in [&a, &b] {
        assert_eq!(node.sp.peer(addr).unwrap().status, PeerStatus::Failed);
    }
}

#[tokio::test]
async fn probe_measures_latency_through_echo() {
    let mut active = FakeSp::start().await;
    let mut other = FakeSp::start().await;
    let node = Node::new(&[&active.addr, &other.addr], |_| {});
    node.sp.ensure_connected().await.unwrap();

    node.sp.probe_latency(&other.addr).await.expect("probe sent");
    assert!(node.sp.is_buffered(&other.addr));

    let Message::ReqLatencyCheck(req) = other.expect(MessageType::ReqLatencyCheck).await else {
        unreachable!()
    };
    assert_eq!(req.p2p_address_pp, "stpp-test");
    assert_eq!(req.network_address_sp, other.addr);
    assert!(req.ping_time > 0);

    let sp = node.sp.clone();
    let addr = other.addr.clone();
    eventually("probe answer", move || {
        sp.peer(&addr).and_then(|r| r.latency).is_some()
    })
    .await;

    // Probing the active SP reuses its connection.
    node.sp.probe_latency(&active.addr).await.unwrap();
    active.expect(MessageType::ReqLatencyCheck).await;
    assert!(!node.sp.is_buffered(&active.addr));
    assert_eq!(active.accepted(), 1);
}

#[tokio::test]
async fn unreachable_probe_is_not_buffered() {
    let live = FakeSp::start().await;
    let dead = closed_port().await;
    let node = Node::new(&[&live.addr, &dead], |_| {});
    node.sp.ensure_connected().await.unwrap();

    assert!(node.sp.probe_latency(&dead).await.is_err());
    assert!(!node.sp.is_buffered(&dead));
    assert_eq!(node.sp.buffered_len(), 0);
    assert_eq!(node.sp.peer(&dead).unwrap().status, PeerStatus::Failed);
}

#[tokio::test]
async fn sweep_switches_to_answering_sp() {
    // The active SP never answers probes, so any measured SP beats it.
    let mut silent = FakeSp::with_responder(|_, _| None).await;
    let fast = FakeSp::start().await;
    let node = Node::new(&[&silent.addr, &fast.addr], |_| {});
    let first = node.sp.ensure_connected().await.unwrap();
    assert_eq!(first.addr(), silent.addr);

    let sent = node.sp.latency_sweep().await.expect("sweep");
    assert_eq!(sent, 2);
    silent.expect(MessageType::ReqLatencyCheck).await;

    let sp = node.sp.clone();
    let addr = fast.addr.clone();
    eventually("fast SP latency", move || {
        sp.peer(&addr).and_then(|r| r.latency).is_some()
    })
    .await;

    assert_eq!(node.sp.select_fastest().as_deref(), Some(fast.addr.as_str()));
    assert_eq!(node.sp.active_addr().as_deref(), Some(fast.addr.as_str()));
    assert_eq!(node.sp.buffered_len(), 0);
    assert!(!first.is_alive());
    assert_eq!(
        node.sp.peer(&silent.addr).unwrap().status,
        PeerStatus::Disconnected
    );
}

#[tokio::test]
async fn sweep_needs_an_active_sp() {
    let a = FakeSp::start().await;
    let b = FakeSp::start().await;
    let node = Node::new(&[&a.addr, &b.addr], |_| {});

    let err = node.sp.latency_sweep().await.unwrap_err();
    assert!(matches!(err, SpError::NoSupervisor));
    assert_eq!(a.accepted() + b.accepted(), 0);
}

#[tokio::test]
async fn refresh_replaces_sp_list() {
    let mut sp = FakeSp::with_responder(|own, msg| match msg {
        Message::ReqGetSpList(_) => Some(sp_list_reply(vec![
            sp_info("127.0.0.1:9"),
            sp_info(own),
        ])),
        _ => None,
    })
    .await;
    let stale = closed_port().await;
    let node = Node::new(&[&sp.addr, &stale], |_| {});

    node.sp.refresh_sp_list().await.expect("request sent");
    let Message::ReqGetSpList(req) = sp.expect(MessageType::ReqGetSpList).await else {
        unreachable!()
    };
    assert_eq!(req.p2p_address, "stpp-test");
    assert_eq!(req.wallet_address, "stw-test");

    let manager = node.sp.clone();
    eventually("SP list replaced", move || manager.peer("127.0.0.1:9").is_some()).await;

    assert!(node.sp.peer(&stale).is_none());
    assert_eq!(node.sp.len(), 2);
    let ranks: Vec<String> = node.sp.peers().into_iter().map(|r| r.network_address).collect();
    assert_eq!(ranks, vec!["127.0.0.1:9".to_string(), sp.addr.clone()]);

    // Still listed, so the active connection survives.
    assert_eq!(node.sp.active_addr().as_deref(), Some(sp.addr.as_str()));
    assert_eq!(
        node.sp.peer(&sp.addr).unwrap().status,
        PeerStatus::Connected
    );
}

#[tokio::test]
async fn reconnects_after_sp_goes_away() {
    let first = FakeSp::start().await;
    let mut second = FakeSp::start().await;
    let node = Node::new(&[&first.addr, &second.addr], |_| {});

    let conn = node.sp.ensure_connected().await.unwrap();
    assert_eq!(conn.addr(), first.addr);

    first.stop();
    eventually("connection to notice close", || !conn.is_alive()).await;
    assert!(node.sp.active().is_none());

    node.sp.get_pp_status(false).await.expect("status request sent");
    assert_eq!(node.sp.active_addr().as_deref(), Some(second.addr.as_str()));
    let Message::ReqGetPpStatus(req) = second.expect(MessageType::ReqGetPpStatus).await else {
        unreachable!()
    };
    assert!(!req.init_pp_list);
}
