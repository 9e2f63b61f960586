//! File bytes moving between the node and a local RPC client.
//!
//! The client side is played by the test: it listens on the file event
//! namespace and answers the way the RPC front end would.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;

use pp_core::rpc::ResultKind;
use pp_core::SliceOffset;
use pp_services::file_rpc::{file_key, slice_key};
use pp_services::{FileRpc, RpcError};

use crate::WAIT;

const CONTENT: &[u8] = b"0123456789abcdefghijklmnopqrstuv";

fn rpc() -> Arc<FileRpc> {
    Arc::new(FileRpc::new(Duration::from_secs(2)))
}

/// Answer one upload request on `hash` by pushing the asked range in
/// `chunk`-sized pieces.
async fn serve_upload(rpc: &FileRpc, hash: &str, chunk: usize) {
    let mut events = rpc.file_events().subscribe(hash);
    let req = events.next(WAIT).await.expect("upload request");
    assert_eq!(req.return_kind, ResultKind::UploadData);
    let start = req.offset_start.unwrap() as usize;
    let end = req.offset_end.unwrap() as usize;
    for piece in CONTENT[start..end].chunks(chunk) {
        assert!(rpc.send_file_data_back(hash, Bytes::copy_from_slice(piece)));
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn upload_pulls_slice_from_client() {
    let rpc = rpc();
    rpc.save_remote_file_hash("fh1", "/home/u/a.bin", CONTENT.len() as u64);
    assert!(rpc.is_file_rpc_remote("fh1"));
    assert_eq!(rpc.get_remote_file_size("fh1"), CONTENT.len() as u64);

    let client = {
        let rpc = rpc.clone();
        tokio::spawn(async move { serve_upload(&rpc, "fh1", 4).await })
    };
    // Let the client subscribe before the request goes out.
    crate::eventually("client listening", || rpc.file_events().is_subscribed("fh1")).await;

    let data = rpc
        .get_remote_file_data("fh1", Some(SliceOffset::new(4, 14)))
        .await
        .expect("slice fetched");
    assert_eq!(data, &CONTENT[4..14]);
    client.await.unwrap();

    rpc.clean_file_hash("fh1");
    assert!(!rpc.is_file_rpc_remote("fh1"));
}

#[tokio::test]
async fn upload_spools_slice_to_temp_file() {
    let rpc = rpc();
    let dir = tempfile::tempdir().unwrap();
    let tmp = dir.path().join("fh2.part");

    let client = {
        let rpc = rpc.clone();
        tokio::spawn(async move { serve_upload(&rpc, "fh2", 5).await })
    };
    crate::eventually("client listening", || rpc.file_events().is_subscribed("fh2")).await;

    rpc.cache_remote_file_data("fh2", Some(SliceOffset::new(0, 20)), &tmp)
        .await
        .expect("slice cached");
    client.await.unwrap();
    assert_eq!(std::fs::read(&tmp).unwrap(), &CONTENT[..20]);
}

#[tokio::test]
async fn upload_without_client_times_out() {
    let rpc = rpc();
    let err = rpc
        .get_remote_file_data("nobody", Some(SliceOffset::new(0, 8)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)), "{err:?}");
    assert!(rpc.upload_data().is_empty());
}

#[tokio::test]
async fn download_delivered_in_order_with_acks() {
    let rpc = rpc();
    let key = file_key("fh3", "req-1");

    let mut events = rpc.file_events().subscribe(key.clone());
    let node = {
        let rpc = rpc.clone();
        let key = key.clone();
        tokio::spawn(async move {
            for (i, piece) in CONTENT.chunks(8).enumerate() {
                rpc.save_remote_file_data(&key, "a.bin", piece, (i * 8) as u64)
                    .await?;
            }
            Ok::<_, RpcError>(())
        })
    };

    let mut received = Vec::new();
    for i in 0..CONTENT.len() / 8 {
        let ev = events.next(WAIT).await.expect("delivery");
        assert_eq!(ev.return_kind, ResultKind::DownloadOk);
        assert_eq!(ev.file_name.as_deref(), Some("a.bin"));
        assert_eq!(ev.offset_start, Some((i * 8) as u64));
        assert_eq!(ev.offset_end, Some((i * 8 + 8) as u64));
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ev.file_data.unwrap())
            .unwrap();
        received.extend(bytes);
        assert!(rpc.set_download_slice_done(&key));
    }

    node.await.unwrap().expect("all deliveries acknowledged");
    assert_eq!(received, CONTENT);
}

#[tokio::test]
async fn closing_session_stops_download() {
    let rpc = rpc();
    let key = file_key("fh4", "req-2");

    let mut events = rpc.file_events().subscribe(key.clone());
    let node = {
        let rpc = rpc.clone();
        let key = key.clone();
        tokio::spawn(async move {
            rpc.save_remote_file_data(&key, "b.bin", &CONTENT[..8], 0)
                .await?;
            rpc.save_remote_file_data(&key, "b.bin", &CONTENT[8..16], 8)
                .await
        })
    };

    events.next(WAIT).await.expect("first delivery");
    assert!(rpc.close_download_session(&key));
    rpc.set_download_slice_done(&key);

    let err = node.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::SessionClosing(k) if k == key));
    assert!(events.next(Duration::from_millis(50)).await.is_err());
}

#[tokio::test]
async fn slice_session_takes_precedence() {
    let rpc = rpc();
    let skey = slice_key("sh1", "req-3");
    let fkey = file_key("fh5", "req-3");

    let mut slices = rpc.slice_events().subscribe(skey.clone());
    let mut files = rpc.file_events().subscribe(fkey.clone());
    let node = {
        let rpc = rpc.clone();
        let (skey, fkey) = (skey.clone(), fkey.clone());
        tokio::spawn(async move {
            rpc.save_remote_file_slice_data(&skey, &fkey, "c.bin", &CONTENT[..4], 0)
                .await
        })
    };

    let ev = slices.next(WAIT).await.expect("slice delivery");
    assert_eq!(ev.return_kind, ResultKind::DownloadOk);
    rpc.set_download_slice_done(&skey);
    node.await.unwrap().unwrap();
    assert!(files.next(Duration::from_millis(50)).await.is_err());
}

#[tokio::test]
async fn file_info_asked_from_client() {
    let rpc = rpc();
    let key = file_key("fh6", "req-4");

    let mut events = rpc.file_events().subscribe(key.clone());
    let node = {
        let rpc = rpc.clone();
        let key = key.clone();
        tokio::spawn(async move { rpc.get_remote_file_info(&key, "req-4").await })
    };

    let ev = events.next(WAIT).await.expect("info request");
    assert_eq!(ev.return_kind, ResultKind::DlOkAskInfo);
    assert_eq!(ev.req_id.as_deref(), Some("req-4"));
    assert!(rpc.set_remote_file_info(&key, 4096));
    assert_eq!(node.await.unwrap(), 4096);
}

#[tokio::test]
async fn signature_supplied_by_client() {
    let rpc = rpc();
    let node = {
        let rpc = rpc.clone();
        tokio::spawn(async move { rpc.get_signature_from_remote("fh7req-5").await })
    };
    crate::eventually("signature waiter", || rpc.signatures().is_subscribed("fh7req-5")).await;
    assert!(rpc.set_signature("fh7req-5", vec![1, 2, 3]));
    assert_eq!(node.await.unwrap(), Some(vec![1, 2, 3]));
}
