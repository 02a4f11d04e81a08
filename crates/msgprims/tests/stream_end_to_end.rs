use std::sync::Arc;
use std::time::Duration;

use msgprims::base::{Message, SharedConnection};
use msgprims::frame::StreamConnection;
use msgprims::rpc::{RpcClient, RpcObject, RpcServer};
use serde_json::json;

msgprims::rpc_interface! {
    /// Remote store proxy.
    struct StoreProxy: "store" { put, size }
}

fn duplex_pair() -> (SharedConnection, SharedConnection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Arc::new(StreamConnection::from_stream(a)),
        Arc::new(StreamConnection::from_stream(b)),
    )
}

fn store_object() -> RpcObject {
    RpcObject::new()
        .method_sync("put", |msg| {
            let total: usize = msg.blobs.iter().map(|blob| blob.len()).sum();
            Ok(Message::with_blobs(json!({ "stored": total }), msg.blobs))
        })
        .method("size", |msg| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Message::new(json!({ "size": msg.blobs.len() })))
        })
}

#[tokio::test]
async fn rpc_over_a_byte_stream_carries_blobs() {
    let (server_side, client_side) = duplex_pair();
    let server = RpcServer::new(server_side);
    server.register("store", store_object());

    let client = RpcClient::new(client_side);
    let store = StoreProxy::bind(&client, "store").unwrap();

    let reply = store
        .put(Message::with_blobs(json!({}), [vec![0u8; 10], vec![1u8; 20]]))
        .await
        .unwrap();
    assert_eq!(reply.text, json!({ "stored": 30 }));
    assert_eq!(reply.blobs.len(), 2);
    assert_eq!(reply.blobs[1].len(), 20);

    let size = store.size(json!({})).await.unwrap();
    assert_eq!(size.text, json!({ "size": 0 }));
}

#[cfg(all(feature = "manager", feature = "mux"))]
#[tokio::test]
async fn managed_objects_over_a_multiplexed_stream() {
    use msgprims::base::ConnectionExt;
    use msgprims::manager::make_managed_connection;
    use msgprims::mux::Multiplexer;

    let (left, right) = duplex_pair();
    let left_mux = Multiplexer::new(left);
    let right_mux = Multiplexer::new(right);

    let left_rpc: SharedConnection = left_mux.register("rpc").unwrap();
    let right_rpc: SharedConnection = right_mux.register("rpc").unwrap();
    let left_chat: SharedConnection = left_mux.register("chat").unwrap();

    let (left_local, _left_remote) = make_managed_connection(left_rpc).await.unwrap();
    let (_right_local, right_remote) = make_managed_connection(right_rpc).await.unwrap();

    left_local.add_service("store", store_object());
    right_remote
        .client()
        .register_type("store", ["put", "size"])
        .unwrap();
    let store = right_remote.get("store", "store").await.unwrap().unwrap();

    let reply = store
        .call("put", Message::with_blobs(json!({}), [b"abc".to_vec()]))
        .await
        .unwrap();
    assert_eq!(reply.text, json!({ "stored": 3 }));

    // "chat" was never registered on the right, so the right multiplexer
    // answers with a close and the left stream ends.
    let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
    let closed_tx = std::sync::Mutex::new(Some(closed_tx));
    left_chat.on_event(move |ev| {
        if ev.is_closed() {
            if let Some(tx) = closed_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
        Ok(())
    });
    left_chat.send(Message::new(json!({"hi": true}))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), closed_rx)
        .await
        .expect("stream should close")
        .unwrap();

    store.close().await.unwrap();
    assert!(left_local.exported_objects().is_empty());
}
