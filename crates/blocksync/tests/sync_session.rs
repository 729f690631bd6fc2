#![cfg(feature = "client")]

//! Client integration tests against an in-process WebSocket peer.
//!
//! The peer side is implemented with the same frame codec the client uses,
//! so these run self-contained — no external collaboration server needed.

use std::time::Duration;

use async_tungstenite::tokio::{accept_async, TokioAdapter};
use async_tungstenite::tungstenite::Message as WsMessage;
use async_tungstenite::WebSocketStream;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};

use blocksync::crdt::codec::{self, UpdateFormat};
use blocksync::{
    write_document, BlockAttrs, BlockTag, ClientConfig, CollabClient, Document, Frame, Replica,
    SequentialIds, StateVector, SyncError, SyncFrame,
};

type PeerStream = WebSocketStream<TokioAdapter<TcpStream>>;

async fn next_frame(ws: &mut PeerStream) -> Frame {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => return Frame::decode(&data).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("peer connection ended unexpectedly: {:?}", other),
        }
    }
}

async fn send_frame(ws: &mut PeerStream, frame: &Frame) {
    ws.send(WsMessage::Binary(frame.encode().into()))
        .await
        .unwrap();
}

/// Accept one connection and run the server half of the handshake: expect
/// awareness then STEP1, send our own STEP1 and STEP2, merge the client's
/// legacy STEP2 reply, then merge one incremental update.
async fn run_peer(listener: TcpListener, mut replica: Replica) -> Replica {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut ws = accept_async(tcp).await.unwrap();

    // Presence must arrive before any sync frame.
    let frame = next_frame(&mut ws).await;
    let Frame::Awareness(entries) = frame else {
        panic!("expected awareness first, got {:?}", frame);
    };
    assert_eq!(entries.len(), 1);

    let frame = next_frame(&mut ws).await;
    let Frame::Sync(SyncFrame::Step1(sv_bytes)) = frame else {
        panic!("expected STEP1, got {:?}", frame);
    };
    let client_sv = StateVector::decode(&sv_bytes).unwrap();

    // Ask for whatever the client has, then answer its request.
    send_frame(&mut ws, &Frame::step1(replica.state_vector())).await;
    let diff = replica.diff(&client_sv);
    send_frame(
        &mut ws,
        &Frame::step2(codec::encode_update(&diff, UpdateFormat::Compact)),
    )
    .await;

    // The client's STEP2 reply must decode under the legacy sub-encoding
    // specifically — the reference peer accepts nothing else.
    let frame = next_frame(&mut ws).await;
    let Frame::Sync(SyncFrame::Step2(payload)) = frame else {
        panic!("expected STEP2 reply, got {:?}", frame);
    };
    let update = codec::decode_with(&payload, UpdateFormat::Legacy).unwrap();
    replica.apply(&update);

    // One incremental update after the client reaches Synced.
    let frame = next_frame(&mut ws).await;
    let Frame::Sync(SyncFrame::Update(payload)) = frame else {
        panic!("expected UPDATE, got {:?}", frame);
    };
    replica.apply(&codec::decode_update(&payload).unwrap());

    // Drain until the client closes so its close handshake completes.
    while let Some(Ok(_)) = ws.next().await {}

    replica
}

fn server_replica_with_paragraph(text: &str) -> Replica {
    let mut replica = Replica::new(99);
    replica.transact(|tx| {
        let p = tx.append_block(BlockTag::Paragraph, BlockAttrs::default());
        tx.append_text(&p, text).unwrap();
    });
    replica
}

#[tokio::test]
async fn test_full_handshake_and_update() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(run_peer(listener, server_replica_with_paragraph("shared")));

    let config = ClientConfig::new(format!("ws://{}", addr))
        .with_peer(7)
        .with_deadline(Duration::from_secs(5));
    let mut client = CollabClient::connect(config).await.unwrap();
    let mut replica = Replica::new(7);

    client.sync(&mut replica).await.unwrap();
    assert!(client.is_synced());

    // The server's paragraph arrived through its STEP2.
    assert_eq!(replica.doc().len(), 1);
    let id = replica.doc().order()[0].clone();
    assert_eq!(
        replica.doc().block(&id).unwrap().run().unwrap().plain_text(),
        "shared"
    );

    // One transaction, one published update.
    replica.transact(|tx| {
        tx.append_block(BlockTag::Divider, BlockAttrs::default());
    });
    client.publish(&replica).await.unwrap();
    client.close().await.unwrap();

    let server_replica = peer.await.unwrap();
    assert_eq!(server_replica.doc().len(), 2);
    assert_eq!(server_replica.doc().order(), replica.doc().order());
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        // Swallow everything, never answer.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let config = ClientConfig::new(format!("ws://{}", addr))
        .with_deadline(Duration::from_millis(250));
    let mut client = CollabClient::connect(config).await.unwrap();
    let mut replica = Replica::new(1);

    let err = client.sync(&mut replica).await.unwrap_err();
    assert!(matches!(err, SyncError::HandshakeTimeout(_)), "{:?}", err);
}

#[tokio::test]
async fn test_write_document_replaces_peer_content() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(run_peer(listener, server_replica_with_paragraph("old")));

    let mut document = Document::with_ids(Box::new(SequentialIds::new("w")));
    document.append_block(BlockTag::Heading1, BlockAttrs::default());
    document.append_block(BlockTag::Divider, BlockAttrs::default());

    let config = ClientConfig::new(format!("ws://{}", addr))
        .with_deadline(Duration::from_secs(5))
        .with_settle_delay(Duration::from_millis(10));
    let outcome = write_document(config, &document).await;
    assert!(outcome.success, "{:?}", outcome.error);

    let server_replica = peer.await.unwrap();
    // The old paragraph is gone; only the written blocks remain.
    assert_eq!(server_replica.doc().order(), &["w-0", "w-1"]);
    assert_eq!(
        server_replica.doc().block("w-0").unwrap().tag,
        BlockTag::Heading1
    );
}

#[tokio::test]
async fn test_write_empty_document_fails_without_connecting() {
    // The URL is never dialed; the application error comes first.
    let config = ClientConfig::new("ws://127.0.0.1:9/doc");
    let outcome = write_document(config, &Document::new()).await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("application error"));
}
