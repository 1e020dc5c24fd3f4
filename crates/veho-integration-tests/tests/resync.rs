//! Magic-cookie resynchronization on a live stream connection.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use veho_endpoint::tcp::{TcpConfig, TcpServer};
use veho_endpoint::EndpointEvent;
use veho_wire::{Message, MAGIC_COOKIE_CLIENT};

#[tokio::test(flavor = "multi_thread")]
async fn test_garbage_then_cookie_then_frame() {
    let (events, mut events_rx) = mpsc::channel(16);
    let server = TcpServer::bind(
        SocketAddr::from(([127, 0, 0, 1], 0)),
        TcpConfig::default(),
        events,
    )
    .await
    .expect("bind");

    let mut valid = Message::request(0x1111, 0x3333, Bytes::from(vec![0x42; 16]));
    valid.client = 0x0010;
    valid.session = 0x0001;
    assert_eq!(valid.encoded_len(), 32);

    // 17 bytes of garbage, the client cookie, then the valid frame.
    let mut wire = BytesMut::new();
    wire.extend_from_slice(&[0xEE; 17]);
    wire.extend_from_slice(&MAGIC_COOKIE_CLIENT);
    wire.extend_from_slice(&valid.encode());

    let addr = SocketAddr::new([127, 0, 0, 1].into(), server.local_endpoint().port);
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&wire).await.expect("write");
    stream.flush().await.expect("flush");

    // Exactly one frame comes out, matching the 32-byte message.
    let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .expect("frame before timeout")
        .expect("event");
    match event {
        EndpointEvent::Frame(received) => {
            assert_eq!(received.service, 0x1111);
            assert_eq!(received.method, 0x3333);
            assert_eq!(received.payload, valid.payload);
            assert!(received.is_reliable);
        }
        other => unreachable!("unexpected event {other:?}"),
    }

    // And nothing else.
    tokio::time::sleep(Duration::from_millis(200)).await;
    match events_rx.try_recv() {
        Err(_) => {}
        Ok(EndpointEvent::PeerDown(_)) | Ok(EndpointEvent::PeerUp(_)) => {}
        Ok(EndpointEvent::Frame(extra)) => unreachable!("unexpected extra frame {extra:?}"),
    }

    drop(stream);
    server.stop().await;
}
