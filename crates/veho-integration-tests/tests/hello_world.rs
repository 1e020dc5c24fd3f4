//! Request/response round trip between two applications on one host.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use veho_integration_tests::{local_config, test_runtime, wait_available};
use veho_types::{MessageType, ReturnCode};
use veho_wire::Message;

#[tokio::test(flavor = "multi_thread")]
async fn test_hello_request_response() {
    let runtime = test_runtime("hello", local_config());

    // The service side hosts routing and answers one method.
    let service = runtime.create_application("hello_service").await.expect("service app");
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Message>();
    service.register_message_handler(0x1111, 0x2222, 0x3333, {
        let req_tx = req_tx.clone();
        Box::new(move |message| {
            let _ = req_tx.send(message.clone());
        })
    });
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");

    // The client side.
    let client = runtime.create_application("hello_client").await.expect("client app");
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    let mut request = Message::request(0x1111, 0x3333, Bytes::from_static(b"World"));
    request.instance = 0x2222;
    request.interface_version = 1;
    let requesting = tokio::spawn(async move {
        let response = client.request(request, Duration::from_secs(5)).await;
        (client, response)
    });

    // The service observes exactly one request with the literal fields.
    let observed = tokio::time::timeout(Duration::from_secs(5), req_rx.recv())
        .await
        .expect("request before timeout")
        .expect("request arrives");
    assert_eq!(observed.message_type, MessageType::Request);
    assert_eq!(observed.service, 0x1111);
    assert_eq!(observed.method, 0x3333);
    assert_eq!(observed.client, 0x0010);
    assert_eq!(observed.session, 0x0001);
    assert_eq!(observed.payload, Bytes::from_static(b"World"));
    assert!(req_rx.try_recv().is_err(), "exactly one request");

    let reply = Message::response_to(&observed, Bytes::from_static(b"Hello World"));
    service.send(reply).expect("send response");

    let (client, response) = requesting.await.expect("request task");
    let response = response.expect("response");
    assert_eq!(response.message_type, MessageType::Response);
    assert_eq!(response.return_code, ReturnCode::Ok);
    assert_eq!(response.service, 0x1111);
    assert_eq!(response.method, 0x3333);
    assert_eq!(response.session, observed.session);
    assert_eq!(response.payload, Bytes::from_static(b"Hello World"));

    client.stop();
    service.stop();
}
