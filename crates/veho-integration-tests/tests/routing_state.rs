//! Suspend and resume of the routing core.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use veho_integration_tests::{local_config, test_runtime, wait_available, wait_until};
use veho_routing::RoutingError;
use veho_types::RoutingState;
use veho_wire::Message;

#[tokio::test(flavor = "multi_thread")]
async fn test_suspended_routing_rejects_sends() {
    let runtime = test_runtime("suspend", local_config());

    let service = runtime.create_application("hello_service").await.expect("service app");
    let (req_tx, mut req_rx) = mpsc::unbounded_channel::<Message>();
    service.register_message_handler(0x1111, 0x2222, 0x3333, {
        Box::new(move |message| {
            let _ = req_tx.send(message.clone());
        })
    });
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");

    let client = runtime.create_application("hello_client").await.expect("client app");
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    // Suspend: every application learns the new state.
    service.set_routing_state(RoutingState::Suspended).expect("suspend");
    assert!(
        wait_until(Duration::from_secs(5), || {
            client.routing_state() == RoutingState::Suspended
        })
        .await,
        "client never saw the suspension"
    );

    let mut request = Message::request(0x1111, 0x3333, Bytes::from_static(b"ping"));
    request.instance = 0x2222;
    request.interface_version = 1;
    match client.send(request.clone()) {
        Err(RoutingError::NotRunning) => {}
        other => unreachable!("suspended send must fail with NotRunning, got {other:?}"),
    }
    // Nothing reached the service.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(req_rx.try_recv().is_err());

    // Resume: the same send goes through and gets answered.
    service.set_routing_state(RoutingState::Resumed).expect("resume");
    service.set_routing_state(RoutingState::Running).expect("running");
    assert!(
        wait_until(Duration::from_secs(5), || {
            client.routing_state().allows_sending()
        })
        .await,
        "client never saw the resume"
    );

    let requesting = tokio::spawn(async move {
        let response = client.request(request, Duration::from_secs(5)).await;
        (client, response)
    });
    let observed = tokio::time::timeout(Duration::from_secs(5), req_rx.recv())
        .await
        .expect("request before timeout")
        .expect("request arrives");
    let reply = Message::response_to(&observed, Bytes::from_static(b"pong"));
    service.send(reply).expect("send response");

    let (client, response) = requesting.await.expect("request task");
    assert_eq!(response.expect("response").payload, Bytes::from_static(b"pong"));

    client.stop();
    service.stop();
}
