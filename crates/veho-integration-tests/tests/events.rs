//! Field caching, late subscription and debounce filtering.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use veho_integration_tests::{local_config, test_runtime, wait_available};
use veho_types::{MessageType, ANY_EVENT};
use veho_wire::Message;

#[tokio::test(flavor = "multi_thread")]
async fn test_late_subscribe_receives_cached_field() {
    let runtime = test_runtime("late-subscribe", local_config());

    let service = runtime.create_application("hello_service").await.expect("service app");
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");
    // Publish the field value before anyone subscribes.
    service
        .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x01]), true)
        .expect("notify");

    let client = runtime.create_application("hello_client").await.expect("client app");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Message>();
    client.register_message_handler(0x1111, 0x2222, 0x8001, {
        Box::new(move |message| {
            let _ = event_tx.send(message.clone());
        })
    });
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    // Give the field publication time to land in the host's cache, then
    // subscribe late.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.subscribe(0x1111, 0x2222, 0x0001, 1, 0xFFFFFF).expect("subscribe");

    let first = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("initial event before timeout")
        .expect("initial event");
    assert_eq!(first.method, 0x8001);
    assert_eq!(first.payload, Bytes::from_static(&[0x01]));
    assert_eq!(first.message_type, MessageType::Notification);
    assert!(first.is_initial, "cached field arrives as the initial event");

    client.stop();
    service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_before_first_value_has_no_initial() {
    let runtime = test_runtime("no-initial", local_config());

    let service = runtime.create_application("hello_service").await.expect("service app");
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");

    let client = runtime.create_application("hello_client").await.expect("client app");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Message>();
    client.register_message_handler(0x1111, 0x2222, 0x8001, {
        Box::new(move |message| {
            let _ = event_tx.send(message.clone());
        })
    });
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    // No value was ever set: subscribing must not produce an initial event.
    client.subscribe(0x1111, 0x2222, 0x0001, 1, 0xFFFFFF).expect("subscribe");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(event_rx.try_recv().is_err(), "no initial event without a cached value");

    // The first real notification arrives normally.
    service
        .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x07]), true)
        .expect("notify");
    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("event before timeout")
        .expect("event");
    assert_eq!(event.payload, Bytes::from_static(&[0x07]));
    assert!(!event.is_initial);

    client.stop();
    service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_provider_debounce_bounds_rate_and_flushes_last_value() {
    let runtime = test_runtime("provider-debounce", local_config());

    let service = runtime.create_application("hello_service").await.expect("service app");
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");

    let client = runtime.create_application("hello_client").await.expect("client app");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Message>();
    client.register_message_handler(0x1111, 0x2222, 0x8002, {
        Box::new(move |message| {
            let _ = event_tx.send(message.clone());
        })
    });
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    // Event 0x8002 carries a configured 150 ms debounce; the host enforces
    // it for every subscriber, with no client-side filter installed.
    client.subscribe(0x1111, 0x2222, 0x0002, 1, 0xFFFFFF).expect("subscribe");
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A burst of ten distinct values, far faster than the interval.
    for i in 0..10u8 {
        service
            .notify(0x1111, 0x2222, 0x8002, Bytes::copy_from_slice(&[i]), false)
            .expect("notify");
    }

    // The first value passes immediately.
    let first = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("first delivery before timeout")
        .expect("first delivery");
    assert_eq!(first.payload, Bytes::from_static(&[0]));

    // The rest collapse into one flushed delivery of the newest value once
    // the interval elapses (driven by the host's sweep).
    let flushed = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("flushed delivery before timeout")
        .expect("flushed delivery");
    assert_eq!(flushed.payload, Bytes::from_static(&[9]));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(event_rx.try_recv().is_err(), "burst collapses into two deliveries");

    client.stop();
    service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscriber_debounce_flushes_buffered_update() {
    let runtime = test_runtime("subscriber-debounce", local_config());

    let service = runtime.create_application("hello_service").await.expect("service app");
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");

    let client = runtime.create_application("hello_client").await.expect("client app");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Message>();
    client.register_message_handler(0x1111, 0x2222, 0x8001, {
        Box::new(move |message| {
            let _ = event_tx.send(message.clone());
        })
    });
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    // Rate-bound delivery on the subscriber side; no change criterion.
    client.set_debounce(0x1111, 0x2222, 0x8001, 150, false);
    client.subscribe(0x1111, 0x2222, 0x0001, 1, 0xFFFFFF).expect("subscribe");

    service
        .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[1]), true)
        .expect("notify");
    service
        .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[2]), true)
        .expect("notify");

    let first = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("first delivery before timeout")
        .expect("first delivery");
    assert_eq!(first.payload, Bytes::from_static(&[1]));

    // The second update was held back by the interval; the application's
    // flush timer must deliver it even though nothing else is published.
    let flushed = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .expect("buffered update must flush without further traffic")
        .expect("flushed delivery");
    assert_eq!(flushed.payload, Bytes::from_static(&[2]));

    client.stop();
    service.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_debounce_suppresses_all_notifications() {
    let runtime = test_runtime("debounce-off", local_config());

    let service = runtime.create_application("hello_service").await.expect("service app");
    service.offer_service(0x1111, 0x2222, 1, 0).expect("offer");
    service
        .notify(0x1111, 0x2222, 0x8001, Bytes::from_static(&[0x00]), true)
        .expect("notify");

    let client = runtime.create_application("hello_client").await.expect("client app");
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Message>();
    client.register_message_handler(0x1111, 0x2222, 0x8001, {
        Box::new(move |message| {
            let _ = event_tx.send(message.clone());
        })
    });
    client.request_service(0x1111, 0x2222, 1, 0).expect("request service");
    assert!(wait_available(&client, 0x1111, 0x2222).await, "service never became available");

    // Interval -1 disables delivery entirely, the initial event included.
    client.set_debounce(0x1111, 0x2222, ANY_EVENT, -1, false);
    client.subscribe(0x1111, 0x2222, 0x0001, 1, 0xFFFFFF).expect("subscribe");

    for i in 0..100u8 {
        service
            .notify(0x1111, 0x2222, 0x8001, Bytes::copy_from_slice(&[i]), true)
            .expect("notify");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(event_rx.try_recv().is_err(), "disabled filter delivers nothing");

    client.stop();
    service.stop();
}
