use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bus::{handler, Bus, BusConfig, MemoryHub};
use envelope::Message;
use models::{LoadMetrics, ServiceStatus};
use pretty_assertions::assert_eq;

fn heartbeat(player_count: u32) -> Message {
    Message::Heartbeat(models::Heartbeat {
        id: "mini1".into(),
        status: ServiceStatus::Available,
        load: LoadMetrics {
            player_count,
            max_players: 50,
            tps: 20.0,
            response_time: 1,
        },
        timestamp: models::now_ms(),
    })
}

#[tokio::test]
async fn publish_order_is_preserved_per_subscriber() {
    let hub = MemoryHub::new();
    let publisher = Bus::in_memory(&hub, &BusConfig::new("publisher"));
    let subscriber = Bus::in_memory(&hub, &BusConfig::new("subscriber"));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    subscriber.subscribe(
        "fulcrum.test.stream",
        handler(move |envelope| {
            let tx = tx.clone();
            async move {
                let Ok(Message::Heartbeat(beat)) = envelope.message() else {
                    panic!("unexpected message");
                };
                tx.send(beat.load.player_count).unwrap();
            }
        }),
    );

    for i in 0..100 {
        publisher.publish("fulcrum.test.stream", &heartbeat(i)).unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..100 {
        seen.push(rx.recv().await.unwrap());
    }
    assert_eq!(seen, (0..100).collect::<Vec<_>>());
}

#[tokio::test]
async fn directed_sends_are_filtered_by_target() {
    let hub = MemoryHub::new();
    let publisher = Bus::in_memory(&hub, &BusConfig::new("publisher"));
    let for_b = Bus::in_memory(&hub, &BusConfig::new("b"));
    let for_c = Bus::in_memory(&hub, &BusConfig::new("c"));

    let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
    let (tx_c, mut rx_c) = tokio::sync::mpsc::unbounded_channel();
    for_b.subscribe(
        "fulcrum.test.directed",
        handler(move |envelope| {
            let tx = tx_b.clone();
            async move {
                tx.send(envelope.sender_id).unwrap();
            }
        }),
    );
    for_c.subscribe(
        "fulcrum.test.directed",
        handler(move |envelope| {
            let tx = tx_c.clone();
            async move {
                tx.send(envelope.sender_id).unwrap();
            }
        }),
    );

    publisher.send("b", "fulcrum.test.directed", &heartbeat(1)).unwrap();
    // A broadcast afterwards reaches both; receiving it on c proves the
    // directed envelope was filtered rather than still in flight.
    publisher.publish("fulcrum.test.directed", &heartbeat(2)).unwrap();

    assert_eq!(rx_b.recv().await.unwrap(), "publisher");
    assert_eq!(rx_b.recv().await.unwrap(), "publisher");
    assert_eq!(rx_c.recv().await.unwrap(), "publisher");
    assert!(rx_c.try_recv().is_err());
}

#[tokio::test]
async fn request_completes_with_the_correlated_response() {
    let hub = MemoryHub::new();
    let requester = Bus::in_memory(&hub, &BusConfig::new("proxy1"));
    let responder = Bus::in_memory(&hub, &BusConfig::new("registry"));

    let responder_clone = responder.clone();
    responder.subscribe(
        "fulcrum.registry.runtimeinfo.request",
        handler(move |envelope| {
            let responder = responder_clone.clone();
            async move {
                let reply = Message::RuntimeInfoResponse(models::RuntimeInfoResponse {
                    directory: Vec::new(),
                    slots: BTreeMap::new(),
                    bus_metrics: None,
                });
                responder.respond(&envelope, &reply).unwrap();
            }
        }),
    );

    let response = requester
        .request(
            None,
            "fulcrum.registry.runtimeinfo.request",
            &Message::RuntimeInfoRequest(models::RuntimeInfoRequest::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(response.sender_id, "registry");
    assert_eq!(response.target_id, Some("proxy1".to_string()));
    assert!(matches!(
        response.message().unwrap(),
        Message::RuntimeInfoResponse(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn request_times_out_when_nobody_answers() {
    let hub = MemoryHub::new();
    let requester = Bus::in_memory(&hub, &BusConfig::new("proxy1"));

    let started = tokio::time::Instant::now();
    let err = requester
        .request(
            Some("mini9"),
            "fulcrum.server.slot.provision.mini9",
            &Message::RuntimeInfoRequest(models::RuntimeInfoRequest::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, bus::Error::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() <= Duration::from_secs(5) + Duration::from_millis(50));
}

#[tokio::test]
async fn a_blocked_subscriber_does_not_stall_its_peers() {
    let hub = MemoryHub::new();
    let publisher = Bus::in_memory(&hub, &BusConfig::new("publisher"));
    let slow = Bus::in_memory(&hub, &BusConfig::new("slow"));
    let fast = Bus::in_memory(&hub, &BusConfig::new("fast"));

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let gate_clone = gate.clone();
    slow.subscribe(
        "fulcrum.test.fanout",
        handler(move |_envelope| {
            let gate = gate_clone.clone();
            async move {
                // Park until the test releases us.
                let _permit = gate.acquire().await.unwrap();
            }
        }),
    );

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    fast.subscribe(
        "fulcrum.test.fanout",
        handler(move |_envelope| {
            let tx = tx.clone();
            async move {
                tx.send(()).unwrap();
            }
        }),
    );

    publisher.publish("fulcrum.test.fanout", &heartbeat(1)).unwrap();

    // The fast subscriber completes while the slow one is still parked.
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("fast subscriber was stalled by the slow one")
        .unwrap();
    gate.add_permits(1);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let hub = MemoryHub::new();
    let publisher = Bus::in_memory(&hub, &BusConfig::new("publisher"));
    let subscriber = Bus::in_memory(&hub, &BusConfig::new("subscriber"));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let token = subscriber.subscribe(
        "fulcrum.test.unsub",
        handler(move |_envelope| {
            let tx = tx.clone();
            async move {
                tx.send(()).unwrap();
            }
        }),
    );

    publisher.publish("fulcrum.test.unsub", &heartbeat(1)).unwrap();
    rx.recv().await.unwrap();

    subscriber.unsubscribe(token);
    publisher.publish("fulcrum.test.unsub", &heartbeat(2)).unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "message delivered after unsubscribe"
    );
}

#[tokio::test]
async fn sender_id_upgrade_applies_to_subsequent_envelopes() {
    let hub = MemoryHub::new();
    let service = Bus::in_memory(&hub, &BusConfig::new("fulcrum-server-temp"));
    let observer = Bus::in_memory(&hub, &BusConfig::new("observer"));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    observer.subscribe(
        "fulcrum.test.identity",
        handler(move |envelope| {
            let tx = tx.clone();
            async move {
                tx.send(envelope.sender_id).unwrap();
            }
        }),
    );

    service.publish("fulcrum.test.identity", &heartbeat(1)).unwrap();
    service.set_sender_id("mini1");
    service.publish("fulcrum.test.identity", &heartbeat(2)).unwrap();

    assert_eq!(rx.recv().await.unwrap(), "fulcrum-server-temp");
    assert_eq!(rx.recv().await.unwrap(), "mini1");
}
