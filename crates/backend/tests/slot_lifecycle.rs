use std::sync::Arc;
use std::time::Duration;

use backend::{BackendConfig, LocalWorlds, SlotOrchestrator, WorldProvisioner};
use bus::{handler, Bus, BusConfig, MemoryHub};
use envelope::Message;
use models::{channels, FamilyId, ServiceRole, SlotState, VariantId};
use pretty_assertions::assert_eq;
use service::{Context, ServiceIdentity};

fn config(max_slots: u32) -> BackendConfig {
    serde_json::from_value(serde_json::json!({
        "idFamily": "mini",
        "maxPlayers": 80,
        "families": [{
            "familyId": "skywars",
            "maxSlots": max_slots,
            "variants": {
                "duos": {"maxOccupants": 2},
                "solos": {"maxOccupants": 1}
            }
        }]
    }))
    .unwrap()
}

struct Fixture {
    hub: MemoryHub,
    orchestrator: Arc<SlotOrchestrator>,
    _subscriptions: Vec<bus::SubscriptionToken>,
}

fn fixture_with(worlds: Arc<dyn WorldProvisioner>, max_slots: u32) -> Fixture {
    let hub = MemoryHub::new();

    let mut identity = ServiceIdentity::generate(ServiceRole::Server, "mini", "10.0.0.7:25001", "1.0.0");
    identity.permanent_id = Some("mini1".into());
    let bus = Bus::in_memory(&hub, &BusConfig::new("mini1"));
    let ctx = Context::new(bus, identity);

    let orchestrator = SlotOrchestrator::new(ctx, config(max_slots), worlds);
    let subscriptions = orchestrator.install();
    Fixture {
        hub,
        orchestrator,
        _subscriptions: subscriptions,
    }
}

fn fixture() -> Fixture {
    fixture_with(Arc::new(LocalWorlds), 4)
}

fn provision_request(variant: &str) -> Message {
    Message::SlotProvisionRequest(models::SlotProvisionRequest {
        family_id: "skywars".into(),
        variant_id: variant.into(),
        requested_by: "proxy1".into(),
        metadata: serde_json::Value::Null,
    })
}

async fn provision(proxy: &Bus, variant: &str) -> models::SlotProvisionResponse {
    let response = proxy
        .request(
            Some("mini1"),
            &channels::slot_provision(&"mini1".into()),
            &provision_request(variant),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let Ok(Message::SlotProvisionResponse(response)) = response.message() else {
        panic!("unexpected response");
    };
    response
}

#[tokio::test]
async fn provision_happy_path_reports_ready_and_advertises() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    let statuses: Arc<std::sync::Mutex<Vec<models::SlotStatusUpdate>>> = Default::default();
    let ads: Arc<std::sync::Mutex<Vec<models::FamilyAdvertisement>>> = Default::default();
    let observer = Bus::in_memory(&fx.hub, &BusConfig::new("observer"));
    {
        let statuses = statuses.clone();
        observer.subscribe(
            channels::SLOT_STATUS,
            handler(move |envelope| {
                let statuses = statuses.clone();
                async move {
                    if let Ok(Message::SlotStatus(update)) = envelope.message() {
                        statuses.lock().unwrap().push(update);
                    }
                }
            }),
        );
    }
    {
        let ads = ads.clone();
        observer.subscribe(
            channels::SLOT_FAMILY_ADVERTISEMENT,
            handler(move |envelope| {
                let ads = ads.clone();
                async move {
                    if let Ok(Message::FamilyAdvertisement(ad)) = envelope.message() {
                        ads.lock().unwrap().push(ad);
                    }
                }
            }),
        );
    }

    let response = provision(&proxy, "duos").await;
    assert!(response.success);
    assert_eq!(response.slot_id, Some("mini1-s1".into()));
    assert_eq!(response.state, Some(SlotState::Ready));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let statuses = statuses.lock().unwrap().clone();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].server_id, "mini1".into());
    assert_eq!(statuses[0].slot.slot_id, "mini1-s1".into());
    assert_eq!(statuses[0].slot.state, SlotState::Ready);

    let ads = ads.lock().unwrap().clone();
    assert_eq!(ads.len(), 1);
    assert_eq!(ads[0].family_id, "skywars".into());
    assert_eq!(ads[0].capacity.active_slots, 1);
    assert_eq!(ads[0].capacity.max_slots, 4);
}

#[tokio::test]
async fn unsupported_variants_and_unknown_families_are_rejected() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    let response = provision(&proxy, "quads").await;
    assert!(!response.success);
    assert!(response.reason.unwrap().contains("unsupported variant"));

    let response = proxy
        .request(
            Some("mini1"),
            &channels::slot_provision(&"mini1".into()),
            &Message::SlotProvisionRequest(models::SlotProvisionRequest {
                family_id: "bedwars".into(),
                variant_id: "duos".into(),
                requested_by: "proxy1".into(),
                metadata: serde_json::Value::Null,
            }),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let Ok(Message::SlotProvisionResponse(response)) = response.message() else {
        panic!("unexpected response");
    };
    assert!(!response.success);
    assert!(response.reason.unwrap().contains("unknown family"));
}

#[tokio::test]
async fn capacity_exhaustion_rejects_further_provisions() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    for n in 1..=4u32 {
        let response = provision(&proxy, "duos").await;
        assert!(response.success);
        assert_eq!(response.slot_id, Some(format!("mini1-s{n}").as_str().into()));
    }

    let response = provision(&proxy, "duos").await;
    assert!(!response.success);
    assert_eq!(response.reason.as_deref(), Some("capacity"));
    let _ = &fx.orchestrator;
}

/// Holds world creation until released, to observe queueing behavior.
struct GatedWorlds(tokio::sync::Semaphore);

#[async_trait::async_trait]
impl WorldProvisioner for GatedWorlds {
    async fn create(
        &self,
        family: &FamilyId,
        variant: &VariantId,
        slot_id: &models::SlotId,
    ) -> Result<String, String> {
        let permit = self.0.acquire().await.map_err(|_| "gate closed".to_string())?;
        permit.forget();
        Ok(format!("{family}-{variant}-{slot_id}"))
    }
}

#[tokio::test]
async fn provision_queue_is_fifo_and_bounded() {
    let gate = Arc::new(GatedWorlds(tokio::sync::Semaphore::new(0)));
    let fx = fixture_with(gate.clone(), 50);
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    // One provision in flight plus a full queue.
    let mut waiting = Vec::new();
    for _ in 0..17 {
        let proxy = proxy.clone();
        waiting.push(tokio::spawn(async move { provision(&proxy, "duos").await }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The eighteenth is rejected immediately.
    let rejected = provision(&proxy, "duos").await;
    assert!(!rejected.success);
    assert_eq!(rejected.reason.as_deref(), Some("capacity"));

    // Release the gate: every queued provision completes, in FIFO order.
    gate.0.add_permits(17);
    let mut slot_ids = Vec::new();
    for task in waiting {
        let response = task.await.unwrap();
        assert!(response.success);
        slot_ids.push(response.slot_id.unwrap().to_string());
    }
    let expected: Vec<String> = (1..=17).map(|n| format!("mini1-s{n}")).collect();
    assert_eq!(slot_ids, expected);
}

#[tokio::test(start_paused = true)]
async fn idle_slots_drain_and_close_after_the_timeout() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    let statuses: Arc<std::sync::Mutex<Vec<(models::SlotId, SlotState)>>> = Default::default();
    let observer = Bus::in_memory(&fx.hub, &BusConfig::new("observer"));
    {
        let statuses = statuses.clone();
        observer.subscribe(
            channels::SLOT_STATUS,
            handler(move |envelope| {
                let statuses = statuses.clone();
                async move {
                    if let Ok(Message::SlotStatus(update)) = envelope.message() {
                        statuses
                            .lock()
                            .unwrap()
                            .push((update.slot.slot_id, update.slot.state));
                    }
                }
            }),
        );
    }

    let mut scheduler = service::tick::Scheduler::new();
    fx.orchestrator.register_ticks(&mut scheduler);
    let ticks = scheduler.spawn();

    let response = provision(&proxy, "duos").await;
    let slot_id = response.slot_id.unwrap();

    // A player passing through resets the idle clock.
    tokio::time::sleep(Duration::from_secs(100)).await;
    fx.orchestrator
        .player_joined(&slot_id, "alice".into())
        .unwrap();
    fx.orchestrator.player_left(&slot_id, &"alice".into());

    // Not yet expired at +300s from the last activity.
    tokio::time::sleep(Duration::from_secs(295)).await;
    assert_eq!(fx.orchestrator.occupant_count(), 0);
    let seen: Vec<SlotState> = statuses.lock().unwrap().iter().map(|(_, s)| *s).collect();
    assert!(!seen.contains(&SlotState::Draining));

    // Expired shortly after.
    tokio::time::sleep(Duration::from_secs(12)).await;
    let seen = statuses.lock().unwrap().clone();
    let tail: Vec<SlotState> = seen.iter().rev().take(2).map(|(_, s)| *s).rev().collect();
    assert_eq!(tail, vec![SlotState::Draining, SlotState::Closed]);
    ticks.abort();
}

#[tokio::test]
async fn occupancy_is_bounded_by_the_variant() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    let slot_id = provision(&proxy, "duos").await.slot_id.unwrap();
    fx.orchestrator.player_joined(&slot_id, "alice".into()).unwrap();
    fx.orchestrator.player_joined(&slot_id, "bob".into()).unwrap();

    let err = fx
        .orchestrator
        .player_joined(&slot_id, "carol".into())
        .unwrap_err();
    assert!(matches!(err, backend::JoinError::SlotFull(_)));
    assert_eq!(fx.orchestrator.occupant_count(), 2);
}

#[tokio::test]
async fn shared_world_routing_packs_the_fullest_slot() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    let first = provision(&proxy, "duos").await.slot_id.unwrap();
    let second = provision(&proxy, "duos").await.slot_id.unwrap();
    fx.orchestrator.player_joined(&first, "alice".into()).unwrap();

    let placed = fx
        .orchestrator
        .accept_player(&models::PlayerRoute {
            player_id: "bob".into(),
            family_id: "skywars".into(),
            slot_id: None,
        })
        .unwrap();
    assert_eq!(placed, first);

    // The fullest slot is now full; the next player lands in the other.
    let placed = fx
        .orchestrator
        .accept_player(&models::PlayerRoute {
            player_id: "carol".into(),
            family_id: "skywars".into(),
            slot_id: None,
        })
        .unwrap();
    assert_eq!(placed, second);
}

#[tokio::test]
async fn drain_all_closes_everything_and_reports_the_affected() {
    let fx = fixture();
    let proxy = Bus::in_memory(&fx.hub, &BusConfig::new("proxy1"));

    let slot_id = provision(&proxy, "duos").await.slot_id.unwrap();
    fx.orchestrator.player_joined(&slot_id, "alice".into()).unwrap();

    let mut affected = fx.orchestrator.drain_all();
    affected.sort();
    assert_eq!(affected, vec![models::PlayerId::from("alice")]);
    assert_eq!(fx.orchestrator.occupant_count(), 0);

    // Capacity is free again.
    let response = provision(&proxy, "duos").await;
    assert!(response.success);
}
