use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use bus::{handler, Bus, BusConfig, MemoryHub};
use envelope::Message;
use models::{
    channels, DirectoryRecord, FamilyCapacity, LoadMetrics, PlayerRouteCommand, ServiceRole,
    ServiceStatus,
};
use pretty_assertions::assert_eq;
use proxy::{PlayerTransport, ProxyDrain, RouteDispatcher, RouteError};
use service::shutdown::DrainTarget;
use service::{Context, ServiceIdentity};

struct RecordingTransport(Mutex<Vec<PlayerRouteCommand>>);

#[async_trait::async_trait]
impl PlayerTransport for RecordingTransport {
    async fn transfer(&self, command: PlayerRouteCommand) -> Result<(), String> {
        self.0.lock().unwrap().push(command);
        Ok(())
    }
}

struct Fixture {
    hub: MemoryHub,
    ctx: Context,
    dispatcher: Arc<RouteDispatcher>,
    transport: Arc<RecordingTransport>,
}

fn fixture() -> Fixture {
    let hub = MemoryHub::new();
    let mut identity = ServiceIdentity::generate(ServiceRole::Proxy, "proxy", "edge:25565", "1.0.0");
    identity.permanent_id = Some("proxy1".into());
    let bus = Bus::in_memory(&hub, &BusConfig::new("proxy1"));
    let ctx = Context::new(bus, identity);

    let transport = Arc::new(RecordingTransport(Mutex::new(Vec::new())));
    let dispatcher = RouteDispatcher::new(ctx.clone(), transport.clone());
    Fixture {
        hub,
        ctx,
        dispatcher,
        transport,
    }
}

fn backend_record(id: &str, player_count: u32, tps: f64, heartbeat_at: i64) -> DirectoryRecord {
    DirectoryRecord {
        id: id.into(),
        role: ServiceRole::Server,
        address: format!("10.0.0.{id}:25001", id = &id[4..]),
        status: ServiceStatus::Available,
        load: LoadMetrics {
            player_count,
            max_players: 50,
            tps,
            response_time: 0,
        },
        last_heartbeat_at: heartbeat_at,
        capabilities: BTreeSet::new(),
        families: BTreeMap::from([(
            "skywars".into(),
            FamilyCapacity {
                max_slots: 4,
                active_slots: 0,
                variants: BTreeSet::from(["duos".into()]),
            },
        )]),
    }
}

/// A backend stand-in that answers provision requests on its channel.
fn fake_backend(hub: &MemoryHub, id: &str, accept: bool) -> Bus {
    let bus = Bus::in_memory(hub, &BusConfig::new(id));
    let bus_clone = bus.clone();
    let id = id.to_string();
    bus.subscribe(
        &channels::slot_provision(&id.as_str().into()),
        handler(move |envelope| {
            let bus = bus_clone.clone();
            let id = id.clone();
            async move {
                let response = if accept {
                    models::SlotProvisionResponse {
                        success: true,
                        slot_id: Some(format!("{id}-s1").as_str().into()),
                        state: Some(models::SlotState::Ready),
                        reason: None,
                    }
                } else {
                    models::SlotProvisionResponse {
                        success: false,
                        slot_id: None,
                        state: None,
                        reason: Some("capacity".to_string()),
                    }
                };
                bus.respond(&envelope, &Message::SlotProvisionResponse(response))
                    .unwrap();
            }
        }),
    );
    bus
}

#[tokio::test]
async fn routing_picks_the_lowest_load_score() {
    let fx = fixture();
    // mini1 scores 0.14, mini2 ≈ 0.575; mini1 must win.
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini1", 10, 20.0, 0),
        }),
        0,
    );
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini2", 40, 19.0, 0),
        }),
        0,
    );
    let _mini1 = fake_backend(&fx.hub, "mini1", true);
    let _mini2 = fake_backend(&fx.hub, "mini2", true);

    let assignment = fx
        .dispatcher
        .route_new_slot(
            "alice".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();

    assert_eq!(assignment.backend_id, "mini1".into());
    assert_eq!(assignment.slot_id, Some("mini1-s1".into()));
    assert_eq!(assignment.proxy_id, "proxy1".into());

    let commands = fx.transport.0.lock().unwrap().clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].player_id, "alice".into());
    assert_eq!(commands[0].target_address, "10.0.0.1:25001");
}

#[tokio::test]
async fn rejection_falls_through_to_the_next_candidate() {
    let fx = fixture();
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini1", 0, 20.0, 0),
        }),
        0,
    );
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini2", 40, 20.0, 0),
        }),
        0,
    );
    // The preferred candidate refuses, the loaded one accepts.
    let _mini1 = fake_backend(&fx.hub, "mini1", false);
    let _mini2 = fake_backend(&fx.hub, "mini2", true);

    let assignment = fx
        .dispatcher
        .route_new_slot(
            "alice".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(assignment.backend_id, "mini2".into());
}

#[tokio::test(start_paused = true)]
async fn a_silent_candidate_times_out_and_the_next_is_tried() {
    let fx = fixture();
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini1", 0, 20.0, 0),
        }),
        0,
    );
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini2", 40, 20.0, 0),
        }),
        0,
    );
    // mini1 never answers; only mini2 is listening.
    let _mini2 = fake_backend(&fx.hub, "mini2", true);

    let assignment = fx
        .dispatcher
        .route_new_slot(
            "alice".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();
    assert_eq!(assignment.backend_id, "mini2".into());
}

#[tokio::test]
async fn exhausting_every_candidate_is_a_capacity_error() {
    let fx = fixture();
    for id in ["mini1", "mini2", "mini3"] {
        fx.ctx.directory.apply(
            &Message::ServerAdded(models::ServiceAdded {
                record: backend_record(id, 0, 20.0, 0),
            }),
            0,
        );
    }
    let _backends: Vec<Bus> = ["mini1", "mini2", "mini3"]
        .iter()
        .map(|id| fake_backend(&fx.hub, id, false))
        .collect();

    let err = fx
        .dispatcher
        .route_new_slot(
            "alice".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RouteError::NoCapacity));
    // The reason a player actually sees.
    assert_eq!(err.to_string(), "no available capacity");
}

#[tokio::test]
async fn a_player_holds_at_most_one_assignment() {
    let fx = fixture();
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini1", 0, 20.0, 0),
        }),
        0,
    );
    let _mini1 = fake_backend(&fx.hub, "mini1", true);

    fx.dispatcher
        .route_new_slot(
            "alice".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap();

    let err = fx
        .dispatcher
        .route_new_slot(
            "alice".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::AlreadyRouted(_)));

    // Releasing on disconnect frees the player for a new route.
    fx.dispatcher.release(&"alice".into()).unwrap();
    assert!(fx.dispatcher.assignment_of(&"alice".into()).is_none());
}

#[tokio::test]
async fn eviction_transfers_players_to_the_least_loaded_proxy() {
    let fx = fixture();
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini1", 0, 20.0, 0),
        }),
        0,
    );
    let _mini1 = fake_backend(&fx.hub, "mini1", true);

    // Two alternate proxies; proxy3 is the emptier one.
    for (id, players) in [("proxy2", 400), ("proxy3", 10)] {
        let mut record = backend_record(id, players, 20.0, 0);
        record.role = ServiceRole::Proxy;
        record.address = format!("{id}.edge:25565");
        record.families.clear();
        record.load.max_players = 500;
        fx.ctx
            .directory
            .apply(&Message::ProxyAdded(models::ServiceAdded { record }), 0);
    }

    for player in ["alice", "bob"] {
        fx.dispatcher
            .route_new_slot(
                player.into(),
                &"skywars".into(),
                &"duos".into(),
                serde_json::Value::Null,
            )
            .await
            .unwrap();
    }
    fx.transport.0.lock().unwrap().clear();

    let drain = ProxyDrain(fx.dispatcher.clone());
    let mut affected = drain.evict(&fx.ctx.directory).await;
    affected.sort();
    assert_eq!(
        affected,
        vec![models::PlayerId::from("alice"), models::PlayerId::from("bob")]
    );

    let commands = fx.transport.0.lock().unwrap().clone();
    assert_eq!(commands.len(), 2);
    assert!(commands
        .iter()
        .all(|command| command.target_address == "proxy3.edge:25565"));
    assert!(fx.dispatcher.connected_players().is_empty());

    // Draining proxies refuse new routes.
    drain.stop().await;
    let err = fx
        .dispatcher
        .route_new_slot(
            "carol".into(),
            &"skywars".into(),
            &"duos".into(),
            serde_json::Value::Null,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouteError::Draining));
}

#[tokio::test]
async fn shared_world_routing_instructs_the_backend_directly() {
    let fx = fixture();
    fx.ctx.directory.apply(
        &Message::ServerAdded(models::ServiceAdded {
            record: backend_record("mini1", 0, 20.0, 0),
        }),
        0,
    );

    // The backend listens on its direct channel for route instructions.
    let backend = Bus::in_memory(&fx.hub, &BusConfig::new("mini1"));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    backend.subscribe(
        &channels::direct(ServiceRole::Server, &"mini1".into()),
        handler(move |envelope| {
            let tx = tx.clone();
            async move {
                if let Ok(Message::PlayerRoute(route)) = envelope.message() {
                    tx.send(route).unwrap();
                }
            }
        }),
    );

    let assignment = fx
        .dispatcher
        .route_shared("alice".into(), &"skywars".into())
        .await
        .unwrap();
    assert_eq!(assignment.backend_id, "mini1".into());
    assert_eq!(assignment.slot_id, None);

    let route = rx.recv().await.unwrap();
    assert_eq!(route.player_id, "alice".into());
    assert_eq!(route.family_id, "skywars".into());

    // The transfer went to the backend's address, with no specific slot.
    let commands = fx.transport.0.lock().unwrap().clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].target_address, "10.0.0.1:25001");
    assert_eq!(commands[0].slot_id, None);
}
