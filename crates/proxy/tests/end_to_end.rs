//! Boots a miniature fleet (registry, one backend, one proxy) on the
//! in-memory bus and walks the full path: registration with id
//! assignment, directory broadcasts, slot provisioning, player routing,
//! and the operator's runtime-info view.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backend::{BackendConfig, LocalWorlds, SlotOrchestrator};
use bus::{Bus, BusConfig, MemoryHub};
use envelope::Message;
use models::{channels, ServiceRole, ServiceStatus};
use pretty_assertions::assert_eq;
use proxy::{PlayerTransport, RouteDispatcher};
use registry::{EnvironmentDirectory, Registry, RegistryConfig};
use service::{Context, DirectoryView, RegistrationConfig, ServiceIdentity};

struct RecordingTransport(Mutex<Vec<models::PlayerRouteCommand>>);

#[async_trait::async_trait]
impl PlayerTransport for RecordingTransport {
    async fn transfer(&self, command: models::PlayerRouteCommand) -> Result<(), String> {
        self.0.lock().unwrap().push(command);
        Ok(())
    }
}

fn backend_config() -> BackendConfig {
    serde_json::from_value(serde_json::json!({
        "idFamily": "mini",
        "maxPlayers": 80,
        "families": [{
            "familyId": "skywars",
            "maxSlots": 4,
            "variants": {"duos": {"maxOccupants": 8}}
        }]
    }))
    .unwrap()
}

async fn boot_backend(hub: &MemoryHub) -> (Context, Arc<SlotOrchestrator>) {
    let identity = ServiceIdentity::generate(ServiceRole::Server, "mini", "10.0.0.7:25001", "1.0.0");
    let bus = Bus::in_memory(hub, &BusConfig::new(identity.temp_id.as_str()));
    let ctx = Context::new(bus, identity);
    let _feeds = DirectoryView::install(&ctx);

    let orchestrator = SlotOrchestrator::new(ctx.clone(), backend_config(), Arc::new(LocalWorlds));
    let families = orchestrator.advertised().read().unwrap().clone();
    service::register(&ctx, &families, &RegistrationConfig::default())
        .await
        .unwrap();
    let _subscriptions = orchestrator.install();
    orchestrator.advertise_all();
    (ctx, orchestrator)
}

async fn boot_proxy(hub: &MemoryHub) -> (Context, Arc<RouteDispatcher>, Arc<RecordingTransport>) {
    let identity = ServiceIdentity::generate(ServiceRole::Proxy, "proxy", "edge:25565", "1.0.0");
    let bus = Bus::in_memory(hub, &BusConfig::new(identity.temp_id.as_str()));
    let ctx = Context::new(bus, identity);
    let _feeds = DirectoryView::install(&ctx);

    service::register(&ctx, &BTreeMap::new(), &RegistrationConfig::default())
        .await
        .unwrap();

    let transport = Arc::new(RecordingTransport(Mutex::new(Vec::new())));
    let dispatcher = RouteDispatcher::new(ctx.clone(), transport.clone());
    let _slot_watch = dispatcher.install();
    (ctx, dispatcher, transport)
}

#[tokio::test]
async fn a_player_travels_from_proxy_to_a_fresh_backend_slot() {
    let hub = MemoryHub::new();

    let registry_bus = Bus::in_memory(&hub, &BusConfig::new("registry"));
    let registry = Registry::new(
        registry_bus,
        RegistryConfig::default(),
        EnvironmentDirectory::default(),
    );
    let _registry_subscriptions = registry.install();

    // The proxy boots first so its directory view sees the backend's
    // `server.added` broadcast.
    let (proxy_ctx, dispatcher, transport) = boot_proxy(&hub).await;
    assert_eq!(proxy_ctx.permanent_id(), Some("proxy1".into()));

    let (backend_ctx, _orchestrator) = boot_backend(&hub).await;
    assert_eq!(backend_ctx.permanent_id(), Some("mini1".into()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The proxy's local view now offers the backend for skywars.
    let candidates = proxy_ctx.directory.available_backends(&"skywars".into());
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, "mini1".into());
    assert_eq!(candidates[0].status, ServiceStatus::Available);

    // Route a player into a fresh duos slot.
    let assignment = dispatcher
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

    let commands = transport.0.lock().unwrap().clone();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].target_address, "10.0.0.7:25001");

    // The registry's slot map caught the `slot.status` report, and the
    // refreshed advertisement reached the proxy's view.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let operator = Bus::in_memory(&hub, &BusConfig::new("operator"));
    let response = operator
        .request(
            None,
            channels::RUNTIME_INFO,
            &Message::RuntimeInfoRequest(models::RuntimeInfoRequest::default()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let Ok(Message::RuntimeInfoResponse(info)) = response.message() else {
        panic!("unexpected response");
    };
    assert_eq!(info.directory.len(), 2);
    assert_eq!(info.slots[&"mini1".into()][0].slot_id, "mini1-s1".into());

    let view = proxy_ctx
        .directory
        .get(&"mini1".into())
        .unwrap();
    assert_eq!(view.families[&"skywars".into()].active_slots, 1);
}
