//! The registry: the singleton authority over permanent ids, the service
//! directory, liveness, the environment directory, and shutdown intents.
//! Everything arrives and leaves over the bus; the reaper is the only
//! other mutator of directory state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope::{Envelope, Message};
use models::{
    channels, ServiceId, ServiceRole, ServiceStatus, SlotId, SlotSnapshot, TempId,
};

mod directory;
mod environments;
mod ids;
mod reaper;
mod shutdown;

pub use directory::{Directory, Entry};
pub use environments::{EnvironmentDirectory, EnvironmentsError};
pub use ids::IdAllocator;
pub use shutdown::{IssueError, ShutdownLedger};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `T_hb` the fleet heartbeats at; staleness thresholds derive from it.
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    /// How long a dead entry keeps its id reserved for re-registration.
    pub grace_window: Duration,
    /// How long to collect identities after a `reregister` broadcast.
    pub collection_window: Duration,
    /// Backing file of the environment directory, re-read periodically.
    pub environments_path: Option<std::path::PathBuf>,
    pub environments_refresh: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            reaper_interval: Duration::from_secs(1),
            grace_window: Duration::from_secs(60),
            collection_window: Duration::from_secs(2),
            environments_path: None,
            environments_refresh: Duration::from_secs(30),
        }
    }
}

impl RegistryConfig {
    /// Staleness beyond which an available entry turns unavailable.
    pub fn unavailable_after(&self) -> Duration {
        3 * self.heartbeat_interval
    }

    /// Staleness beyond which an entry is declared dead.
    pub fn dead_after(&self) -> Duration {
        6 * self.heartbeat_interval
    }
}

pub struct Registry {
    pub(crate) bus: bus::Bus,
    pub(crate) config: RegistryConfig,
    pub directory: Directory,
    pub(crate) ids: IdAllocator,
    pub environments: EnvironmentDirectory,
    pub shutdowns: ShutdownLedger,
    /// Per-backend slot view, folded from `slot.status` reports.
    pub(crate) slots: Mutex<BTreeMap<ServiceId, BTreeMap<SlotId, SlotSnapshot>>>,
}

impl Registry {
    pub fn new(bus: bus::Bus, config: RegistryConfig, environments: EnvironmentDirectory) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            directory: Directory::default(),
            ids: IdAllocator::default(),
            environments,
            shutdowns: ShutdownLedger::default(),
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    /// Subscribe every channel the registry serves.
    pub fn install(self: &Arc<Self>) -> Vec<bus::SubscriptionToken> {
        let subscriptions: Vec<(&str, fn(&Arc<Self>, Envelope))> = vec![
            (channels::REGISTRATION_REQUEST, Self::handle_registration),
            (channels::SERVER_HEARTBEAT, Self::handle_heartbeat),
            (channels::PROXY_HEARTBEAT, Self::handle_heartbeat),
            (channels::SLOT_FAMILY_ADVERTISEMENT, Self::handle_advertisement),
            (channels::SLOT_STATUS, Self::handle_slot_status),
            (channels::SHUTDOWN_UPDATE, Self::handle_shutdown_update),
            (channels::SHUTDOWN_REQUEST, Self::handle_shutdown_request),
            (channels::RUNTIME_INFO, Self::handle_runtime_info),
            (channels::ENVIRONMENTS, Self::handle_environments),
        ];

        subscriptions
            .into_iter()
            .map(|(channel, handle)| {
                let this = self.clone();
                self.bus.subscribe(
                    channel,
                    bus::handler(move |envelope| {
                        let this = this.clone();
                        async move { handle(&this, envelope) }
                    }),
                )
            })
            .collect()
    }

    /// Register the liveness reaper and the environment-directory refresh
    /// on the shared scheduler.
    pub fn register_ticks(self: &Arc<Self>, scheduler: &mut service::tick::Scheduler) {
        let this = self.clone();
        scheduler.register("reaper", self.config.reaper_interval, move || {
            let this = this.clone();
            async move { this.reap() }
        });

        if self.config.environments_path.is_some() {
            let this = self.clone();
            scheduler.register("environments", self.config.environments_refresh, move || {
                let this = this.clone();
                async move { this.refresh_environments() }
            });
        }

        let this = self.clone();
        scheduler.register("bus-metrics", Duration::from_secs(60), move || {
            let this = this.clone();
            async move {
                tracing::debug!(metrics = ?this.bus.metrics(), "bus counters");
            }
        });
    }

    /// Re-read the environment directory's backing file; broadcast the new
    /// revision token when the contents changed.
    pub fn refresh_environments(&self) {
        let Some(path) = &self.config.environments_path else {
            return;
        };
        match self.environments.reload(path) {
            Ok(Some(revision)) => {
                tracing::info!(revision, "environment directory changed");
                let message =
                    Message::EnvironmentsRevision(models::EnvironmentsRevision { revision });
                if let Err(err) = self.bus.publish(channels::ENVIRONMENTS_REVISION, &message) {
                    tracing::warn!(error = %err, "failed to broadcast the environments revision");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to refresh the environment directory");
            }
        }
    }

    /// After a registry restart: ask the fleet to re-submit identities and
    /// hold the snapshot open for the collection window.
    pub async fn announce_restart(&self) -> Result<usize, bus::Error> {
        self.bus.publish(
            channels::REGISTRATION_REREGISTER,
            &Message::Reregister(models::ReregisterRequest::default()),
        )?;
        tokio::time::sleep(self.config.collection_window).await;
        let services = self.directory.len();
        tracing::info!(services, "re-registration collection window closed");
        Ok(services)
    }

    fn handle_registration(self: &Arc<Self>, envelope: Envelope) {
        let request = match envelope.message() {
            Ok(Message::RegistrationRequest(request)) => request,
            Ok(other) => {
                tracing::warn!(message_type = other.message_type(), "unexpected message on the registration channel");
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable registration request");
                return;
            }
        };

        let assigned = self.resolve_id(&request);
        let entry = self.directory.insert(
            assigned.clone(),
            Entry::new(
                request.role,
                request.address.clone(),
                request.capabilities.clone(),
                request.families.clone(),
            ),
        );
        tracing::info!(
            id = %assigned,
            role = %request.role,
            address = %request.address,
            "service registered"
        );

        let response = Message::RegistrationResponse(models::RegistrationResponse {
            success: true,
            assigned_server_id: Some(assigned.clone()),
            reason: None,
        });
        let response_channel =
            channels::registration_response(&TempId::new(envelope.sender_id.clone()));
        if let Err(err) = self
            .bus
            .send(&envelope.sender_id, &response_channel, &response)
        {
            tracing::warn!(error = %err, "failed to send a registration response");
        }

        let added = models::ServiceAdded {
            record: entry.record(&assigned),
        };
        let broadcast = match request.role {
            ServiceRole::Server => Some((channels::SERVER_ADDED, Message::ServerAdded(added))),
            ServiceRole::Proxy => Some((channels::PROXY_ADDED, Message::ProxyAdded(added))),
            ServiceRole::Limbo | ServiceRole::Registry => None,
        };
        if let Some((channel, message)) = broadcast {
            if let Err(err) = self.bus.publish(channel, &message) {
                tracing::warn!(error = %err, "failed to announce a new service");
            }
        }
    }

    /// Pick the permanent id for a registration. A claimed id is honored
    /// when it matches the known entry or is free to reserve; contention
    /// resolves to a fresh id, which the sender adopts transparently.
    fn resolve_id(&self, request: &models::RegistrationRequest) -> ServiceId {
        if let Some(claimed) = &request.permanent_id {
            if let Some(entry) = self.directory.get(claimed) {
                if entry.address == request.address && entry.role == request.role {
                    return claimed.clone();
                }
                tracing::warn!(
                    id = %claimed,
                    holder = %entry.address,
                    claimant = %request.address,
                    "id conflict during re-registration, assigning a fresh id"
                );
                return self.ids.assign(&request.family);
            }
            if self.ids.reserve(claimed) {
                return claimed.clone();
            }
            tracing::warn!(id = %claimed, "claimed id is already reserved, assigning a fresh one");
        }
        self.ids.assign(&request.family)
    }

    fn handle_heartbeat(self: &Arc<Self>, envelope: Envelope) {
        let beat = match envelope.message() {
            Ok(Message::Heartbeat(beat)) => beat,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable heartbeat");
                return;
            }
        };

        let Some(entry) = self.directory.get(&beat.id) else {
            // A fleet member we do not know, likely because this registry
            // restarted. A directed re-register keeps its id valid.
            tracing::debug!(id = %beat.id, "heartbeat from an unknown service, requesting re-registration");
            let _ = self.bus.send(
                beat.id.as_str(),
                channels::REGISTRATION_REREGISTER,
                &Message::Reregister(models::ReregisterRequest::default()),
            );
            return;
        };

        if entry.status() == ServiceStatus::Dead {
            // Dead entries recover only through re-registration.
            let _ = self.bus.send(
                beat.id.as_str(),
                channels::REGISTRATION_REREGISTER,
                &Message::Reregister(models::ReregisterRequest::default()),
            );
            return;
        }

        if let Some((previous, status)) = entry.observe_heartbeat(&beat) {
            self.broadcast_status(&beat.id, &entry, previous, status);
        }
    }

    fn handle_advertisement(self: &Arc<Self>, envelope: Envelope) {
        let ad = match envelope.message() {
            Ok(Message::FamilyAdvertisement(ad)) => ad,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable family advertisement");
                return;
            }
        };

        let Some(entry) = self.directory.get(&ad.server_id) else {
            tracing::debug!(id = %ad.server_id, "advertisement from an unknown backend");
            return;
        };

        let mut capacity = ad.capacity.clone();
        if capacity.active_slots > capacity.max_slots {
            tracing::warn!(
                id = %ad.server_id,
                family = %ad.family_id,
                active = capacity.active_slots,
                max = capacity.max_slots,
                "advertisement exceeds its own capacity, clamping"
            );
            capacity.active_slots = capacity.max_slots;
        }
        entry.set_family(ad.family_id.clone(), capacity);
    }

    fn handle_slot_status(self: &Arc<Self>, envelope: Envelope) {
        let update = match envelope.message() {
            Ok(Message::SlotStatus(update)) => update,
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable slot status");
                return;
            }
        };

        let mut slots = self.slots.lock().unwrap();
        let server_slots = slots.entry(update.server_id.clone()).or_default();
        if update.slot.state == models::SlotState::Closed {
            server_slots.remove(&update.slot.slot_id);
            if server_slots.is_empty() {
                slots.remove(&update.server_id);
            }
        } else {
            server_slots.insert(update.slot.slot_id.clone(), update.slot);
        }
    }

    fn handle_shutdown_update(self: &Arc<Self>, envelope: Envelope) {
        match envelope.message() {
            Ok(Message::ShutdownUpdate(update)) => self.shutdowns.record_update(&update),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable shutdown update");
            }
        }
    }

    fn handle_shutdown_request(self: &Arc<Self>, envelope: Envelope) {
        let response = match envelope.message() {
            Ok(Message::ShutdownRequest(request)) => {
                match self.shutdowns.issue(
                    &self.bus,
                    request.targets,
                    request.countdown_seconds,
                    request.force,
                    |id| self.directory.contains(id),
                ) {
                    Ok(intent_id) => models::ShutdownResponse {
                        success: true,
                        intent_id: Some(intent_id),
                        reason: None,
                    },
                    Err(err) => models::ShutdownResponse {
                        success: false,
                        intent_id: None,
                        reason: Some(err.to_string()),
                    },
                }
            }
            Ok(Message::ShutdownCancel(cancel)) => {
                match self.shutdowns.cancel(&self.bus, cancel.intent_id) {
                    Ok(()) => models::ShutdownResponse {
                        success: true,
                        intent_id: Some(cancel.intent_id),
                        reason: None,
                    },
                    Err(err) => models::ShutdownResponse {
                        success: false,
                        intent_id: Some(cancel.intent_id),
                        reason: Some(err.to_string()),
                    },
                }
            }
            Ok(_) => return,
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable shutdown request");
                return;
            }
        };

        if let Err(err) = self
            .bus
            .respond(&envelope, &Message::ShutdownResponse(response))
        {
            tracing::warn!(error = %err, "failed to answer a shutdown request");
        }
    }

    fn handle_runtime_info(self: &Arc<Self>, envelope: Envelope) {
        let response = models::RuntimeInfoResponse {
            directory: self.directory.snapshot(),
            slots: self
                .slots
                .lock()
                .unwrap()
                .iter()
                .map(|(id, slots)| (id.clone(), slots.values().cloned().collect()))
                .collect(),
            bus_metrics: serde_json::to_value(self.bus.metrics()).ok(),
        };
        if let Err(err) = self
            .bus
            .respond(&envelope, &Message::RuntimeInfoResponse(response))
        {
            tracing::warn!(error = %err, "failed to answer a runtimeinfo request");
        }
    }

    fn handle_environments(self: &Arc<Self>, envelope: Envelope) {
        let response = Message::EnvironmentsResponse(self.environments.response());
        if let Err(err) = self.bus.respond(&envelope, &response) {
            tracing::warn!(error = %err, "failed to answer an environments request");
        }
    }

    pub(crate) fn broadcast_status(
        &self,
        id: &ServiceId,
        entry: &Entry,
        previous: ServiceStatus,
        status: ServiceStatus,
    ) {
        tracing::info!(%id, ?previous, ?status, "status transition");
        let message = Message::StatusChange(models::StatusChange {
            id: id.clone(),
            previous,
            status,
            load: entry.load(),
        });
        if let Err(err) = self.bus.publish(channels::STATUS_CHANGE, &message) {
            tracing::warn!(error = %err, "failed to broadcast a status change");
        }
    }
}
