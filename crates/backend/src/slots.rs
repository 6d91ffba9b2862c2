//! The slot orchestrator: advertises family capacity, fulfils provision
//! commands through a bounded FIFO per family, tracks every active slot's
//! lifecycle, and drains idle ones.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use envelope::{Envelope, Message};
use models::{
    channels, FamilyCapacity, FamilyId, PlayerId, ServiceId, SlotId, SlotSnapshot,
    SlotState, VariantId,
};
use service::Context;

use crate::config::{BackendConfig, FamilyConfig};

/// Provision commands queued per family while earlier ones are being
/// fulfilled; beyond this the backend rejects outright.
pub const PROVISION_QUEUE_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("unknown slot {0}")]
    UnknownSlot(SlotId),
    #[error("no ready slot with room in family {0}")]
    NoSharedSlot(FamilyId),
    #[error("slot {0} is not accepting players")]
    NotReady(SlotId),
    #[error("slot {0} is full")]
    SlotFull(SlotId),
}

/// Creates the world and resources behind a slot. The default
/// implementation names a fresh local world; a real game backend plugs
/// its own world loader in here.
#[async_trait::async_trait]
pub trait WorldProvisioner: Send + Sync + 'static {
    async fn create(
        &self,
        family: &FamilyId,
        variant: &VariantId,
        slot_id: &SlotId,
    ) -> Result<String, String>;
}

pub struct LocalWorlds;

#[async_trait::async_trait]
impl WorldProvisioner for LocalWorlds {
    async fn create(
        &self,
        family: &FamilyId,
        variant: &VariantId,
        slot_id: &SlotId,
    ) -> Result<String, String> {
        Ok(format!("{family}-{variant}-{slot_id}"))
    }
}

pub struct ActiveSlot {
    pub slot_id: SlotId,
    pub family_id: FamilyId,
    pub variant_id: VariantId,
    pub occupants: BTreeSet<PlayerId>,
    pub world_name: String,
    pub created_at: i64,
    pub last_activity: tokio::time::Instant,
    pub state: SlotState,
}

impl ActiveSlot {
    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            slot_id: self.slot_id.clone(),
            family_id: self.family_id.clone(),
            variant_id: self.variant_id.clone(),
            state: self.state,
            world_name: self.world_name.clone(),
            occupants: self.occupants.clone(),
            created_at: self.created_at,
        }
    }
}

struct Pending {
    request: models::SlotProvisionRequest,
    envelope: Envelope,
}

struct FamilyState {
    config: FamilyConfig,
    active: BTreeMap<SlotId, ActiveSlot>,
    queue: VecDeque<Pending>,
    in_flight: bool,
}

struct State {
    families: BTreeMap<FamilyId, FamilyState>,
    next_slot: u32,
}

enum Verdict {
    Queued(FamilyId),
    Rejected(Envelope, String),
}

pub struct SlotOrchestrator {
    ctx: Context,
    config: BackendConfig,
    worlds: Arc<dyn WorldProvisioner>,
    state: Mutex<State>,
    /// Mirror of the capacities last advertised, shared with the
    /// registration path so a re-registration carries current numbers.
    advertised: Arc<std::sync::RwLock<BTreeMap<FamilyId, FamilyCapacity>>>,
    stopped: AtomicBool,
}

impl SlotOrchestrator {
    pub fn new(ctx: Context, config: BackendConfig, worlds: Arc<dyn WorldProvisioner>) -> Arc<Self> {
        let families = config
            .families
            .iter()
            .map(|family| {
                (
                    family.family_id.clone(),
                    FamilyState {
                        config: family.clone(),
                        active: BTreeMap::new(),
                        queue: VecDeque::new(),
                        in_flight: false,
                    },
                )
            })
            .collect();

        let this = Arc::new(Self {
            ctx,
            config,
            worlds,
            state: Mutex::new(State {
                families,
                next_slot: 0,
            }),
            advertised: Arc::new(std::sync::RwLock::new(BTreeMap::new())),
            stopped: AtomicBool::new(false),
        });
        this.refresh_advertised();
        this
    }

    /// Capacity mirror handed to the registration machinery.
    pub fn advertised(&self) -> Arc<std::sync::RwLock<BTreeMap<FamilyId, FamilyCapacity>>> {
        self.advertised.clone()
    }

    fn server_id(&self) -> ServiceId {
        self.ctx
            .permanent_id()
            .unwrap_or_else(|| ServiceId::new(self.ctx.bus.sender_id()))
    }

    /// Subscribe the provision channel and the direct channel. Call after
    /// registration, once the permanent id is known.
    pub fn install(self: &Arc<Self>) -> Vec<bus::SubscriptionToken> {
        let id = self.server_id();

        let provision_this = self.clone();
        let provision = self.ctx.bus.subscribe(
            &channels::slot_provision(&id),
            bus::handler(move |envelope| {
                let this = provision_this.clone();
                async move { this.handle_provision(envelope) }
            }),
        );

        // The generic request inbox accepts the same provision commands,
        // for peers that address the service rather than the channel.
        let inbox_this = self.clone();
        let inbox = self.ctx.bus.subscribe(
            &channels::request(&id),
            bus::handler(move |envelope| {
                let this = inbox_this.clone();
                async move { this.handle_provision(envelope) }
            }),
        );

        let direct_this = self.clone();
        let direct = self.ctx.bus.subscribe(
            &channels::direct(models::ServiceRole::Server, &id),
            bus::handler(move |envelope| {
                let this = direct_this.clone();
                async move { this.handle_direct(envelope) }
            }),
        );

        vec![provision, inbox, direct]
    }

    /// One advertisement per configured family, sent right after
    /// registration.
    pub fn advertise_all(&self) {
        let families: Vec<FamilyId> = self.state.lock().unwrap().families.keys().cloned().collect();
        for family in families {
            self.publish_advertisement(&family);
        }
    }

    pub fn register_ticks(self: &Arc<Self>, scheduler: &mut service::tick::Scheduler) {
        let this = self.clone();
        scheduler.register("idle-slots", std::time::Duration::from_secs(5), move || {
            let this = this.clone();
            async move { this.sweep_idle() }
        });
    }

    fn handle_provision(self: &Arc<Self>, envelope: Envelope) {
        let request = match envelope.message() {
            Ok(Message::SlotProvisionRequest(request)) => request,
            Ok(other) => {
                tracing::warn!(
                    message_type = other.message_type(),
                    "unexpected message on the provision channel"
                );
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable provision request");
                return;
            }
        };

        if self.stopped.load(Ordering::Relaxed) {
            self.respond_rejected(&envelope, "shutting down");
            return;
        }

        let verdict = {
            let mut state = self.state.lock().unwrap();
            let Some(family) = state.families.get_mut(&request.family_id) else {
                drop(state);
                self.respond_rejected(&envelope, &format!("unknown family {}", request.family_id));
                return;
            };

            if !family.config.variants.contains_key(&request.variant_id) {
                let reason = format!("unsupported variant {}", request.variant_id);
                Verdict::Rejected(envelope, reason)
            } else if family.active.len() as u32 >= family.config.max_slots {
                Verdict::Rejected(envelope, "capacity".to_string())
            } else if family.queue.len() >= PROVISION_QUEUE_DEPTH {
                Verdict::Rejected(envelope, "capacity".to_string())
            } else {
                let family_id = request.family_id.clone();
                family.queue.push_back(Pending { request, envelope });
                Verdict::Queued(family_id)
            }
        };

        match verdict {
            Verdict::Queued(family_id) => self.drive(family_id),
            Verdict::Rejected(envelope, reason) => self.respond_rejected(&envelope, &reason),
        }
    }

    /// Start the next queued provision for `family_id`, if none is in
    /// flight. Fulfilment is strictly FIFO per family.
    fn drive(self: &Arc<Self>, family_id: FamilyId) {
        let next = {
            let mut state = self.state.lock().unwrap();
            let State {
                families,
                next_slot,
            } = &mut *state;
            let Some(family) = families.get_mut(&family_id) else {
                return;
            };
            if family.in_flight {
                None
            } else {
                match family.queue.pop_front() {
                    Some(pending) => {
                        // Capacity may have been consumed since enqueue.
                        if family.active.len() as u32 >= family.config.max_slots {
                            Some(Err(pending))
                        } else {
                            family.in_flight = true;
                            *next_slot += 1;
                            Some(Ok((pending, *next_slot)))
                        }
                    }
                    None => None,
                }
            }
        };

        match next {
            None => {}
            Some(Err(pending)) => {
                self.respond_rejected(&pending.envelope, "capacity");
                self.drive(family_id);
            }
            Some(Ok((pending, slot_number))) => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.provision(pending, slot_number).await;
                    this.state
                        .lock()
                        .unwrap()
                        .families
                        .get_mut(&family_id)
                        .expect("family exists while a provision is in flight")
                        .in_flight = false;
                    this.drive(family_id);
                });
            }
        }
    }

    async fn provision(self: &Arc<Self>, pending: Pending, slot_number: u32) {
        let server_id = self.server_id();
        let slot_id = SlotId::new(format!("{server_id}-s{slot_number}"));
        let family_id = pending.request.family_id.clone();
        let variant_id = pending.request.variant_id.clone();

        {
            let mut state = self.state.lock().unwrap();
            let family = state
                .families
                .get_mut(&family_id)
                .expect("validated at enqueue");
            family.active.insert(
                slot_id.clone(),
                ActiveSlot {
                    slot_id: slot_id.clone(),
                    family_id: family_id.clone(),
                    variant_id: variant_id.clone(),
                    occupants: BTreeSet::new(),
                    world_name: String::new(),
                    created_at: models::now_ms(),
                    last_activity: tokio::time::Instant::now(),
                    state: SlotState::Provisioning,
                },
            );
        }

        match self.worlds.create(&family_id, &variant_id, &slot_id).await {
            Ok(world_name) => {
                let snapshot = {
                    let mut state = self.state.lock().unwrap();
                    let slot = state
                        .families
                        .get_mut(&family_id)
                        .and_then(|family| family.active.get_mut(&slot_id))
                        .expect("slot inserted above");
                    slot.world_name = world_name;
                    slot.state = SlotState::Ready;
                    slot.snapshot()
                };

                tracing::info!(
                    slot = %slot_id,
                    family = %family_id,
                    variant = %variant_id,
                    requested_by = %pending.request.requested_by,
                    "slot is ready"
                );
                let response = Message::SlotProvisionResponse(models::SlotProvisionResponse {
                    success: true,
                    slot_id: Some(slot_id.clone()),
                    state: Some(SlotState::Ready),
                    reason: None,
                });
                if let Err(err) = self.ctx.bus.respond(&pending.envelope, &response) {
                    tracing::warn!(error = %err, "failed to answer a provision request");
                }
                self.publish_slot_status(snapshot);
                self.publish_advertisement(&family_id);
            }
            Err(reason) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if let Some(family) = state.families.get_mut(&family_id) {
                        family.active.remove(&slot_id);
                    }
                }
                tracing::warn!(
                    slot = %slot_id,
                    family = %family_id,
                    reason,
                    "world creation failed, rejecting the provision"
                );
                self.respond_rejected(&pending.envelope, &reason);
            }
        }
    }

    fn handle_direct(self: &Arc<Self>, envelope: Envelope) {
        match envelope.message() {
            Ok(Message::PlayerRoute(route)) => {
                if let Err(err) = self.accept_player(&route) {
                    tracing::warn!(
                        player = %route.player_id,
                        family = %route.family_id,
                        error = %err,
                        "could not place a routed player"
                    );
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "dropping an undecodable direct message");
            }
        }
    }

    /// Place a routed player into the named slot, or into any ready slot
    /// of the family with room.
    pub fn accept_player(&self, route: &models::PlayerRoute) -> Result<SlotId, JoinError> {
        let slot_id = match &route.slot_id {
            Some(slot_id) => slot_id.clone(),
            None => self
                .pick_shared_slot(&route.family_id)
                .ok_or_else(|| JoinError::NoSharedSlot(route.family_id.clone()))?,
        };
        self.player_joined(&slot_id, route.player_id.clone())?;
        Ok(slot_id)
    }

    fn pick_shared_slot(&self, family_id: &FamilyId) -> Option<SlotId> {
        let state = self.state.lock().unwrap();
        let family = state.families.get(family_id)?;
        family
            .active
            .values()
            .filter(|slot| {
                slot.state == SlotState::Ready
                    && (slot.occupants.len() as u32)
                        < family.config.variants[&slot.variant_id].max_occupants
            })
            // Pack players together: fullest eligible slot first.
            .max_by_key(|slot| slot.occupants.len())
            .map(|slot| slot.slot_id.clone())
    }

    pub fn player_joined(&self, slot_id: &SlotId, player: PlayerId) -> Result<(), JoinError> {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let (max_occupants, slot) = {
                let family = state
                    .families
                    .values_mut()
                    .find(|family| family.active.contains_key(slot_id))
                    .ok_or_else(|| JoinError::UnknownSlot(slot_id.clone()))?;
                let max = family.config.variants
                    [&family.active[slot_id].variant_id]
                    .max_occupants;
                (max, family.active.get_mut(slot_id).expect("checked above"))
            };

            if slot.state != SlotState::Ready {
                return Err(JoinError::NotReady(slot_id.clone()));
            }
            if slot.occupants.len() as u32 >= max_occupants {
                return Err(JoinError::SlotFull(slot_id.clone()));
            }
            slot.occupants.insert(player);
            slot.last_activity = tokio::time::Instant::now();
            slot.snapshot()
        };
        self.publish_slot_status(snapshot);
        Ok(())
    }

    pub fn player_left(&self, slot_id: &SlotId, player: &PlayerId) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let Some(slot) = state
                .families
                .values_mut()
                .find_map(|family| family.active.get_mut(slot_id))
            else {
                return;
            };
            slot.occupants.remove(player);
            slot.last_activity = tokio::time::Instant::now();
            slot.snapshot()
        };
        self.publish_slot_status(snapshot);
    }

    /// Close empty slots whose idle time exceeded the policy.
    fn sweep_idle(&self) {
        let now = tokio::time::Instant::now();
        let mut closed: Vec<SlotSnapshot> = Vec::new();
        let mut touched_families: BTreeSet<FamilyId> = BTreeSet::new();

        {
            let mut state = self.state.lock().unwrap();
            for family in state.families.values_mut() {
                let expired: Vec<SlotId> = family
                    .active
                    .values()
                    .filter(|slot| {
                        slot.state == SlotState::Ready
                            && slot.occupants.is_empty()
                            && now.saturating_duration_since(slot.last_activity)
                                > self.config.idle_timeout
                    })
                    .map(|slot| slot.slot_id.clone())
                    .collect();

                for slot_id in expired {
                    let mut slot = family.active.remove(&slot_id).expect("listed above");
                    slot.state = SlotState::Draining;
                    closed.push(slot.snapshot());
                    slot.state = SlotState::Closed;
                    closed.push(slot.snapshot());
                    touched_families.insert(family.config.family_id.clone());
                }
            }
        }

        for snapshot in closed {
            tracing::info!(slot = %snapshot.slot_id, state = ?snapshot.state, "idle slot wound down");
            self.publish_slot_status(snapshot);
        }
        for family in touched_families {
            self.publish_advertisement(&family);
        }
    }

    /// Drain every slot immediately. Returns all affected players.
    pub fn drain_all(&self) -> Vec<PlayerId> {
        let (updates, affected, families) = {
            let mut state = self.state.lock().unwrap();
            let mut updates = Vec::new();
            let mut affected = Vec::new();
            let mut families = BTreeSet::new();

            for family in state.families.values_mut() {
                family.queue.clear();
                let slots: Vec<SlotId> = family.active.keys().cloned().collect();
                for slot_id in slots {
                    let mut slot = family.active.remove(&slot_id).expect("listed above");
                    affected.extend(slot.occupants.iter().cloned());
                    slot.state = SlotState::Draining;
                    updates.push(slot.snapshot());
                    slot.occupants.clear();
                    slot.state = SlotState::Closed;
                    updates.push(slot.snapshot());
                }
                families.insert(family.config.family_id.clone());
            }
            (updates, affected, families)
        };

        for snapshot in updates {
            self.publish_slot_status(snapshot);
        }
        for family in families {
            self.publish_advertisement(&family);
        }
        affected
    }

    /// Refuse new work from here on.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn occupant_count(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state
            .families
            .values()
            .flat_map(|family| family.active.values())
            .map(|slot| slot.occupants.len() as u32)
            .sum()
    }

    pub fn occupants(&self) -> Vec<PlayerId> {
        let state = self.state.lock().unwrap();
        state
            .families
            .values()
            .flat_map(|family| family.active.values())
            .flat_map(|slot| slot.occupants.iter().cloned())
            .collect()
    }

    fn respond_rejected(&self, envelope: &Envelope, reason: &str) {
        tracing::info!(reason, requester = %envelope.sender_id, "provision rejected");
        let response = Message::SlotProvisionResponse(models::SlotProvisionResponse {
            success: false,
            slot_id: None,
            state: None,
            reason: Some(reason.to_string()),
        });
        if let Err(err) = self.ctx.bus.respond(envelope, &response) {
            tracing::warn!(error = %err, "failed to answer a provision request");
        }
    }

    fn publish_slot_status(&self, slot: SlotSnapshot) {
        let message = Message::SlotStatus(models::SlotStatusUpdate {
            server_id: self.server_id(),
            slot,
        });
        if let Err(err) = self.ctx.bus.publish(channels::SLOT_STATUS, &message) {
            tracing::warn!(error = %err, "failed to publish a slot status");
        }
    }

    fn publish_advertisement(&self, family_id: &FamilyId) {
        let Some(capacity) = self.refresh_family(family_id) else {
            return;
        };
        let message = Message::FamilyAdvertisement(models::FamilyAdvertisement {
            server_id: self.server_id(),
            family_id: family_id.clone(),
            capacity,
        });
        if let Err(err) = self
            .ctx
            .bus
            .publish(channels::SLOT_FAMILY_ADVERTISEMENT, &message)
        {
            tracing::warn!(error = %err, "failed to publish a family advertisement");
        }
    }

    fn refresh_family(&self, family_id: &FamilyId) -> Option<FamilyCapacity> {
        let capacity = {
            let state = self.state.lock().unwrap();
            let family = state.families.get(family_id)?;
            FamilyCapacity {
                max_slots: family.config.max_slots,
                active_slots: family.active.len() as u32,
                variants: family.config.variants.keys().cloned().collect(),
            }
        };
        self.advertised
            .write()
            .unwrap()
            .insert(family_id.clone(), capacity.clone());
        Some(capacity)
    }

    fn refresh_advertised(&self) {
        let families: Vec<FamilyId> = self.state.lock().unwrap().families.keys().cloned().collect();
        for family in families {
            self.refresh_family(&family);
        }
    }
}

impl service::LoadSampler for SlotOrchestrator {
    fn sample(&self) -> (models::ServiceStatus, models::LoadMetrics) {
        let status = if self.stopped.load(Ordering::Relaxed) {
            models::ServiceStatus::Unavailable
        } else {
            models::ServiceStatus::Available
        };
        let load = models::LoadMetrics {
            player_count: self.occupant_count(),
            max_players: self.config.max_players,
            tps: 20.0,
            response_time: 0,
        };
        (status, load)
    }
}

/// The backend side of a drain: occupants are asked to disconnect, there
/// is no alternate backend to transfer them to.
pub struct BackendDrain(pub Arc<SlotOrchestrator>);

#[async_trait::async_trait]
impl service::shutdown::DrainTarget for BackendDrain {
    fn occupants(&self) -> Vec<PlayerId> {
        self.0.occupants()
    }

    async fn warn_occupants(&self, remaining: std::time::Duration) {
        tracing::info!(
            occupants = self.0.occupant_count(),
            remaining_seconds = remaining.as_secs(),
            "warning occupants of the upcoming shutdown"
        );
    }

    async fn evict(&self, _directory: &service::DirectoryView) -> Vec<PlayerId> {
        let affected = self.0.drain_all();
        tracing::info!(players = affected.len(), "asked occupants to disconnect");
        affected
    }

    async fn stop(&self) {
        self.0.stop();
    }
}
