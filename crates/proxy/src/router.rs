//! The player route dispatcher: picks a backend by load score, provisions
//! a slot when one is needed, and hands the player transfer command to
//! the connection layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope::Message;
use models::{channels, FamilyId, PlayerId, ServiceId, SlotId, VariantId};
use service::Context;

use crate::score::rank;

/// Deadline for one backend to answer a provision request.
pub const PROVISION_TIMEOUT: Duration = Duration::from_secs(5);
/// Candidates tried before the player sees a capacity error.
pub const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The user-visible outcome after every candidate failed.
    #[error("no available capacity")]
    NoCapacity,
    #[error("player {0} already has an active route")]
    AlreadyRouted(PlayerId),
    #[error("this proxy is draining and accepts no new routes")]
    Draining,
    #[error("player transfer failed: {0}")]
    Transfer(String),
}

/// One player's active placement. At most one exists per player across
/// the fleet; the assigning proxy owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteAssignment {
    pub player_id: PlayerId,
    pub backend_id: ServiceId,
    pub slot_id: Option<SlotId>,
    pub proxy_id: ServiceId,
    pub assigned_at: i64,
    pub metadata: serde_json::Value,
}

/// The connection layer that physically moves a player. In production
/// this is the plugin-channel bridge of the edge process.
#[async_trait::async_trait]
pub trait PlayerTransport: Send + Sync + 'static {
    async fn transfer(&self, command: models::PlayerRouteCommand) -> Result<(), String>;
}

/// Default transport: forwards transfer commands over the proxy's own
/// directed channel for the connection layer to consume.
pub struct BusPlayerTransport {
    pub ctx: Context,
}

#[async_trait::async_trait]
impl PlayerTransport for BusPlayerTransport {
    async fn transfer(&self, command: models::PlayerRouteCommand) -> Result<(), String> {
        let id = self
            .ctx
            .permanent_id()
            .unwrap_or_else(|| ServiceId::new(self.ctx.bus.sender_id()));
        self.ctx
            .bus
            .publish(
                &channels::direct(models::ServiceRole::Proxy, &id),
                &Message::PlayerRouteCommand(command),
            )
            .map_err(|err| err.to_string())
    }
}

pub struct RouteDispatcher {
    ctx: Context,
    transport: Arc<dyn PlayerTransport>,
    assignments: Mutex<HashMap<PlayerId, RouteAssignment>>,
    draining: AtomicBool,
}

impl RouteDispatcher {
    pub fn new(ctx: Context, transport: Arc<dyn PlayerTransport>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            transport,
            assignments: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        })
    }

    /// Watch slot closures so assignments into closed slots are released.
    pub fn install(self: &Arc<Self>) -> bus::SubscriptionToken {
        let this = self.clone();
        self.ctx.bus.subscribe(
            channels::SLOT_STATUS,
            bus::handler(move |envelope| {
                let this = this.clone();
                async move {
                    if let Ok(Message::SlotStatus(update)) = envelope.message() {
                        if update.slot.state == models::SlotState::Closed {
                            this.release_slot(&update.slot.slot_id);
                        }
                    }
                }
            }),
        )
    }

    fn proxy_id(&self) -> ServiceId {
        self.ctx
            .permanent_id()
            .unwrap_or_else(|| ServiceId::new(self.ctx.bus.sender_id()))
    }

    /// Route a player into a fresh slot of `family`/`variant`: provision
    /// on the best backend, walking down the candidate list on timeout or
    /// rejection, then transfer the player.
    pub async fn route_new_slot(
        &self,
        player_id: PlayerId,
        family_id: &FamilyId,
        variant_id: &VariantId,
        metadata: serde_json::Value,
    ) -> Result<RouteAssignment, RouteError> {
        self.check_accepting(&player_id)?;

        let candidates = rank(self.ctx.directory.available_backends(family_id));
        let mut attempts = 0;

        for candidate in candidates.into_iter().take(MAX_ATTEMPTS) {
            attempts += 1;
            let request = Message::SlotProvisionRequest(models::SlotProvisionRequest {
                family_id: family_id.clone(),
                variant_id: variant_id.clone(),
                requested_by: self.proxy_id(),
                metadata: metadata.clone(),
            });

            let response = self
                .ctx
                .bus
                .request(
                    Some(candidate.id.as_str()),
                    &channels::slot_provision(&candidate.id),
                    &request,
                    PROVISION_TIMEOUT,
                )
                .await;

            let envelope = match response {
                Ok(envelope) => envelope,
                Err(bus::Error::Timeout { .. }) => {
                    tracing::warn!(backend = %candidate.id, "provision timed out, trying the next candidate");
                    continue;
                }
                Err(err) => {
                    tracing::warn!(backend = %candidate.id, error = %err, "provision failed, trying the next candidate");
                    continue;
                }
            };

            match envelope.message() {
                Ok(Message::SlotProvisionResponse(provisioned)) if provisioned.success => {
                    let slot_id = provisioned.slot_id.clone();
                    return self
                        .complete(player_id, candidate.id, candidate.address, slot_id, metadata)
                        .await;
                }
                Ok(Message::SlotProvisionResponse(rejected)) => {
                    tracing::info!(
                        backend = %candidate.id,
                        reason = rejected.reason.as_deref().unwrap_or("unspecified"),
                        "provision rejected, trying the next candidate"
                    );
                }
                Ok(other) => {
                    tracing::warn!(
                        backend = %candidate.id,
                        message_type = other.message_type(),
                        "unexpected provision response"
                    );
                }
                Err(err) => {
                    tracing::warn!(backend = %candidate.id, error = %err, "undecodable provision response");
                }
            }
        }

        tracing::info!(
            player = %player_id,
            family = %family_id,
            attempts,
            "no backend could host the player"
        );
        Err(RouteError::NoCapacity)
    }

    /// Route a player into an existing shared world: instruct the best
    /// backend and transfer.
    pub async fn route_shared(
        &self,
        player_id: PlayerId,
        family_id: &FamilyId,
    ) -> Result<RouteAssignment, RouteError> {
        self.check_accepting(&player_id)?;

        let candidate = rank(self.ctx.directory.available_backends(family_id))
            .into_iter()
            .next()
            .ok_or(RouteError::NoCapacity)?;

        let route = Message::PlayerRoute(models::PlayerRoute {
            player_id: player_id.clone(),
            family_id: family_id.clone(),
            slot_id: None,
        });
        if self
            .ctx
            .bus
            .send(
                candidate.id.as_str(),
                &channels::direct(models::ServiceRole::Server, &candidate.id),
                &route,
            )
            .is_err()
        {
            return Err(RouteError::NoCapacity);
        }

        self.complete(player_id, candidate.id, candidate.address, None, serde_json::Value::Null)
            .await
    }

    async fn complete(
        &self,
        player_id: PlayerId,
        backend_id: ServiceId,
        backend_address: String,
        slot_id: Option<SlotId>,
        metadata: serde_json::Value,
    ) -> Result<RouteAssignment, RouteError> {
        let assignment = RouteAssignment {
            player_id: player_id.clone(),
            backend_id,
            slot_id: slot_id.clone(),
            proxy_id: self.proxy_id(),
            assigned_at: models::now_ms(),
            metadata: metadata.clone(),
        };

        let command = models::PlayerRouteCommand {
            player_id: player_id.clone(),
            slot_id,
            target_address: backend_address,
            spawn: None,
            metadata,
        };
        self.transport
            .transfer(command)
            .await
            .map_err(RouteError::Transfer)?;

        let mut assignments = self.assignments.lock().unwrap();
        assignments.insert(player_id, assignment.clone());
        tracing::info!(
            player = %assignment.player_id,
            backend = %assignment.backend_id,
            slot = ?assignment.slot_id,
            "player routed"
        );
        Ok(assignment)
    }

    fn check_accepting(&self, player_id: &PlayerId) -> Result<(), RouteError> {
        if self.draining.load(Ordering::Relaxed) {
            return Err(RouteError::Draining);
        }
        if self.assignments.lock().unwrap().contains_key(player_id) {
            return Err(RouteError::AlreadyRouted(player_id.clone()));
        }
        Ok(())
    }

    /// Drop a player's assignment on disconnect.
    pub fn release(&self, player_id: &PlayerId) -> Option<RouteAssignment> {
        self.assignments.lock().unwrap().remove(player_id)
    }

    /// Drop every assignment into a closed slot.
    pub fn release_slot(&self, slot_id: &SlotId) {
        self.assignments
            .lock()
            .unwrap()
            .retain(|_, assignment| assignment.slot_id.as_ref() != Some(slot_id));
    }

    pub fn connected_players(&self) -> Vec<PlayerId> {
        self.assignments.lock().unwrap().keys().cloned().collect()
    }

    pub fn assignment_of(&self, player_id: &PlayerId) -> Option<RouteAssignment> {
        self.assignments.lock().unwrap().get(player_id).cloned()
    }

    pub fn stop_accepting(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    /// Transfer every connected player to `address` (the least-loaded
    /// alternate proxy). Returns the players moved.
    pub async fn transfer_all_to(&self, address: &str) -> Vec<PlayerId> {
        let players = self.connected_players();
        let mut moved = Vec::new();
        for player_id in players {
            let command = models::PlayerRouteCommand {
                player_id: player_id.clone(),
                slot_id: None,
                target_address: address.to_string(),
                spawn: None,
                metadata: serde_json::Value::Null,
            };
            match self.transport.transfer(command).await {
                Ok(()) => {
                    self.release(&player_id);
                    moved.push(player_id);
                }
                Err(err) => {
                    tracing::warn!(player = %player_id, error = %err, "player transfer failed");
                }
            }
        }
        moved
    }
}

/// The proxy side of a drain: players move to the least-loaded other
/// proxy; with no alternate they are disconnected.
pub struct ProxyDrain(pub Arc<RouteDispatcher>);

#[async_trait::async_trait]
impl service::shutdown::DrainTarget for ProxyDrain {
    fn occupants(&self) -> Vec<PlayerId> {
        self.0.connected_players()
    }

    async fn warn_occupants(&self, remaining: Duration) {
        tracing::info!(
            players = self.0.connected_players().len(),
            remaining_seconds = remaining.as_secs(),
            "warning connected players of the upcoming shutdown"
        );
    }

    async fn evict(&self, directory: &service::DirectoryView) -> Vec<PlayerId> {
        let me = self.0.proxy_id();
        match directory.least_loaded_proxy(&me) {
            Some(alternate) => {
                tracing::info!(target = %alternate.id, "transferring players to an alternate proxy");
                self.0.transfer_all_to(&alternate.address).await
            }
            None => {
                let players = self.0.connected_players();
                tracing::warn!(
                    players = players.len(),
                    "no alternate proxy available, players will be disconnected"
                );
                for player in &players {
                    self.0.release(player);
                }
                players
            }
        }
    }

    async fn stop(&self) {
        self.0.stop_accepting();
    }
}
