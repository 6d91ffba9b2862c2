//! The phased drain a service performs when a shutdown intent names it:
//! evacuate (countdown with occupant warnings) → evict (players moved or
//! disconnected) → shutdown (stop accepting work and exit). Phases are
//! monotonic per intent; cancellation reverts straight to idle and emits
//! nothing further for that intent id.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envelope::{Envelope, Message};
use models::{channels, PlayerId, ServiceId, ShutdownIntent, ShutdownPhase};

use crate::{Context, DirectoryView};

/// Seconds added to every intent's countdown before eviction begins.
pub const EVACUATE_BUFFER_SECS: u64 = 8;
/// Pause between eviction and process exit.
pub const SHUTDOWN_BUFFER: Duration = Duration::from_secs(3);
/// The late-countdown warning milestone, in seconds remaining.
const WARN_MILESTONE: u64 = 15;

/// What the role-specific side of a drain does: proxies transfer players
/// to an alternate proxy, backends ask occupants to disconnect.
#[async_trait::async_trait]
pub trait DrainTarget: Send + Sync + 'static {
    fn occupants(&self) -> Vec<PlayerId>;
    async fn warn_occupants(&self, remaining: Duration);
    /// Move occupants off this service; returns the players affected.
    async fn evict(&self, directory: &DirectoryView) -> Vec<PlayerId>;
    /// Stop accepting new work.
    async fn stop(&self);
}

struct ActiveDrain {
    intent_id: uuid::Uuid,
    task: tokio::task::JoinHandle<()>,
}

pub struct ShutdownOrchestrator {
    ctx: Context,
    target: Arc<dyn DrainTarget>,
    exit_tx: tokio::sync::mpsc::Sender<()>,
    active: Mutex<Option<ActiveDrain>>,
    /// Intent ids ever begun here. Transitions are monotonic per intent,
    /// so a re-delivered or re-issued id never restarts a drain.
    seen: Mutex<BTreeSet<uuid::Uuid>>,
}

impl ShutdownOrchestrator {
    /// Subscribe to the intent channel and drive drains against `target`.
    /// A message on `exit_tx` tells the binary to leave its run loop.
    pub fn install(
        ctx: &Context,
        target: Arc<dyn DrainTarget>,
        exit_tx: tokio::sync::mpsc::Sender<()>,
    ) -> (Arc<Self>, bus::SubscriptionToken) {
        let this = Arc::new(Self {
            ctx: ctx.clone(),
            target,
            exit_tx,
            active: Mutex::new(None),
            seen: Mutex::new(BTreeSet::new()),
        });

        let handler_this = this.clone();
        let token = ctx.bus.subscribe(
            channels::SHUTDOWN_INTENT,
            bus::handler(move |envelope| {
                let this = handler_this.clone();
                async move { this.handle(envelope) }
            }),
        );
        (this, token)
    }

    fn handle(self: Arc<Self>, envelope: Envelope) {
        match envelope.message() {
            Ok(Message::ShutdownIntent(intent)) => {
                let me = self.service_id();
                if !intent.targets.contains(&me) {
                    return;
                }
                if intent.cancelled {
                    self.cancel(intent.intent_id);
                } else {
                    self.begin(intent);
                }
            }
            Ok(Message::ShutdownCancel(cancel)) => self.cancel(cancel.intent_id),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable shutdown message");
            }
        }
    }

    fn begin(self: &Arc<Self>, intent: ShutdownIntent) {
        if !self.seen.lock().unwrap().insert(intent.intent_id) {
            tracing::debug!(intent_id = %intent.intent_id, "intent already handled, ignoring");
            return;
        }

        let mut active = self.active.lock().unwrap();
        if let Some(drain) = &*active {
            tracing::warn!(
                intent_id = %intent.intent_id,
                draining = %drain.intent_id,
                "ignoring a shutdown intent while another drain runs"
            );
            return;
        }

        tracing::info!(
            intent_id = %intent.intent_id,
            countdown_seconds = intent.countdown_seconds,
            force = intent.force,
            "shutdown intent received, starting evacuation"
        );
        let this = self.clone();
        let intent_id = intent.intent_id;
        let task = tokio::spawn(async move {
            this.drive(intent).await;
            this.active.lock().unwrap().take();
        });
        *active = Some(ActiveDrain { intent_id, task });
    }

    fn cancel(&self, intent_id: uuid::Uuid) {
        let mut active = self.active.lock().unwrap();
        match &*active {
            Some(drain) if drain.intent_id == intent_id => {
                drain.task.abort();
                *active = None;
                tracing::info!(%intent_id, "shutdown intent cancelled, returning to idle");
            }
            // Cancellation is idempotent; unknown or finished ids are fine.
            _ => tracing::debug!(%intent_id, "cancellation for an inactive intent ignored"),
        }
    }

    async fn drive(&self, intent: ShutdownIntent) {
        let total = intent.countdown_seconds + EVACUATE_BUFFER_SECS;

        self.publish_update(intent.intent_id, ShutdownPhase::Evacuate, self.target.occupants());

        let mut remaining = total;
        while remaining > 0 {
            if remaining == total {
                self.target.warn_occupants(Duration::from_secs(remaining)).await;
            } else if remaining == WARN_MILESTONE {
                self.target.warn_occupants(Duration::from_secs(remaining)).await;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            remaining -= 1;
        }

        let affected = self.target.evict(&self.ctx.directory).await;
        self.publish_update(intent.intent_id, ShutdownPhase::Evict, affected);

        tokio::time::sleep(SHUTDOWN_BUFFER).await;
        self.publish_update(intent.intent_id, ShutdownPhase::Shutdown, Vec::new());
        self.target.stop().await;

        let _ = self.exit_tx.send(()).await;
    }

    fn publish_update(&self, intent_id: uuid::Uuid, phase: ShutdownPhase, affected: Vec<PlayerId>) {
        let update = Message::ShutdownUpdate(models::ShutdownUpdate {
            intent_id,
            service_id: self.service_id(),
            phase,
            affected_players: affected,
        });
        if let Err(err) = self.ctx.bus.publish(channels::SHUTDOWN_UPDATE, &update) {
            tracing::warn!(error = %err, ?phase, "failed to publish a shutdown update");
        }
    }

    fn service_id(&self) -> ServiceId {
        self.ctx
            .permanent_id()
            .unwrap_or_else(|| ServiceId::new(self.ctx.bus.sender_id()))
    }
}
