use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use envelope::Message;
use models::{channels, ServiceId, ShutdownIntent, ShutdownPhase, ShutdownUpdate};

#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("unknown target {0}")]
    UnknownTarget(ServiceId),
    #[error("an intent needs at least one target")]
    NoTargets,
    #[error(transparent)]
    Bus(#[from] bus::Error),
}

struct IntentState {
    intent: ShutdownIntent,
    /// Latest phase reported by each target. Monotonic.
    phases: BTreeMap<ServiceId, ShutdownPhase>,
}

/// The registry's ledger of issued shutdown intents and each target's
/// reported drain phase.
#[derive(Default)]
pub struct ShutdownLedger {
    intents: Mutex<BTreeMap<uuid::Uuid, IntentState>>,
}

impl ShutdownLedger {
    /// Validate and broadcast a new intent. Targets must all be present
    /// in the directory at issue time.
    pub fn issue(
        &self,
        bus: &bus::Bus,
        targets: BTreeSet<ServiceId>,
        countdown_seconds: u64,
        force: bool,
        known: impl Fn(&ServiceId) -> bool,
    ) -> Result<uuid::Uuid, IssueError> {
        if targets.is_empty() {
            return Err(IssueError::NoTargets);
        }
        if let Some(unknown) = targets.iter().find(|id| !known(id)) {
            return Err(IssueError::UnknownTarget(unknown.clone()));
        }

        let intent = ShutdownIntent {
            intent_id: uuid::Uuid::new_v4(),
            targets,
            countdown_seconds,
            force,
            cancelled: false,
        };
        bus.publish(channels::SHUTDOWN_INTENT, &Message::ShutdownIntent(intent.clone()))?;
        tracing::info!(
            intent_id = %intent.intent_id,
            targets = ?intent.targets,
            countdown_seconds,
            "shutdown intent issued"
        );

        let intent_id = intent.intent_id;
        self.intents.lock().unwrap().insert(
            intent_id,
            IntentState {
                intent,
                phases: BTreeMap::new(),
            },
        );
        Ok(intent_id)
    }

    /// Broadcast a cancellation. Idempotent: cancelling an unknown or
    /// already-cancelled intent only re-sends the (harmless) message.
    pub fn cancel(&self, bus: &bus::Bus, intent_id: uuid::Uuid) -> Result<(), bus::Error> {
        bus.publish(
            channels::SHUTDOWN_INTENT,
            &Message::ShutdownCancel(models::ShutdownCancel { intent_id }),
        )?;
        if let Some(state) = self.intents.lock().unwrap().get_mut(&intent_id) {
            state.intent.cancelled = true;
        }
        tracing::info!(%intent_id, "shutdown intent cancelled");
        Ok(())
    }

    /// Advance the registry's view of one target's drain. Out-of-order
    /// updates never move a target backwards.
    pub fn record_update(&self, update: &ShutdownUpdate) {
        let mut intents = self.intents.lock().unwrap();
        let Some(state) = intents.get_mut(&update.intent_id) else {
            tracing::debug!(intent_id = %update.intent_id, "update for an unknown intent");
            return;
        };
        let phase = state
            .phases
            .entry(update.service_id.clone())
            .or_insert(update.phase);
        *phase = (*phase).max(update.phase);
        tracing::info!(
            intent_id = %update.intent_id,
            service = %update.service_id,
            phase = ?update.phase,
            affected = update.affected_players.len(),
            "drain progress"
        );
    }

    pub fn phase_of(&self, intent_id: uuid::Uuid, target: &ServiceId) -> Option<ShutdownPhase> {
        self.intents
            .lock()
            .unwrap()
            .get(&intent_id)
            .and_then(|state| state.phases.get(target).copied())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bus::{Bus, BusConfig, MemoryHub};

    fn test_bus() -> Bus {
        Bus::in_memory(&MemoryHub::new(), &BusConfig::new("registry"))
    }

    #[tokio::test]
    async fn unknown_targets_are_rejected() {
        let ledger = ShutdownLedger::default();
        let err = ledger
            .issue(
                &test_bus(),
                BTreeSet::from([ServiceId::from("ghost1")]),
                30,
                false,
                |_| false,
            )
            .unwrap_err();
        assert!(matches!(err, IssueError::UnknownTarget(id) if id == "ghost1".into()));
    }

    #[tokio::test]
    async fn phase_updates_are_monotonic() {
        let ledger = ShutdownLedger::default();
        let intent_id = ledger
            .issue(
                &test_bus(),
                BTreeSet::from([ServiceId::from("proxy1")]),
                30,
                false,
                |_| true,
            )
            .unwrap();

        let update = |phase| ShutdownUpdate {
            intent_id,
            service_id: "proxy1".into(),
            phase,
            affected_players: Vec::new(),
        };
        ledger.record_update(&update(ShutdownPhase::Evict));
        // A late evacuate report must not regress the view.
        ledger.record_update(&update(ShutdownPhase::Evacuate));

        assert_eq!(
            ledger.phase_of(intent_id, &"proxy1".into()),
            Some(ShutdownPhase::Evict)
        );
    }
}
