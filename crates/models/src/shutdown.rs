use std::collections::BTreeSet;

use crate::ServiceId;

/// Drain phase of a shutdown intent. Phases are monotonic for a given
/// intent id; only cancellation leaves the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPhase {
    Evacuate,
    Evict,
    Shutdown,
}

/// An operator-issued instruction to drain one or more services.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownIntent {
    pub intent_id: uuid::Uuid,
    pub targets: BTreeSet<ServiceId>,
    pub countdown_seconds: u64,
    pub force: bool,
    #[serde(default)]
    pub cancelled: bool,
}
