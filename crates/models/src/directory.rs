use std::collections::{BTreeMap, BTreeSet};

use crate::{FamilyId, LoadMetrics, PlayerId, ServiceId, ServiceRole, ServiceStatus, SlotId, SlotState, VariantId};

/// One service as seen in the registry directory. This is the record
/// broadcast to the fleet and the record `runtimeinfo` prints; proxies
/// assemble their local view entirely from these.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryRecord {
    pub id: ServiceId,
    pub role: ServiceRole,
    pub address: String,
    pub status: ServiceStatus,
    pub load: LoadMetrics,
    pub last_heartbeat_at: i64,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
    /// Slot-family capacity, present for backends only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub families: BTreeMap<FamilyId, FamilyCapacity>,
}

/// Advertised capacity of one slot family on one backend.
/// Invariant: `0 <= active_slots <= max_slots`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyCapacity {
    pub max_slots: u32,
    pub active_slots: u32,
    pub variants: BTreeSet<VariantId>,
}

impl FamilyCapacity {
    pub fn has_room(&self) -> bool {
        self.active_slots < self.max_slots
    }
}

/// Point-in-time view of one slot, as reported by `slot.status`
/// messages and served by `runtimeinfo`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub slot_id: SlotId,
    pub family_id: FamilyId,
    pub variant_id: VariantId,
    pub state: SlotState,
    pub world_name: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub occupants: BTreeSet<PlayerId>,
    pub created_at: i64,
}

/// Descriptor of a named environment in the registry's environment
/// directory: which modules it runs and how many players it is sized for.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentDescriptor {
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub max_players: u32,
}
