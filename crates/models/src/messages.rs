//! Typed message payloads carried inside envelopes. The wire shape of
//! every payload is camelCase JSON; consumers tolerate unknown fields.
//! The payload `version` integer is written and checked by the envelope
//! codec, not stored here.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    DirectoryRecord, EnvironmentDescriptor, FamilyId, LoadMetrics, PlayerId, ServiceId,
    ServiceRole, ServiceStatus, SlotId, SlotSnapshot, SlotState, VariantId,
};

/// Service → registry: initial join, or a re-submission of identity after
/// a `reregister` broadcast (then `permanent_id` is set).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub role: ServiceRole,
    /// Family prefix permanent ids are formed from (`mini`, `proxy`, ...).
    pub family: String,
    pub address: String,
    pub service_version: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_id: Option<ServiceId>,
    /// Slot families a backend brings up with; lets the directory entry
    /// carry capacity from the moment of registration.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub families: BTreeMap<FamilyId, crate::FamilyCapacity>,
}

/// Registry → service, on the directed response channel for the sender's
/// temporary id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_server_id: Option<ServiceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Registry → all: the registry restarted and is rebuilding its
/// directory; every service re-submits its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ReregisterRequest {}

/// Periodic liveness + load report from every service.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub id: ServiceId,
    pub status: ServiceStatus,
    #[serde(flatten)]
    pub load: LoadMetrics,
    pub timestamp: i64,
}

/// Registry → all: a service joined the directory. Broadcast as
/// `server.added` or `proxy.added` depending on the entry's role.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAdded {
    #[serde(flatten)]
    pub record: DirectoryRecord,
}

/// Registry → all: a dead service left the directory.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRemoved {
    pub id: ServiceId,
}

/// Registry → all: a per-entry status transition, with the load metrics
/// current at the moment of the transition.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub id: ServiceId,
    pub previous: ServiceStatus,
    pub status: ServiceStatus,
    pub load: LoadMetrics,
}

/// Backend → registry (and any listening proxy): capacity of one slot
/// family. Re-published whenever the active-slot count changes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyAdvertisement {
    pub server_id: ServiceId,
    pub family_id: FamilyId,
    #[serde(flatten)]
    pub capacity: crate::FamilyCapacity,
}

/// Backend → registry: one slot changed state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatusUpdate {
    pub server_id: ServiceId,
    #[serde(flatten)]
    pub slot: SlotSnapshot,
}

/// Registry/proxy → backend: create a new slot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotProvisionRequest {
    pub family_id: FamilyId,
    pub variant_id: VariantId,
    pub requested_by: ServiceId,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Backend → requester: outcome of a provision request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotProvisionResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<SlotState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Proxy → backend: route a player into an existing shared world (no new
/// slot required).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRoute {
    pub player_id: PlayerId,
    pub family_id: FamilyId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
}

/// Proxy connection layer: transfer a player to the given address, into
/// a specific slot when one was provisioned for them.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRouteCommand {
    pub player_id: PlayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<SlotId>,
    pub target_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn: Option<SpawnPoint>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnPoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world: Option<String>,
}

/// Target service → registry (broadcast): phase progress of a drain.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownUpdate {
    pub intent_id: uuid::Uuid,
    pub service_id: ServiceId,
    pub phase: crate::ShutdownPhase,
    #[serde(default)]
    pub affected_players: Vec<PlayerId>,
}

/// Registry → targets: revoke an intent. Idempotent.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownCancel {
    pub intent_id: uuid::Uuid,
}

/// Operator → registry: issue a shutdown intent against the targets.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownRequest {
    pub targets: BTreeSet<ServiceId>,
    pub countdown_seconds: u64,
    #[serde(default)]
    pub force: bool,
}

/// Registry → operator: outcome of a shutdown request.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<uuid::Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Query for the environment directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentsRequest {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentsResponse {
    pub revision: u64,
    pub environments: BTreeMap<String, EnvironmentDescriptor>,
}

/// Registry → all: the environment directory changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentsRevision {
    pub revision: u64,
}

/// Operator query for the current directory and slot map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct RuntimeInfoRequest {}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfoResponse {
    pub directory: Vec<DirectoryRecord>,
    pub slots: BTreeMap<ServiceId, Vec<SlotSnapshot>>,
    /// The registry's own bus counters, for operator diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bus_metrics: Option<serde_json::Value>,
}
