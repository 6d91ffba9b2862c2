//! Shared vocabulary of the Fulcrum control plane: identifiers, roles and
//! statuses, load metrics, directory records, slot and shutdown records,
//! the typed message payloads carried on the bus, and the channel catalogue.

pub mod channels;

mod directory;
mod ids;
mod messages;
mod metrics;
mod shutdown;
mod status;

pub use directory::{DirectoryRecord, EnvironmentDescriptor, FamilyCapacity, SlotSnapshot};
pub use ids::{FamilyId, PlayerId, ServiceId, SlotId, TempId, VariantId};
pub use messages::*;
pub use metrics::LoadMetrics;
pub use shutdown::{ShutdownIntent, ShutdownPhase};
pub use status::{RoleParseError, ServiceRole, ServiceStatus, SlotState};

/// Wall-clock milliseconds since the Unix epoch, as carried in envelope
/// and heartbeat timestamps.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}
