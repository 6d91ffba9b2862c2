//! Backend-side runtime: slot-family configuration and the slot
//! orchestrator that advertises capacity and fulfils provision commands.

mod config;
mod slots;

pub use config::{BackendConfig, ConfigError, FamilyConfig, VariantConfig};
pub use slots::{
    ActiveSlot, BackendDrain, JoinError, LocalWorlds, SlotOrchestrator, WorldProvisioner,
    PROVISION_QUEUE_DEPTH,
};
