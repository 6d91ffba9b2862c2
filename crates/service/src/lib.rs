//! Everything a process needs to live on the Fulcrum bus: identity
//! derivation, the registration state machine, periodic ticks and
//! heartbeats, the local directory cache, and the phased shutdown
//! orchestrator.

use std::sync::Arc;

mod directory;
mod environment;
mod heartbeat;
mod identity;
mod registration;
pub mod shutdown;
pub mod tick;

pub use directory::DirectoryView;
pub use environment::Environment;
pub use heartbeat::{register_heartbeat, LoadSampler, HEARTBEAT_INTERVAL};
pub use identity::ServiceIdentity;
pub use registration::{install_reregister_responder, register, RegistrationConfig};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("registration retries exhausted after {attempts} attempts")]
    RegistrationExhausted { attempts: u32 },
    #[error("registration rejected: {reason}")]
    RegistrationRejected { reason: String },
    #[error(transparent)]
    Bus(#[from] bus::Error),
    #[error(transparent)]
    Decode(#[from] envelope::DecodeError),
    #[error("failed to read the environment file")]
    Environment(#[source] std::io::Error),
}

/// Root dependency context, passed explicitly to every component in
/// place of process-wide globals.
#[derive(Clone)]
pub struct Context {
    pub bus: bus::Bus,
    pub identity: Arc<std::sync::RwLock<ServiceIdentity>>,
    pub directory: DirectoryView,
}

impl Context {
    pub fn new(bus: bus::Bus, identity: ServiceIdentity) -> Self {
        Self {
            bus,
            identity: Arc::new(std::sync::RwLock::new(identity)),
            directory: DirectoryView::default(),
        }
    }

    /// The permanent id, once registration has assigned one.
    pub fn permanent_id(&self) -> Option<models::ServiceId> {
        self.identity.read().unwrap().permanent_id.clone()
    }

    pub fn role(&self) -> models::ServiceRole {
        self.identity.read().unwrap().role
    }
}
