use std::collections::BTreeSet;

use models::{ServiceId, ServiceRole, TempId};

/// The identity record a service owns about itself. The temporary id is
/// used only until the registry's first registration response; from then
/// on every outbound envelope carries the permanent id.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub temp_id: TempId,
    pub permanent_id: Option<ServiceId>,
    pub role: ServiceRole,
    /// Family prefix the registry forms permanent ids from.
    pub family: String,
    /// `host:port` peers reach this service at.
    pub address: String,
    pub version: String,
    pub capabilities: BTreeSet<String>,
}

impl ServiceIdentity {
    pub fn generate(
        role: ServiceRole,
        family: impl Into<String>,
        address: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            temp_id: TempId::new(format!("fulcrum-{}-{}", role.as_str(), uuid::Uuid::new_v4())),
            permanent_id: None,
            role,
            family: family.into(),
            address: address.into(),
            version: version.into(),
            capabilities: BTreeSet::new(),
        }
    }

    /// The id to stamp on outbound envelopes right now.
    pub fn sender_id(&self) -> String {
        match &self.permanent_id {
            Some(id) => id.to_string(),
            None => self.temp_id.to_string(),
        }
    }
}
