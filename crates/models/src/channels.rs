//! Channel catalogue. Every name follows
//! `fulcrum.<component>.<category>.<action>`; directed channels append
//! the target id as a final suffix.

use crate::{ServiceId, ServiceRole, TempId};

pub const REGISTRATION_REQUEST: &str = "fulcrum.registry.registration.request";
pub const REGISTRATION_REREGISTER: &str = "fulcrum.registry.registration.reregister";

pub const SERVER_ADDED: &str = "fulcrum.registry.server.added";
pub const SERVER_REMOVED: &str = "fulcrum.registry.server.removed";
pub const PROXY_ADDED: &str = "fulcrum.registry.proxy.added";
pub const PROXY_REMOVED: &str = "fulcrum.registry.proxy.removed";
pub const STATUS_CHANGE: &str = "fulcrum.registry.status.change";

pub const SERVER_HEARTBEAT: &str = "fulcrum.server.heartbeat.status";
pub const PROXY_HEARTBEAT: &str = "fulcrum.proxy.heartbeat.status";

pub const SLOT_FAMILY_ADVERTISEMENT: &str = "fulcrum.registry.slot.family.advertisement";
pub const SLOT_STATUS: &str = "fulcrum.registry.slot.status";

pub const SHUTDOWN_INTENT: &str = "fulcrum.registry.shutdown.intent";
pub const SHUTDOWN_UPDATE: &str = "fulcrum.registry.shutdown.update";

/// Request channels the registry itself answers on; the registry is
/// addressed by channel rather than by a permanent id of its own.
pub const RUNTIME_INFO: &str = "fulcrum.registry.runtimeinfo.request";
pub const ENVIRONMENTS: &str = "fulcrum.registry.environments.request";
pub const ENVIRONMENTS_REVISION: &str = "fulcrum.registry.environments.revision";
pub const SHUTDOWN_REQUEST: &str = "fulcrum.registry.shutdown.request";

/// Registry → service: directed registration response for a temp id.
pub fn registration_response(temp_id: &TempId) -> String {
    format!("fulcrum.registry.registration.response.{temp_id}")
}

/// Directed provision commands for one backend.
pub fn slot_provision(server_id: &ServiceId) -> String {
    format!("fulcrum.server.slot.provision.{server_id}")
}

/// Point-to-point channel for a registered service.
pub fn direct(role: ServiceRole, id: &ServiceId) -> String {
    format!("fulcrum.direct.{}.{id}", role.as_str())
}

/// Directed request inbox for a registered service.
pub fn request(id: &ServiceId) -> String {
    format!("fulcrum.request.{id}")
}

/// Reply channel a peer listens on for responses to its requests. The
/// suffix is whatever id the peer currently sends with (temporary until
/// registration, permanent after).
pub fn response(sender_id: &str) -> String {
    format!("fulcrum.response.{sender_id}")
}

/// Shared heartbeat channel for a role, if the role emits heartbeats.
pub fn heartbeat(role: ServiceRole) -> Option<&'static str> {
    match role {
        ServiceRole::Server => Some(SERVER_HEARTBEAT),
        ServiceRole::Proxy => Some(PROXY_HEARTBEAT),
        ServiceRole::Limbo | ServiceRole::Registry => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn directed_channels_append_the_target_id() {
        let id = ServiceId::from("mini1");
        assert_eq!(slot_provision(&id), "fulcrum.server.slot.provision.mini1");
        assert_eq!(direct(ServiceRole::Server, &id), "fulcrum.direct.server.mini1");
        assert_eq!(request(&id), "fulcrum.request.mini1");
        assert_eq!(response("mini1"), "fulcrum.response.mini1");
    }
}
