use std::collections::BTreeMap;

use crate::Entry;

/// Declares the tagged message union and its decoder registry in one
/// place: the envelope `type` string is the tag, and each entry records
/// the newest payload version its decoder understands.
macro_rules! message_union {
    ($( $variant:ident($payload:ty) => $type_str:literal, v $version:literal; )*) => {
        /// Every typed message of the control plane. The wire tag of each
        /// variant is the envelope's `type` string.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $( $variant($payload), )*
        }

        impl Message {
            pub fn message_type(&self) -> &'static str {
                match self {
                    $( Message::$variant(_) => $type_str, )*
                }
            }

            pub fn payload_version(&self) -> u32 {
                match self {
                    $( Message::$variant(_) => $version, )*
                }
            }

            /// The payload tree for this message: its serialized fields
            /// plus the required `version` integer.
            pub fn to_payload(&self) -> serde_json::Value {
                let mut value = match self {
                    $( Message::$variant(payload) => {
                        serde_json::to_value(payload).expect("payload serialization cannot fail")
                    } )*
                };
                value
                    .as_object_mut()
                    .expect("payloads are always JSON objects")
                    .insert("version".to_string(), self.payload_version().into());
                value
            }
        }

        pub(crate) fn build_registry() -> BTreeMap<&'static str, Entry> {
            let mut map = BTreeMap::new();
            $(
                map.insert($type_str, Entry {
                    version: $version,
                    decode: |value: &serde_json::Value| {
                        Ok(Message::$variant(serde_json::from_value(value.clone())?))
                    },
                });
            )*
            map
        }
    };
}

message_union! {
    RegistrationRequest(models::RegistrationRequest) => "registration.request", v 1;
    RegistrationResponse(models::RegistrationResponse) => "registration.response", v 1;
    Reregister(models::ReregisterRequest) => "registration.reregister", v 1;
    Heartbeat(models::Heartbeat) => "heartbeat.status", v 1;
    ServerAdded(models::ServiceAdded) => "server.added", v 1;
    ServerRemoved(models::ServiceRemoved) => "server.removed", v 1;
    ProxyAdded(models::ServiceAdded) => "proxy.added", v 1;
    ProxyRemoved(models::ServiceRemoved) => "proxy.removed", v 1;
    StatusChange(models::StatusChange) => "status.change", v 1;
    FamilyAdvertisement(models::FamilyAdvertisement) => "slot.family.advertisement", v 1;
    SlotStatus(models::SlotStatusUpdate) => "slot.status", v 1;
    SlotProvisionRequest(models::SlotProvisionRequest) => "slot.provision.request", v 1;
    SlotProvisionResponse(models::SlotProvisionResponse) => "slot.provision.response", v 1;
    PlayerRoute(models::PlayerRoute) => "player.route", v 1;
    PlayerRouteCommand(models::PlayerRouteCommand) => "player.route.command", v 1;
    ShutdownIntent(models::ShutdownIntent) => "shutdown.intent", v 1;
    ShutdownUpdate(models::ShutdownUpdate) => "shutdown.intent.update", v 1;
    ShutdownCancel(models::ShutdownCancel) => "shutdown.intent.cancel", v 1;
    ShutdownRequest(models::ShutdownRequest) => "shutdown.request", v 1;
    ShutdownResponse(models::ShutdownResponse) => "shutdown.response", v 1;
    EnvironmentsRequest(models::EnvironmentsRequest) => "environments.request", v 1;
    EnvironmentsResponse(models::EnvironmentsResponse) => "environments.response", v 1;
    EnvironmentsRevision(models::EnvironmentsRevision) => "environments.revision", v 1;
    RuntimeInfoRequest(models::RuntimeInfoRequest) => "runtimeinfo.request", v 1;
    RuntimeInfoResponse(models::RuntimeInfoResponse) => "runtimeinfo.response", v 1;
}
