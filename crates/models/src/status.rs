/// Role a service plays in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Edge process terminating player connections.
    Proxy,
    /// Game-logic process hosting slots. `server` on the wire.
    Server,
    /// A peer on the bus that is neither proxy nor backend (for example
    /// an operator CLI session).
    Limbo,
    Registry,
}

impl ServiceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceRole::Proxy => "proxy",
            ServiceRole::Server => "server",
            ServiceRole::Limbo => "limbo",
            ServiceRole::Registry => "registry",
        }
    }
}

impl std::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown service role {0:?}")]
pub struct RoleParseError(pub String);

impl std::str::FromStr for ServiceRole {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(ServiceRole::Proxy),
            "server" => Ok(ServiceRole::Server),
            "limbo" => Ok(ServiceRole::Limbo),
            "registry" => Ok(ServiceRole::Registry),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

/// Authoritative liveness status of a directory entry. Exactly one status
/// holds at any time; transitions are serialized by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Heartbeating and offered to routing decisions.
    Available,
    /// Missed heartbeats; kept in the directory but not routed to.
    Unavailable,
    /// Presumed gone; scheduled for removal after the grace window.
    Dead,
}

/// Lifecycle state of a logical slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotState {
    Provisioning,
    Ready,
    Draining,
    Closed,
}

impl SlotState {
    /// Whether a slot in this state counts against its family's
    /// `activeSlots`.
    pub fn is_active(&self) -> bool {
        !matches!(self, SlotState::Closed)
    }
}
