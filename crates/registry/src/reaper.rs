//! The liveness reaper: one tick walks every directory entry, demotes
//! stale services, declares the silent ones dead, and returns ids to the
//! pool once the grace window closes.

use envelope::Message;
use models::{channels, ServiceRole, ServiceStatus};

use crate::Registry;

impl Registry {
    pub(crate) fn reap(&self) {
        let now = tokio::time::Instant::now();

        for (id, entry) in self.directory.entries() {
            match entry.status() {
                ServiceStatus::Available | ServiceStatus::Unavailable => {
                    let staleness = entry.staleness(now);
                    if staleness > self.config.dead_after() {
                        if let Some(previous) = entry.transition(ServiceStatus::Dead) {
                            entry.mark_dead(now);
                            self.broadcast_status(&id, &entry, previous, ServiceStatus::Dead);
                            self.broadcast_removed(&id, entry.role);
                            tracing::info!(
                                %id,
                                ?staleness,
                                grace = ?self.config.grace_window,
                                "service declared dead, holding its id through the grace window"
                            );
                        }
                    } else if staleness > self.config.unavailable_after()
                        && entry.status() == ServiceStatus::Available
                    {
                        if let Some(previous) = entry.transition(ServiceStatus::Unavailable) {
                            self.broadcast_status(&id, &entry, previous, ServiceStatus::Unavailable);
                        }
                    }
                }
                ServiceStatus::Dead => {
                    let Some(dead_since) = entry.dead_since() else {
                        continue;
                    };
                    if now.saturating_duration_since(dead_since) >= self.config.grace_window {
                        self.directory.remove(&id);
                        self.slots.lock().unwrap().remove(&id);
                        self.ids.release(&id);
                        tracing::info!(%id, "grace window expired, id returned to the pool");
                    }
                }
            }
        }
    }

    fn broadcast_removed(&self, id: &models::ServiceId, role: ServiceRole) {
        let removed = models::ServiceRemoved { id: id.clone() };
        let broadcast = match role {
            ServiceRole::Server => Some((channels::SERVER_REMOVED, Message::ServerRemoved(removed))),
            ServiceRole::Proxy => Some((channels::PROXY_REMOVED, Message::ProxyRemoved(removed))),
            ServiceRole::Limbo | ServiceRole::Registry => None,
        };
        if let Some((channel, message)) = broadcast {
            if let Err(err) = self.bus.publish(channel, &message) {
                tracing::warn!(error = %err, "failed to broadcast a removal");
            }
        }
    }
}
