use std::collections::HashMap;
use std::sync::Arc;

use envelope::Message;
use models::{channels, DirectoryRecord, FamilyId, ServiceId, ServiceRole, ServiceStatus};

use crate::Context;

/// The local cache of the registry's directory, maintained purely from
/// broadcasts: `server.added`/`proxy.added`, the removal counterparts,
/// `status.change`, and slot-family advertisements. Never polled.
#[derive(Clone, Default)]
pub struct DirectoryView {
    inner: Arc<std::sync::RwLock<HashMap<ServiceId, DirectoryRecord>>>,
}

impl DirectoryView {
    /// Fold one broadcast into the view. `at` is the envelope timestamp,
    /// used as the freshness mark for tie-breaking among candidates.
    pub fn apply(&self, message: &Message, at: i64) {
        let mut entries = self.inner.write().unwrap();
        match message {
            Message::ServerAdded(added) | Message::ProxyAdded(added) => {
                entries.insert(added.record.id.clone(), added.record.clone());
            }
            Message::ServerRemoved(removed) | Message::ProxyRemoved(removed) => {
                entries.remove(&removed.id);
            }
            Message::StatusChange(change) => {
                if let Some(record) = entries.get_mut(&change.id) {
                    record.status = change.status;
                    record.load = change.load;
                    record.last_heartbeat_at = at;
                }
            }
            Message::FamilyAdvertisement(ad) => {
                if let Some(record) = entries.get_mut(&ad.server_id) {
                    record
                        .families
                        .insert(ad.family_id.clone(), ad.capacity.clone());
                }
            }
            _ => {}
        }
    }

    pub fn get(&self, id: &ServiceId) -> Option<DirectoryRecord> {
        self.inner.read().unwrap().get(id).cloned()
    }

    pub fn records(&self) -> Vec<DirectoryRecord> {
        self.inner.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Backends eligible for a routing decision in `family`: available,
    /// with spare slots advertised.
    pub fn available_backends(&self, family: &FamilyId) -> Vec<DirectoryRecord> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|record| {
                record.role == ServiceRole::Server
                    && record.status == ServiceStatus::Available
                    && record.families.get(family).is_some_and(|f| f.has_room())
            })
            .cloned()
            .collect()
    }

    /// The least-occupied available proxy other than `exclude`; the
    /// eviction target when a proxy drains.
    pub fn least_loaded_proxy(&self, exclude: &ServiceId) -> Option<DirectoryRecord> {
        self.inner
            .read()
            .unwrap()
            .values()
            .filter(|record| {
                record.role == ServiceRole::Proxy
                    && record.status == ServiceStatus::Available
                    && &record.id != exclude
            })
            .min_by(|a, b| {
                a.load
                    .occupancy()
                    .partial_cmp(&b.load.occupancy())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Subscribe the view to every broadcast that feeds it.
    pub fn install(ctx: &Context) -> Vec<bus::SubscriptionToken> {
        let feeds = [
            channels::SERVER_ADDED,
            channels::SERVER_REMOVED,
            channels::PROXY_ADDED,
            channels::PROXY_REMOVED,
            channels::STATUS_CHANGE,
            channels::SLOT_FAMILY_ADVERTISEMENT,
        ];

        feeds
            .into_iter()
            .map(|channel| {
                let view = ctx.directory.clone();
                ctx.bus.subscribe(
                    channel,
                    bus::handler(move |envelope| {
                        let view = view.clone();
                        async move {
                            match envelope.message() {
                                Ok(message) => view.apply(&message, envelope.timestamp),
                                Err(err) => {
                                    tracing::warn!(error = %err, "dropping undecodable directory broadcast");
                                }
                            }
                        }
                    }),
                )
            })
            .collect()
    }
}
