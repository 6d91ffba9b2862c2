//! The authoritative directory. The map itself sits behind a
//! reader-writer lock taken exclusively only for membership changes;
//! the hot per-entry fields a heartbeat burst touches live behind
//! per-entry locks and atomics so heartbeats never serialize on the map
//! lock. Lock order is always map → entry field.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use models::{
    DirectoryRecord, FamilyCapacity, FamilyId, Heartbeat, LoadMetrics, ServiceId, ServiceRole,
    ServiceStatus,
};

pub struct Entry {
    pub role: ServiceRole,
    pub address: String,
    pub capabilities: BTreeSet<String>,
    status: Mutex<ServiceStatus>,
    /// Wall-clock milliseconds, for broadcast records.
    last_heartbeat_ms: AtomicI64,
    /// Monotonic mark the reaper measures staleness against.
    last_heartbeat: Mutex<tokio::time::Instant>,
    load: Mutex<LoadMetrics>,
    families: Mutex<BTreeMap<FamilyId, FamilyCapacity>>,
    /// Set when the reaper declares the entry dead; removal happens a
    /// grace window later.
    dead_since: Mutex<Option<tokio::time::Instant>>,
}

impl Entry {
    pub fn new(
        role: ServiceRole,
        address: String,
        capabilities: BTreeSet<String>,
        families: BTreeMap<FamilyId, FamilyCapacity>,
    ) -> Self {
        Self {
            role,
            address,
            capabilities,
            status: Mutex::new(ServiceStatus::Available),
            last_heartbeat_ms: AtomicI64::new(models::now_ms()),
            last_heartbeat: Mutex::new(tokio::time::Instant::now()),
            load: Mutex::new(LoadMetrics::default()),
            families: Mutex::new(families),
            dead_since: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.lock().unwrap()
    }

    pub fn load(&self) -> LoadMetrics {
        *self.load.lock().unwrap()
    }

    pub fn staleness(&self, now: tokio::time::Instant) -> std::time::Duration {
        now.saturating_duration_since(*self.last_heartbeat.lock().unwrap())
    }

    pub fn dead_since(&self) -> Option<tokio::time::Instant> {
        *self.dead_since.lock().unwrap()
    }

    pub fn mark_dead(&self, at: tokio::time::Instant) {
        *self.dead_since.lock().unwrap() = Some(at);
    }

    /// Move to `to` if not already there. Returns the previous status on
    /// an actual change, which is what keeps every transition broadcast
    /// exactly once.
    pub fn transition(&self, to: ServiceStatus) -> Option<ServiceStatus> {
        let mut status = self.status.lock().unwrap();
        if *status == to {
            return None;
        }
        let previous = *status;
        *status = to;
        if to != ServiceStatus::Dead {
            *self.dead_since.lock().unwrap() = None;
        }
        Some(previous)
    }

    /// Fold in a heartbeat. Returns a transition to announce, if the
    /// reported status differs from the directory's view.
    pub fn observe_heartbeat(&self, beat: &Heartbeat) -> Option<(ServiceStatus, ServiceStatus)> {
        self.last_heartbeat_ms.store(beat.timestamp, Ordering::Relaxed);
        *self.last_heartbeat.lock().unwrap() = tokio::time::Instant::now();
        *self.load.lock().unwrap() = beat.load;
        self.transition(beat.status).map(|previous| (previous, beat.status))
    }

    pub fn set_family(&self, family: FamilyId, capacity: FamilyCapacity) {
        self.families.lock().unwrap().insert(family, capacity);
    }

    pub fn record(&self, id: &ServiceId) -> DirectoryRecord {
        DirectoryRecord {
            id: id.clone(),
            role: self.role,
            address: self.address.clone(),
            status: self.status(),
            load: self.load(),
            last_heartbeat_at: self.last_heartbeat_ms.load(Ordering::Relaxed),
            capabilities: self.capabilities.clone(),
            families: self.families.lock().unwrap().clone(),
        }
    }
}

#[derive(Default)]
pub struct Directory {
    entries: RwLock<HashMap<ServiceId, Arc<Entry>>>,
}

impl Directory {
    pub fn insert(&self, id: ServiceId, entry: Entry) -> Arc<Entry> {
        let entry = Arc::new(entry);
        self.entries.write().unwrap().insert(id, entry.clone());
        entry
    }

    pub fn remove(&self, id: &ServiceId) -> Option<Arc<Entry>> {
        self.entries.write().unwrap().remove(id)
    }

    pub fn get(&self, id: &ServiceId) -> Option<Arc<Entry>> {
        self.entries.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &ServiceId) -> bool {
        self.entries.read().unwrap().contains_key(id)
    }

    pub fn entries(&self) -> Vec<(ServiceId, Arc<Entry>)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<DirectoryRecord> {
        let mut records: Vec<_> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .map(|(id, entry)| entry.record(id))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
