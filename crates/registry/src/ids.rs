use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use models::ServiceId;

#[derive(Default)]
struct FamilyIds {
    /// Highest integer ever handed out in this family.
    high: u32,
    /// Integers returned to the pool, reused smallest-first.
    free: BTreeSet<u32>,
}

/// Permanent-id assignment: `<familyPrefix><small-integer>` per family,
/// smallest free integer first. An id returns to the pool only after its
/// owner's grace window expires, so re-registration within the window
/// keeps the id.
#[derive(Default)]
pub struct IdAllocator {
    families: Mutex<HashMap<String, FamilyIds>>,
}

impl IdAllocator {
    pub fn assign(&self, family: &str) -> ServiceId {
        let mut families = self.families.lock().unwrap();
        let ids = families.entry(family.to_string()).or_default();

        let number = match ids.free.pop_first() {
            Some(number) => number,
            None => {
                ids.high += 1;
                ids.high
            }
        };
        ServiceId::new(format!("{family}{number}"))
    }

    /// Claim a specific id, as when a service re-registers with the
    /// permanent id it already holds. Fails if the id is in use.
    pub fn reserve(&self, id: &ServiceId) -> bool {
        let Some((family, number)) = id.split_family() else {
            return false;
        };
        let mut families = self.families.lock().unwrap();
        let ids = families.entry(family.to_string()).or_default();

        if ids.free.remove(&number) {
            return true;
        }
        if number > ids.high {
            // Everything between becomes assignable.
            ids.free.extend(ids.high + 1..number);
            ids.high = number;
            return true;
        }
        false
    }

    /// Return an id to its family's pool.
    pub fn release(&self, id: &ServiceId) {
        let Some((family, number)) = id.split_family() else {
            return;
        };
        let mut families = self.families.lock().unwrap();
        let ids = families.entry(family.to_string()).or_default();
        if number <= ids.high {
            ids.free.insert(number);
        }
    }
}
