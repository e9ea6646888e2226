use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

use super::SharedResourceState;

/// In-memory persistence for vehicles and their bookings.
///
/// Each vehicle lives behind its own `RwLock`; that lock is the unit of
/// atomicity for check-and-reserve and for the delete cascade. The reservation
/// index only answers "which vehicle owns booking X" and is always updated while
/// the owning vehicle's write lock is held.
pub struct InMemoryStore {
    resources: DashMap<Ulid, SharedResourceState>,
    reservation_to_resource: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            reservation_to_resource: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn contains_resource(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn insert_resource(&self, state: ResourceState) {
        self.resources.insert(state.id, Arc::new(RwLock::new(state)));
    }

    /// Insert a new resource unless its id is taken, returning it already
    /// write-locked so nobody can use it before the caller commits.
    pub fn claim_resource(&self, state: ResourceState) -> Option<OwnedRwLockWriteGuard<ResourceState>> {
        match self.resources.entry(state.id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let shared = Arc::new(RwLock::new(state));
                let guard = shared.clone().try_write_owned().ok()?;
                slot.insert(shared);
                Some(guard)
            }
        }
    }

    /// Undo `claim_resource`. Waiters on the lock see a detached resource.
    pub fn release_resource(&self, rs: &mut ResourceState) {
        rs.detached = true;
        self.resources.remove(&rs.id);
    }

    /// All resource ids in ascending order.
    pub fn resource_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.resources.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    // ── Reservation index ────────────────────────────────────

    pub fn reservation_count(&self) -> usize {
        self.reservation_to_resource.len()
    }

    /// Reserve `id` for a booking on `resource_id`. False if the id is taken.
    /// The caller holds that resource's write lock.
    pub fn claim_reservation(&self, id: Ulid, resource_id: Ulid) -> bool {
        match self.reservation_to_resource.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(resource_id);
                true
            }
        }
    }

    pub fn release_reservation(&self, id: &Ulid) {
        self.reservation_to_resource.remove(id);
    }

    pub fn resource_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_resource
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// All reservation ids in ascending order.
    pub fn reservation_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .reservation_to_resource
            .iter()
            .map(|e| *e.key())
            .collect();
        ids.sort_unstable();
        ids
    }

    // ── Event application ────────────────────────────────────

    /// Apply `event` to a resource whose write lock the caller holds.
    pub fn apply_event(&self, rs: &mut ResourceState, event: &Event) {
        match event {
            Event::ResourceUpdated {
                name,
                capacity_kg,
                tyres,
                ..
            } => {
                rs.name = name.clone();
                rs.capacity_kg = *capacity_kg;
                rs.tyres = *tyres;
            }
            Event::ResourceDeleted { id } => {
                rs.detached = true;
                for r in rs.reservations.drain(..) {
                    self.reservation_to_resource.remove(&r.id);
                }
                self.resources.remove(id);
            }
            Event::ReservationCreated(reservation) => {
                self.reservation_to_resource
                    .insert(reservation.id, reservation.resource_id);
                rs.insert_reservation(reservation.clone());
            }
            Event::ReservationCancelled { id, .. } => {
                rs.remove_reservation(*id);
                self.reservation_to_resource.remove(id);
            }
            // Registration creates the state; there is nothing to apply it to.
            Event::ResourceRegistered { .. } => {}
        }
    }

    /// Rebuild state from one WAL event. Only used while the engine is being
    /// opened, when nothing else can hold a lock.
    pub fn replay_event(&self, event: &Event) {
        if let Event::ResourceRegistered {
            id,
            name,
            capacity_kg,
            tyres,
        } = event
        {
            self.insert_resource(ResourceState::new(*id, name.clone(), *capacity_kg, *tyres));
            return;
        }
        let Some(rs) = event_resource_id(event).and_then(|id| self.get_resource(&id)) else {
            return;
        };
        if let Ok(mut guard) = rs.try_write() {
            self.apply_event(&mut guard, event);
        }
    }
}

/// The resource an event mutates (None for registration).
fn event_resource_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ResourceUpdated { id, .. } | Event::ResourceDeleted { id } => Some(*id),
        Event::ReservationCreated(r) => Some(r.resource_id),
        Event::ReservationCancelled { resource_id, .. } => Some(*resource_id),
        Event::ResourceRegistered { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::LocationCode;

    fn registered(id: Ulid) -> Event {
        Event::ResourceRegistered {
            id,
            name: "Truck".into(),
            capacity_kg: 1000,
            tyres: 6,
        }
    }

    fn created(resource_id: Ulid, start: Ms) -> Reservation {
        let code = LocationCode::parse("110001").unwrap();
        Reservation {
            id: Ulid::new(),
            resource_id,
            origin: code.clone(),
            destination: code,
            span: Span::new(start, start + HOUR_MS),
            requester_id: "c1".into(),
            estimated_hours: 1,
        }
    }

    #[test]
    fn replay_builds_index() {
        let store = InMemoryStore::new();
        let rid = Ulid::new();
        let r = created(rid, 0);
        store.replay_event(&registered(rid));
        store.replay_event(&Event::ReservationCreated(r.clone()));

        assert_eq!(store.resource_count(), 1);
        assert_eq!(store.resource_for_reservation(&r.id), Some(rid));
        let rs = store.get_resource(&rid).unwrap();
        assert_eq!(rs.try_read().unwrap().reservations, vec![r]);
    }

    #[test]
    fn replay_delete_cascades() {
        let store = InMemoryStore::new();
        let keep = Ulid::new();
        let gone = Ulid::new();
        store.replay_event(&registered(keep));
        store.replay_event(&registered(gone));
        let kept = created(keep, 0);
        store.replay_event(&Event::ReservationCreated(kept.clone()));
        store.replay_event(&Event::ReservationCreated(created(gone, 0)));
        store.replay_event(&Event::ReservationCreated(created(gone, 2 * HOUR_MS)));

        store.replay_event(&Event::ResourceDeleted { id: gone });

        assert!(!store.contains_resource(&gone));
        assert_eq!(store.reservation_ids(), vec![kept.id]);
    }

    #[test]
    fn replay_ignores_events_for_unknown_resources() {
        let store = InMemoryStore::new();
        store.replay_event(&Event::ReservationCreated(created(Ulid::new(), 0)));
        assert_eq!(store.reservation_count(), 0);
    }

    #[test]
    fn claims_are_exclusive() {
        let store = InMemoryStore::new();
        let rid = Ulid::new();
        let mut guard = store
            .claim_resource(ResourceState::new(rid, "A".into(), 1000, 6))
            .unwrap();
        assert!(store.claim_resource(ResourceState::new(rid, "B".into(), 1000, 6)).is_none());
        // Claimed but uncommitted: visible, locked.
        assert!(store.get_resource(&rid).unwrap().try_read().is_err());

        let booking = Ulid::new();
        assert!(store.claim_reservation(booking, rid));
        assert!(!store.claim_reservation(booking, Ulid::new()));
        assert_eq!(store.resource_for_reservation(&booking), Some(rid));
        store.release_reservation(&booking);
        assert!(store.claim_reservation(booking, rid));

        store.release_resource(&mut guard);
        assert!(guard.detached);
        assert!(!store.contains_resource(&rid));
    }

    #[test]
    fn resource_ids_sorted() {
        let store = InMemoryStore::new();
        for _ in 0..20 {
            store.replay_event(&registered(Ulid::new()));
        }
        let ids = store.resource_ids();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
