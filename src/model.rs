use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::estimator::LocationCode;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
///
/// Zero-length spans are allowed (a ride between identical codes takes zero
/// hours); they occupy no time but still overlap any span strictly containing
/// their instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    /// Window occupied by a ride of `hours` starting at `start`.
    pub fn for_hours(start: Ms, hours: u32) -> Self {
        Self::new(start, start + hours as Ms * HOUR_MS)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A committed booking of one vehicle for one ride.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub origin: LocationCode,
    pub destination: LocationCode,
    /// `span.end == span.start + estimated_hours` hours, always.
    pub span: Span,
    pub requester_id: String,
    pub estimated_hours: u32,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: Ulid,
    pub name: String,
    pub capacity_kg: u32,
    pub tyres: u32,
    /// Live reservations sorted by `(span.start, span.end)`. They never overlap,
    /// so `span.end` is non-decreasing along the vector as well.
    pub reservations: Vec<Reservation>,
    /// Set under the write lock when the resource is deleted. Anyone still holding
    /// the handle must treat the resource as gone.
    pub detached: bool,
}

impl ResourceState {
    pub fn new(id: Ulid, name: String, capacity_kg: u32, tyres: u32) -> Self {
        Self {
            id,
            name,
            capacity_kg,
            tyres,
            reservations: Vec::new(),
            detached: false,
        }
    }

    /// Insert reservation maintaining sort order by `(start, end)`.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let key = (reservation.span.start, reservation.span.end);
        let pos = self
            .reservations
            .binary_search_by_key(&key, |r| (r.span.start, r.span.end))
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Remove reservation by id.
    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    /// Index of the first reservation whose end lies after `t`.
    fn first_ending_after(&self, t: Ms) -> usize {
        self.reservations.partition_point(|r| r.span.end <= t)
    }

    /// The reservation overlapping `query` with the earliest start, if any.
    ///
    /// One binary search plus one comparison: every reservation before the
    /// partition point ends at or before `query.start`, and everything after the
    /// first candidate starts no earlier than it does.
    pub fn first_overlapping(&self, query: &Span) -> Option<&Reservation> {
        let idx = self.first_ending_after(query.start);
        self.reservations.get(idx).filter(|r| r.span.overlaps(query))
    }

    /// All reservations overlapping `query`, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let idx = self.first_ending_after(query.start);
        let end = query.end;
        self.reservations[idx..]
            .iter()
            .take_while(move |r| r.span.start < end)
    }

    pub fn info(&self) -> ResourceInfo {
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            capacity_kg: self.capacity_kg,
            tyres: self.tyres,
        }
    }
}

/// Partial update of a vehicle's attributes; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<String>,
    pub capacity_kg: Option<u32>,
    pub tyres: Option<u32>,
}

impl ResourcePatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.capacity_kg.is_none() && self.tyres.is_none()
    }
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
    },
    ResourceUpdated {
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
    },
    ResourceDeleted {
        id: Ulid,
    },
    ReservationCreated(Reservation),
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity_kg: u32,
    pub tyres: u32,
}

/// A reservation joined with the current attributes of its vehicle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationInfo {
    pub id: Ulid,
    pub resource: ResourceInfo,
    pub origin: LocationCode,
    pub destination: LocationCode,
    pub start: Ms,
    pub end: Ms,
    pub requester_id: String,
    pub estimated_hours: u32,
}

impl ReservationInfo {
    pub fn join(reservation: &Reservation, resource: ResourceInfo) -> Self {
        Self {
            id: reservation.id,
            resource,
            origin: reservation.origin.clone(),
            destination: reservation.destination.clone(),
            start: reservation.span.start,
            end: reservation.span.end,
            requester_id: reservation.requester_id.clone(),
            estimated_hours: reservation.estimated_hours,
        }
    }
}

/// One row of a fleet availability search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableResource {
    pub resource: ResourceInfo,
    pub estimated_hours: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> LocationCode {
        LocationCode::parse(s).unwrap()
    }

    fn reservation(start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource_id: Ulid::nil(),
            origin: code("110001"),
            destination: code("110001"),
            span: Span::new(start, end),
            requester_id: "c".into(),
            estimated_hours: 0,
        }
    }

    fn truck() -> ResourceState {
        ResourceState::new(Ulid::new(), "Truck".into(), 1000, 6)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // back-to-back
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_for_hours() {
        let s = Span::for_hours(1000, 19);
        assert_eq!(s.end - s.start, 19 * HOUR_MS);
        assert_eq!(Span::for_hours(1000, 0), Span::new(1000, 1000));
    }

    #[test]
    fn zero_length_span_overlaps_only_strict_containers() {
        let point = Span::new(150, 150);
        assert!(point.overlaps(&Span::new(100, 200)));
        assert!(!point.overlaps(&Span::new(150, 200)));
        assert!(!point.overlaps(&Span::new(100, 150)));
        assert!(!point.overlaps(&point));
    }

    #[test]
    fn reservations_kept_in_start_order() {
        let mut rs = truck();
        rs.insert_reservation(reservation(300, 400));
        rs.insert_reservation(reservation(100, 200));
        rs.insert_reservation(reservation(200, 300));
        let starts: Vec<_> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn zero_length_sorts_before_same_start() {
        let mut rs = truck();
        rs.insert_reservation(reservation(200, 300));
        rs.insert_reservation(reservation(200, 200));
        rs.insert_reservation(reservation(100, 200));
        let ends: Vec<_> = rs.reservations.iter().map(|r| r.span.end).collect();
        assert_eq!(ends, vec![200, 200, 300]);
    }

    #[test]
    fn remove_reservation_by_id() {
        let mut rs = truck();
        let r = reservation(100, 200);
        let id = r.id;
        rs.insert_reservation(r);
        assert!(rs.remove_reservation(Ulid::new()).is_none());
        assert_eq!(rs.remove_reservation(id).map(|r| r.id), Some(id));
        assert!(rs.reservations.is_empty());
    }

    #[test]
    fn first_overlapping_finds_conflict() {
        let mut rs = truck();
        rs.insert_reservation(reservation(100, 200));
        rs.insert_reservation(reservation(450, 600));
        rs.insert_reservation(reservation(1000, 1100));

        let hit = rs.first_overlapping(&Span::new(500, 800)).unwrap();
        assert_eq!(hit.span, Span::new(450, 600));
        assert!(rs.first_overlapping(&Span::new(600, 1000)).is_none());
        assert!(rs.first_overlapping(&Span::new(0, 100)).is_none());
        assert!(rs.first_overlapping(&Span::new(2000, 3000)).is_none());
    }

    #[test]
    fn first_overlapping_candidate_spanning_many() {
        let mut rs = truck();
        for i in 0..10 {
            rs.insert_reservation(reservation(i * 100, i * 100 + 50));
        }
        let hit = rs.first_overlapping(&Span::new(220, 10_000)).unwrap();
        assert_eq!(hit.span.start, 300);
    }

    #[test]
    fn first_overlapping_single_ms() {
        let mut rs = truck();
        rs.insert_reservation(reservation(100, 201));
        assert!(rs.first_overlapping(&Span::new(200, 300)).is_some());
        assert!(rs.first_overlapping(&Span::new(201, 300)).is_none());
    }

    #[test]
    fn overlapping_collects_all_in_order() {
        let mut rs = truck();
        rs.insert_reservation(reservation(0, 100));
        rs.insert_reservation(reservation(100, 200));
        rs.insert_reservation(reservation(200, 300));
        rs.insert_reservation(reservation(300, 400));
        let hits: Vec<_> = rs
            .overlapping(&Span::new(150, 301))
            .map(|r| r.span.start)
            .collect();
        assert_eq!(hits, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_empty_resource() {
        let rs = truck();
        assert_eq!(rs.overlapping(&Span::new(0, 1000)).count(), 0);
        assert!(rs.first_overlapping(&Span::new(0, 1000)).is_none());
    }

    #[test]
    fn patch_emptiness() {
        assert!(ResourcePatch::default().is_empty());
        let p = ResourcePatch {
            tyres: Some(4),
            ..Default::default()
        };
        assert!(!p.is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated(reservation(0, HOUR_MS));
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
