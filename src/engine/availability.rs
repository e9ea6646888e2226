use crate::model::*;

use super::conflict::validate_span;
use super::{Engine, EngineError};

// ── Fleet availability ────────────────────────────────────────────

/// Capacity filter, then conflict filter. Keeps the input order; callers pass
/// resources in ascending id order so results are deterministic.
pub fn select_available<'a>(
    candidates: impl IntoIterator<Item = &'a ResourceState>,
    min_capacity_kg: u32,
    window: &Span,
    estimated_hours: u32,
) -> Vec<AvailableResource> {
    candidates
        .into_iter()
        .filter(|rs| !rs.detached && rs.capacity_kg >= min_capacity_kg)
        .filter(|rs| rs.first_overlapping(window).is_none())
        .map(|rs| AvailableResource {
            resource: rs.info(),
            estimated_hours,
        })
        .collect()
}

impl Engine {
    /// Vehicles able to carry `min_capacity_kg` and free for the whole ride
    /// from `origin` to `destination` starting at `start`.
    ///
    /// Advisory: each vehicle is read under its own read lock, so a vehicle
    /// reported free can still lose a later `create_reservation` race.
    pub async fn find_available(
        &self,
        min_capacity_kg: u32,
        origin: &str,
        destination: &str,
        start: Ms,
    ) -> Result<Vec<AvailableResource>, EngineError> {
        if min_capacity_kg == 0 {
            return Err(EngineError::invalid("required capacity must be positive"));
        }
        let (window, hours) = self.ride_window(origin, destination, start)?;
        validate_span(&window)?;

        let mut available = Vec::new();
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            available.extend(select_available(
                std::iter::once(&*guard),
                min_capacity_kg,
                &window,
                hours,
            ));
        }
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::LocationCode;
    use ulid::Ulid;

    fn vehicle(capacity_kg: u32, bookings: &[(Ms, Ms)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), format!("{capacity_kg}kg"), capacity_kg, 4);
        let code = LocationCode::parse("400001").unwrap();
        for &(start, end) in bookings {
            rs.insert_reservation(Reservation {
                id: Ulid::new(),
                resource_id: rs.id,
                origin: code.clone(),
                destination: code.clone(),
                span: Span::new(start, end),
                requester_id: "c".into(),
                estimated_hours: 0,
            });
        }
        rs
    }

    #[test]
    fn filters_by_capacity() {
        let fleet = [vehicle(500, &[]), vehicle(1000, &[]), vehicle(2000, &[])];
        let out = select_available(&fleet, 1000, &Span::new(0, HOUR_MS), 1);
        let caps: Vec<_> = out.iter().map(|a| a.resource.capacity_kg).collect();
        assert_eq!(caps, vec![1000, 2000]);
        assert!(out.iter().all(|a| a.estimated_hours == 1));
    }

    #[test]
    fn filters_out_conflicting() {
        let fleet = [
            vehicle(1000, &[(0, 10 * HOUR_MS)]),
            vehicle(1000, &[(10 * HOUR_MS, 20 * HOUR_MS)]),
        ];
        let out = select_available(&fleet, 1, &Span::new(5 * HOUR_MS, 10 * HOUR_MS), 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].resource.id, fleet[1].id);
    }

    #[test]
    fn skips_detached() {
        let mut gone = vehicle(1000, &[]);
        gone.detached = true;
        let out = select_available([&gone], 1, &Span::new(0, HOUR_MS), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn empty_fleet() {
        let out = select_available(std::iter::empty(), 1, &Span::new(0, HOUR_MS), 1);
        assert!(out.is_empty());
    }
}
