use ulid::Ulid;

use crate::estimator::{LocationCode, MAX_ESTIMATED_HOURS};
use crate::model::*;

use super::conflict::validate_start;
use super::{Engine, EngineError};

impl Engine {
    pub(super) fn location(&self, code: &str) -> Result<LocationCode, EngineError> {
        LocationCode::parse(code)
    }

    /// Run the configured estimator and hold it to the `[0, 23]` contract.
    pub(super) fn estimate_hours(
        &self,
        origin: &LocationCode,
        destination: &LocationCode,
    ) -> Result<u32, EngineError> {
        let hours = self.estimator.estimate_hours(origin, destination);
        if hours > MAX_ESTIMATED_HOURS {
            return Err(EngineError::invalid(format!(
                "estimated ride of {hours}h exceeds {MAX_ESTIMATED_HOURS}h"
            )));
        }
        Ok(hours)
    }

    /// The window a ride from `origin` to `destination` starting at `start`
    /// would occupy, and its length in hours.
    pub(super) fn ride_window(
        &self,
        origin: &str,
        destination: &str,
        start: Ms,
    ) -> Result<(Span, u32), EngineError> {
        validate_start(start)?;
        let hours = self.estimate_duration_hours(origin, destination)?;
        Ok((Span::for_hours(start, hours), hours))
    }

    /// Estimated ride length in whole hours, using this engine's estimator.
    pub fn estimate_duration_hours(
        &self,
        origin: &str,
        destination: &str,
    ) -> Result<u32, EngineError> {
        let origin = self.location(origin)?;
        let destination = self.location(destination)?;
        self.estimate_hours(&origin, &destination)
    }

    pub async fn get_resource(&self, id: Ulid) -> Result<ResourceInfo, EngineError> {
        let rs = self
            .store
            .get_resource(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.detached {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard.info())
    }

    /// Every vehicle, ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut out = Vec::with_capacity(self.store.resource_count());
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if !guard.detached {
                out.push(guard.info());
            }
        }
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<ReservationInfo, EngineError> {
        let resource_id = self
            .store
            .resource_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        if guard.detached {
            return Err(EngineError::NotFound(id));
        }
        let reservation = guard.reservation(id).ok_or(EngineError::NotFound(id))?;
        Ok(ReservationInfo::join(reservation, guard.info()))
    }

    /// Every booking across the fleet, ordered by id.
    pub async fn list_reservations(&self) -> Vec<ReservationInfo> {
        let mut out = Vec::with_capacity(self.store.reservation_count());
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.detached {
                continue;
            }
            let info = guard.info();
            out.extend(
                guard
                    .reservations
                    .iter()
                    .map(|r| ReservationInfo::join(r, info.clone())),
            );
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Bookings on one vehicle, in start order.
    pub async fn list_reservations_for(
        &self,
        resource_id: Ulid,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.detached {
            return Err(EngineError::NotFound(resource_id));
        }
        let info = guard.info();
        Ok(guard
            .reservations
            .iter()
            .map(|r| ReservationInfo::join(r, info.clone()))
            .collect())
    }

    /// Bookings on `resource_id` whose window overlaps `span`, in start order.
    pub async fn find_reservations_overlapping(
        &self,
        resource_id: Ulid,
        span: &Span,
    ) -> Result<Vec<ReservationInfo>, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.detached {
            return Err(EngineError::NotFound(resource_id));
        }
        let info = guard.info();
        Ok(guard
            .overlapping(span)
            .map(|r| ReservationInfo::join(r, info.clone()))
            .collect())
    }

    /// Whether `span` overlaps any booking on `resource_id`. Advisory, like
    /// `find_available`: only `create_reservation` decides under the lock.
    pub async fn has_conflict(&self, resource_id: Ulid, span: &Span) -> Result<bool, EngineError> {
        let rs = self
            .store
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        if guard.detached {
            return Err(EngineError::NotFound(resource_id));
        }
        Ok(guard.first_overlapping(span).is_some())
    }
}
