use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_no_conflict, validate_capacity, validate_name, validate_requester, validate_span,
    validate_start, validate_tyres,
};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_resource(
        &self,
        id: Ulid,
        name: String,
        capacity_kg: u32,
        tyres: u32,
    ) -> Result<ResourceInfo, EngineError> {
        validate_name(&name)?;
        validate_capacity(capacity_kg)?;
        validate_tyres(tyres)?;
        let _commit = self.compaction_gate.read().await;
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::invalid("too many vehicles"));
        }
        // Claimed write-locked: bookings on it wait until the registration is
        // durable, and a failed append leaves nothing behind.
        let Some(mut guard) = self
            .store
            .claim_resource(ResourceState::new(id, name.clone(), capacity_kg, tyres))
        else {
            return Err(EngineError::AlreadyExists(id));
        };

        let event = Event::ResourceRegistered {
            id,
            name,
            capacity_kg,
            tyres,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.store.release_resource(&mut guard);
            return Err(e);
        }
        Ok(guard.info())
    }

    /// Partial update. Bookings already made are left as they are.
    pub async fn update_resource(
        &self,
        id: Ulid,
        patch: ResourcePatch,
    ) -> Result<ResourceInfo, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::invalid("nothing to update"));
        }
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(capacity_kg) = patch.capacity_kg {
            validate_capacity(capacity_kg)?;
        }
        if let Some(tyres) = patch.tyres {
            validate_tyres(tyres)?;
        }

        let mut guard = self.lock_resource(id).await?;
        let event = Event::ResourceUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            capacity_kg: patch.capacity_kg.unwrap_or(guard.capacity_kg),
            tyres: patch.tyres.unwrap_or(guard.tyres),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Remove a vehicle and every booking on it, atomically with respect to
    /// bookings on the same vehicle. Returns how many bookings went with it.
    pub async fn delete_resource(&self, id: Ulid) -> Result<usize, EngineError> {
        let mut guard = self.lock_resource(id).await?;
        let deleted = guard.reservations.len();
        self.persist_and_apply(&mut guard, &Event::ResourceDeleted { id })
            .await?;
        Ok(deleted)
    }

    /// Atomic check-and-reserve.
    ///
    /// Duration and window are derived from the route, then under the vehicle's
    /// write lock: existence check, conflict check, id claim, WAL append,
    /// insert. Two
    /// overlapping requests for the same vehicle serialize on that lock and the
    /// second one sees the first one's booking.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        origin: &str,
        destination: &str,
        start: Ms,
        requester_id: &str,
    ) -> Result<ReservationInfo, EngineError> {
        validate_requester(requester_id)?;
        let origin = self.location(origin)?;
        let destination = self.location(destination)?;
        let estimated_hours = self.estimate_hours(&origin, &destination)?;
        validate_start(start)?;
        let span = Span::for_hours(start, estimated_hours);
        validate_span(&span)?;

        let mut guard = self.lock_resource(resource_id).await?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_RESOURCE {
            return Err(EngineError::invalid("too many bookings on vehicle"));
        }
        check_no_conflict(&guard, &span)?;
        if !self.store.claim_reservation(id, resource_id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let reservation = Reservation {
            id,
            resource_id,
            origin,
            destination,
            span,
            requester_id: requester_id.to_string(),
            estimated_hours,
        };
        let info = ReservationInfo::join(&reservation, guard.info());
        if let Err(e) = self
            .persist_and_apply(&mut guard, &Event::ReservationCreated(reservation))
            .await
        {
            self.store.release_reservation(&id);
            return Err(e);
        }
        Ok(info)
    }

    /// Remove one booking. Nothing else changes.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        let mut guard = self.lock_reservation_owner(id).await?;
        let event = Event::ReservationCancelled {
            id,
            resource_id: guard.id,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    /// No-op for in-memory engines.
    ///
    /// The snapshot is taken and queued with the commit section held
    /// exclusively, so every append the writer has not yet seen lands after
    /// the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let commit = self.compaction_gate.write().await;
        let mut events = Vec::new();
        for id in self.store.resource_ids() {
            let Some(rs) = self.store.get_resource(&id) else {
                continue;
            };
            let guard = rs.read().await;
            if guard.detached {
                continue;
            }
            events.push(Event::ResourceRegistered {
                id: guard.id,
                name: guard.name.clone(),
                capacity_kg: guard.capacity_kg,
                tyres: guard.tyres,
            });
            events.extend(
                guard
                    .reservations
                    .iter()
                    .cloned()
                    .map(Event::ReservationCreated),
            );
        }

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        drop(commit);

        metrics::counter!(crate::observability::COMPACTIONS_TOTAL).increment(1);
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Appends since the last compaction; always 0 for in-memory engines.
    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let count = self
            .wal_request(|response| WalCommand::AppendsSinceCompact { response })
            .await?;
        Ok(count.unwrap_or(0))
    }
}
