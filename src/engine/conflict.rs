use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_start(start: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(EngineError::invalid("start time out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    validate_start(span.start)?;
    if span.end < span.start || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::invalid("end time out of range"));
    }
    Ok(())
}

/// Fails with `Conflict` naming the earliest reservation on `rs` that overlaps
/// `span`. The caller must hold the resource lock for the answer to stay true.
pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match rs.first_overlapping(span) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid("name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity_kg: u32) -> Result<(), EngineError> {
    if capacity_kg < MIN_CAPACITY_KG {
        return Err(EngineError::invalid(format!(
            "capacity must be at least {MIN_CAPACITY_KG} kg"
        )));
    }
    Ok(())
}

pub(crate) fn validate_tyres(tyres: u32) -> Result<(), EngineError> {
    if tyres < MIN_TYRES {
        return Err(EngineError::invalid(format!(
            "a vehicle needs at least {MIN_TYRES} tyres"
        )));
    }
    Ok(())
}

pub(crate) fn validate_requester(requester_id: &str) -> Result<(), EngineError> {
    if requester_id.trim().is_empty() {
        return Err(EngineError::invalid("requester id must not be empty"));
    }
    if requester_id.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::invalid("requester id too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::LocationCode;
    use ulid::Ulid;

    fn with_bookings(spans: &[(Ms, Ms)]) -> ResourceState {
        let mut rs = ResourceState::new(Ulid::new(), "Truck".into(), 1000, 6);
        let code = LocationCode::parse("110001").unwrap();
        for &(start, end) in spans {
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
    fn back_to_back_is_free() {
        let rs = with_bookings(&[(10 * HOUR_MS, 20 * HOUR_MS)]);
        assert!(check_no_conflict(&rs, &Span::new(20 * HOUR_MS, 22 * HOUR_MS)).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(5 * HOUR_MS, 10 * HOUR_MS)).is_ok());
    }

    #[test]
    fn conflict_names_existing_booking() {
        let rs = with_bookings(&[(100, 200), (300, 400)]);
        let expected = rs.reservations[1].id;
        assert_eq!(
            check_no_conflict(&rs, &Span::new(250, 350)),
            Err(EngineError::Conflict(expected))
        );
    }

    #[test]
    fn contained_and_containing_windows_conflict() {
        let rs = with_bookings(&[(100, 400)]);
        assert!(check_no_conflict(&rs, &Span::new(200, 300)).is_err());
        assert!(check_no_conflict(&rs, &Span::new(0, 1000)).is_err());
    }

    #[test]
    fn gap_between_bookings_is_free() {
        let rs = with_bookings(&[(0, 100), (200, 300), (400, 500)]);
        assert!(check_no_conflict(&rs, &Span::new(100, 200)).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(300, 400)).is_ok());
        assert!(check_no_conflict(&rs, &Span::new(299, 400)).is_err());
    }

    #[test]
    fn span_limits() {
        assert!(validate_span(&Span::new(0, HOUR_MS)).is_ok());
        assert!(validate_span(&Span::new(-1, HOUR_MS)).is_err());
        assert!(validate_span(&Span::new(MAX_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS + 1)).is_err());
    }

    #[test]
    fn attribute_rules() {
        assert!(validate_name("Truck A").is_ok());
        assert!(validate_name("   ").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(validate_capacity(0).is_err());
        assert!(validate_capacity(1).is_ok());
        assert!(validate_tyres(1).is_err());
        assert!(validate_tyres(2).is_ok());
        assert!(validate_requester("").is_err());
        assert!(validate_requester("customer123").is_ok());
    }
}
