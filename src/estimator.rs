//! Ride duration estimation.
//!
//! The only estimator shipped is a placeholder: the absolute difference of the
//! two numeric location codes, modulo 24. It has no geographic meaning (two
//! neighbouring codes and two codes on opposite coasts can yield the same
//! duration) and must not be read as a distance model. It sits behind
//! [`DurationEstimator`] so a real routing service can replace it without
//! touching conflict detection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Longest ride any estimator may report, in hours.
pub const MAX_ESTIMATED_HOURS: u32 = 23;

/// A numeric location code (postal code) as supplied by the caller.
///
/// The original text is kept for display, so leading zeros survive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocationCode {
    text: String,
    value: u64,
}

impl LocationCode {
    /// Accepts any non-empty run of ASCII digits that fits in a `u64`.
    /// Length rules (e.g. six-digit pincodes) belong to the caller.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(EngineError::Validation(format!(
                "location code must be numeric, got {text:?}"
            )));
        }
        let value = text
            .parse::<u64>()
            .map_err(|_| EngineError::Validation(format!("location code too large: {text}")))?;
        Ok(Self {
            text: text.to_string(),
            value,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for LocationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Maps a route to a whole number of hours in `[0, MAX_ESTIMATED_HOURS]`.
pub trait DurationEstimator: Send + Sync {
    fn estimate_hours(&self, origin: &LocationCode, destination: &LocationCode) -> u32;
}

/// `|destination - origin| mod 24`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PincodeDistance;

impl DurationEstimator for PincodeDistance {
    fn estimate_hours(&self, origin: &LocationCode, destination: &LocationCode) -> u32 {
        (origin.value().abs_diff(destination.value()) % 24) as u32
    }
}

/// Parse both codes and run the default estimator.
pub fn estimate_duration_hours(origin: &str, destination: &str) -> Result<u32, EngineError> {
    let origin = LocationCode::parse(origin)?;
    let destination = LocationCode::parse(destination)?;
    Ok(PincodeDistance.estimate_hours(&origin, &destination))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_route() {
        assert_eq!(estimate_duration_hours("110001", "110020").unwrap(), 19);
    }

    #[test]
    fn symmetric() {
        for (a, b) in [("110001", "110020"), ("400001", "560034"), ("1", "999999")] {
            assert_eq!(
                estimate_duration_hours(a, b).unwrap(),
                estimate_duration_hours(b, a).unwrap()
            );
        }
    }

    #[test]
    fn wraps_at_24() {
        assert_eq!(estimate_duration_hours("100000", "100024").unwrap(), 0);
        assert_eq!(estimate_duration_hours("100000", "100047").unwrap(), 23);
        assert_eq!(estimate_duration_hours("123456", "123456").unwrap(), 0);
    }

    #[test]
    fn always_in_range() {
        for d in 0..200u64 {
            let h = PincodeDistance.estimate_hours(
                &LocationCode::parse("500000").unwrap(),
                &LocationCode::parse(&(500000 + d * 7).to_string()).unwrap(),
            );
            assert!(h <= MAX_ESTIMATED_HOURS);
        }
    }

    #[test]
    fn rejects_non_numeric() {
        for bad in ["", "11a001", "-110001", " 110001", "1.5"] {
            assert!(
                matches!(LocationCode::parse(bad), Err(EngineError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(matches!(
            estimate_duration_hours("abc", "110001"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn rejects_overflow() {
        assert!(LocationCode::parse("99999999999999999999999").is_err());
    }

    #[test]
    fn keeps_leading_zeros() {
        let c = LocationCode::parse("000123").unwrap();
        assert_eq!(c.as_str(), "000123");
        assert_eq!(c.value(), 123);
        assert_eq!(c.to_string(), "000123");
    }

    #[test]
    fn pluggable() {
        struct Fixed(u32);
        impl DurationEstimator for Fixed {
            fn estimate_hours(&self, _: &LocationCode, _: &LocationCode) -> u32 {
                self.0
            }
        }
        let est: Box<dyn DurationEstimator> = Box::new(Fixed(5));
        let a = LocationCode::parse("1").unwrap();
        assert_eq!(est.estimate_hours(&a, &a), 5);
    }
}
