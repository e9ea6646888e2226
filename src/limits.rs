use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REQUESTER_LEN: usize = 256;

pub const MIN_CAPACITY_KG: u32 = 1;
pub const MIN_TYRES: u32 = 2;

/// Location codes on the wire are Indian-style six digit pincodes.
pub const PINCODE_LEN: usize = 6;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_000;
