//! Wire representation of timestamps (nanoseconds since the Unix epoch).
//!
//! A value of `0` on the wire means "not set", so the epoch instant itself
//! cannot be carried.

use chrono::{DateTime, Utc};

use crate::error::{CoreError, CoreResult};

/// Convert a timestamp to nanoseconds since the epoch.
///
/// Fails for instants outside the range representable by an `i64` of
/// nanoseconds (roughly years 1677 through 2262) and for the epoch itself.
pub fn to_unix_nanos(time: DateTime<Utc>) -> CoreResult<i64> {
    match time.timestamp_nanos_opt() {
        Some(0) => Err(CoreError::EpochReserved),
        Some(nanos) => Ok(nanos),
        None => Err(CoreError::time_out_of_range(time.to_rfc3339())),
    }
}

/// Convert nanoseconds since the epoch back to a timestamp; `0` maps to `None`.
pub fn from_unix_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        None
    } else {
        Some(DateTime::from_timestamp_nanos(nanos))
    }
}
