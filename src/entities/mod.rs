mod bid;
mod request;
mod role;
mod vehicle;

pub use bid::Bid;
pub use request::RideRequest;
pub use role::Role;
pub use vehicle::{RideOptions, VehicleClass};

use chrono::{DateTime, TimeZone, Utc};

// Wire timestamps carry millisecond precision, so entity timestamps are
// truncated at construction to keep encode/decode round trips exact.
pub(crate) fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();

    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}
