use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{timestamp_now, RideOptions, VehicleClass};
use crate::error::{validation_error, Error};

/// A rider's broadcast intent to travel, carrying a proposed price.
/// Immutable once published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub request_id: Uuid,
    pub pickup_label: String,
    pub destination_label: String,
    pub vehicle_class: VehicleClass,
    pub proposed_price: u64,
    pub options: RideOptions,
    pub created_at: DateTime<Utc>,
}

impl RideRequest {
    pub fn new(
        pickup_label: String,
        destination_label: String,
        vehicle_class: VehicleClass,
        proposed_price: u64,
        options: RideOptions,
    ) -> Result<Self, Error> {
        Self::restore(
            Uuid::new_v4(),
            pickup_label,
            destination_label,
            vehicle_class,
            proposed_price,
            options,
            timestamp_now(),
        )
    }

    /// Rebuilds a request from wire fields, applying the same invariants as
    /// local construction.
    pub fn restore(
        request_id: Uuid,
        pickup_label: String,
        destination_label: String,
        vehicle_class: VehicleClass,
        proposed_price: u64,
        options: RideOptions,
        created_at: DateTime<Utc>,
    ) -> Result<Self, Error> {
        if proposed_price == 0 {
            return Err(validation_error());
        }

        if pickup_label.is_empty() || destination_label.is_empty() {
            return Err(validation_error());
        }

        options.validate_for(vehicle_class)?;

        Ok(Self {
            request_id,
            pickup_label,
            destination_label,
            vehicle_class,
            proposed_price,
            options,
            created_at,
        })
    }
}
