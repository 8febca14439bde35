use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::timestamp_now;
use crate::error::{validation_error, Error};

/// A driver's answer to a ride request. The `request_id` is a back-reference,
/// not an ownership relation; a driver may submit more than one bid for the
/// same request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub request_id: Uuid,
    pub driver_id: i64,
    pub driver_display_name: String,
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

impl Bid {
    pub fn new(
        request_id: Uuid,
        driver_id: i64,
        driver_display_name: String,
        amount: u64,
    ) -> Result<Self, Error> {
        Self::restore(
            request_id,
            driver_id,
            driver_display_name,
            amount,
            timestamp_now(),
        )
    }

    pub fn restore(
        request_id: Uuid,
        driver_id: i64,
        driver_display_name: String,
        amount: u64,
        created_at: DateTime<Utc>,
    ) -> Result<Self, Error> {
        if amount == 0 {
            return Err(validation_error());
        }

        if driver_display_name.is_empty() {
            return Err(validation_error());
        }

        Ok(Self {
            request_id,
            driver_id,
            driver_display_name,
            amount,
            created_at,
        })
    }
}
