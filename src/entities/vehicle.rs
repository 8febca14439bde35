use serde::{Deserialize, Serialize};

use crate::error::{validation_error, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleClass {
    Bike,
    Keke,
    Taxi,
}

impl VehicleClass {
    pub fn supports_air_conditioning(&self) -> bool {
        match self {
            Self::Taxi => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideOptions {
    #[serde(rename = "ac", default)]
    pub air_conditioning: bool,
}

impl RideOptions {
    pub fn validate_for(&self, vehicle_class: VehicleClass) -> Result<(), Error> {
        if self.air_conditioning && !vehicle_class.supports_air_conditioning() {
            return Err(validation_error());
        }

        Ok(())
    }
}
