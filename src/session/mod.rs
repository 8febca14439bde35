mod driver;
mod rider;

pub use driver::{DriverSession, Engagement, EngagementStatus};
pub use rider::{RiderSession, Status as RiderStatus};
