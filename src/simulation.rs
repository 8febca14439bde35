use futures::future::join_all;
use rand_distr::{Distribution, Normal};
use std::env;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::connection::{Broker, Connection};
use crate::entities::{RideOptions, Role, VehicleClass};
use crate::error::{gateway_error, invalid_invocation_error, Error};
use crate::gateway::{CreateUserParams, GatewayAPI, MemoryGateway, User};
use crate::profile::{Profile, ProfileStore};
use crate::session::{DriverSession, RiderSession};

/// Scripted end-to-end negotiation against the in-process broker and
/// gateway: one rider, two drivers, one request, competing bids, one
/// acceptance.
pub struct Simulation {
    broker: Broker,
    gateway: Arc<MemoryGateway>,
}

impl Simulation {
    pub fn new() -> Self {
        Self {
            broker: Broker::new(),
            gateway: Arc::new(MemoryGateway::new()),
        }
    }

    pub fn gateway(&self) -> &MemoryGateway {
        &self.gateway
    }

    #[tracing::instrument(skip(self))]
    async fn onboard(&self, phone: &str, name: &str, role: Role) -> Result<User, Error> {
        let dispatch = self.gateway.send_otp(phone).await?;
        let code = dispatch
            .dev_code
            .ok_or_else(|| gateway_error("no dev code in dispatch"))?;

        if !self.gateway.verify_otp(phone, &code).await? {
            return Err(gateway_error("otp rejected"));
        }

        let user = self
            .gateway
            .create_user(CreateUserParams {
                phone: phone.into(),
                name: name.into(),
                role,
                last_lat: 0.0,
                last_long: 0.0,
            })
            .await?;

        tracing::info!(user_id = user.id, name = %user.name, "onboarded");

        Ok(user)
    }

    // one connection per participant process
    async fn participant(&self) -> Connection {
        let connection = Connection::new(Arc::new(self.broker.client()));
        connection.connect().await;

        connection
    }

    fn sample_counter(asking: u64) -> u64 {
        let dist = match Normal::new(asking as f64 * 1.1, asking as f64 * 0.1) {
            Ok(dist) => dist,
            Err(_) => return asking,
        };

        dist.sample(&mut rand::thread_rng()).round().max(1.0) as u64
    }

    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<(), Error> {
        let rider = self.onboard("231770000001", "Abraham", Role::Rider).await?;

        let store = ProfileStore::new(
            env::temp_dir().join(format!("haggle-sim-profile-{}.json", rider.id)),
        );
        store
            .save(&Profile {
                user_id: rider.id,
                role: Role::Rider,
            })
            .await?;

        let moses = self.onboard("231770000002", "Moses", Role::Driver).await?;
        let sarah = self.onboard("231770000003", "Sarah", Role::Driver).await?;

        let mut rider_session =
            RiderSession::new(self.participant().await, self.gateway.clone(), rider.id);

        let mut driver_sessions = Vec::new();
        for driver in [&moses, &sarah] {
            let mut session = DriverSession::new(
                self.participant().await,
                self.gateway.clone(),
                driver.id,
                driver.name.clone(),
            );
            session.listen().await;
            driver_sessions.push(session);
        }

        sleep(Duration::from_millis(50)).await;

        let request = rider_session
            .submit_request(
                "Current Location".into(),
                "Market".into(),
                VehicleClass::Bike,
                150,
                RideOptions::default(),
            )
            .await?;

        sleep(Duration::from_millis(50)).await;

        let mut handles = Vec::new();
        let mut accepts_asking_price = true;

        for mut session in driver_sessions {
            let request_id = request.request_id;
            let asking = request.proposed_price;
            let accepts = accepts_asking_price;
            accepts_asking_price = false;

            handles.push(tokio::spawn(async move {
                session.drain().await;

                let result = if accepts {
                    session.submit_bid(request_id, asking).await
                } else {
                    let counter = Self::sample_counter(asking);
                    session
                        .submit_counter(request_id, counter, RideOptions::default())
                        .await
                };

                if let Err(err) = result {
                    tracing::warn!(code = err.code, "bid submission failed");
                }

                session
            }));
        }

        let mut driver_sessions = Vec::new();
        for outcome in join_all(handles).await {
            match outcome {
                Ok(session) => driver_sessions.push(session),
                Err(err) => tracing::error!(?err, "driver task failed"),
            }
        }

        sleep(Duration::from_millis(50)).await;

        let collected = rider_session.drain();
        tracing::info!(collected, "offers on the table");

        let chosen = rider_session
            .collected_bids()
            .iter()
            .min_by_key(|bid| bid.amount)
            .cloned()
            .ok_or_else(invalid_invocation_error)?;

        let ride = rider_session.accept_bid(&chosen).await?;

        tracing::info!(
            ride_id = %ride.id,
            fare = ride.price,
            driver = %chosen.driver_display_name,
            "negotiation complete"
        );

        sleep(Duration::from_millis(50)).await;

        for session in driver_sessions.iter_mut() {
            session.drain().await;
            tracing::info!(
                open_engagements = session.engagements().len(),
                "driver wrapped up"
            );
        }

        Ok(())
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_negotiation_completes() {
        let simulation = Simulation::new();

        simulation.run().await.unwrap();

        let gateway = simulation.gateway();
        assert_eq!(gateway.users().len(), 3);
        assert_eq!(gateway.rides().len(), 1);
        assert!(!gateway.bids().is_empty());
    }
}
