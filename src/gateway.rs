use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::entities::{Role, VehicleClass};
use crate::error::{gateway_error, Error};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub phone: String,
    pub name: String,
    pub role: Role,
    pub last_lat: f64,
    pub last_long: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub rider_id: i64,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub pickup_lat: f64,
    pub pickup_long: f64,
    pub dropoff_lat: f64,
    pub dropoff_long: f64,
    pub vehicle_type: VehicleClass,
    pub status: String,
    pub price: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BidRecord {
    pub id: i64,
    pub ride_id: Uuid,
    pub driver_id: i64,
    pub amount: u64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OtpDispatch {
    pub status: String,
    pub dev_code: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateUserParams {
    pub phone: String,
    pub name: String,
    pub role: Role,
    pub last_lat: f64,
    pub last_long: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateRideParams {
    pub request_id: Uuid,
    pub rider_id: i64,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub pickup_lat: f64,
    pub pickup_long: f64,
    pub dropoff_lat: f64,
    pub dropoff_long: f64,
    pub vehicle_type: VehicleClass,
    pub price: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateBidParams {
    pub request_id: Uuid,
    pub driver_id: i64,
    pub amount: u64,
}

/// The authoritative ride/bid/user store behind a request/response boundary.
/// Failures surface as errors the caller can retry on; an explicit `false`
/// from `verify_otp` is a rejection, distinct from a call that did not
/// complete.
#[async_trait]
pub trait GatewayAPI {
    async fn create_user(&self, params: CreateUserParams) -> Result<User, Error>;
    async fn create_ride(&self, params: CreateRideParams) -> Result<Ride, Error>;
    async fn create_bid(&self, params: CreateBidParams) -> Result<BidRecord, Error>;
    async fn send_otp(&self, phone: &str) -> Result<OtpDispatch, Error>;
    async fn verify_otp(&self, phone: &str, code: &str) -> Result<bool, Error>;
}

pub type DynGateway = Arc<dyn GatewayAPI + Send + Sync>;

pub struct HttpGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: String) -> Result<Self, Error> {
        // gateway calls suspend the caller's flow, so they must not hang
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { base_url, client })
    }

    pub fn from_env() -> Result<Self, Error> {
        Self::new(env::var("HAGGLE_API_BASE")?)
    }
}

#[async_trait]
impl GatewayAPI for HttpGateway {
    #[tracing::instrument(skip(self, params))]
    async fn create_user(&self, params: CreateUserParams) -> Result<User, Error> {
        let res = self
            .client
            .post(format!("{}/users", self.base_url))
            .json(&params)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(gateway_error(res.status()));
        }

        Ok(res.json().await?)
    }

    #[tracing::instrument(skip(self, params))]
    async fn create_ride(&self, params: CreateRideParams) -> Result<Ride, Error> {
        let res = self
            .client
            .post(format!("{}/rides", self.base_url))
            .json(&params)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(gateway_error(res.status()));
        }

        Ok(res.json().await?)
    }

    #[tracing::instrument(skip(self, params))]
    async fn create_bid(&self, params: CreateBidParams) -> Result<BidRecord, Error> {
        let res = self
            .client
            .post(format!("{}/bids", self.base_url))
            .json(&params)
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(gateway_error(res.status()));
        }

        Ok(res.json().await?)
    }

    #[tracing::instrument(skip(self))]
    async fn send_otp(&self, phone: &str) -> Result<OtpDispatch, Error> {
        let res = self
            .client
            .post(format!("{}/auth/send-otp", self.base_url))
            .json(&serde_json::json!({ "phone": phone }))
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(gateway_error(res.status()));
        }

        Ok(res.json().await?)
    }

    #[tracing::instrument(skip(self, code))]
    async fn verify_otp(&self, phone: &str, code: &str) -> Result<bool, Error> {
        let res = self
            .client
            .post(format!("{}/auth/verify-otp", self.base_url))
            .json(&serde_json::json!({ "phone": phone, "code": code }))
            .send()
            .await?;

        let status = res.status();

        if status.is_success() {
            return Ok(true);
        }

        // 4xx is an explicit rejection, anything else did not complete
        if status.is_client_error() {
            return Ok(false);
        }

        Err(gateway_error(status))
    }
}

/// In-process gateway backing the tests and the scripted simulation.
pub struct MemoryGateway {
    next_user_id: AtomicI64,
    next_bid_id: AtomicI64,
    users: Mutex<Vec<User>>,
    rides: Mutex<Vec<Ride>>,
    bids: Mutex<Vec<BidRecord>>,
    otp_codes: Mutex<HashMap<String, String>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            next_user_id: AtomicI64::new(1),
            next_bid_id: AtomicI64::new(1),
            users: Mutex::new(Vec::new()),
            rides: Mutex::new(Vec::new()),
            bids: Mutex::new(Vec::new()),
            otp_codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn users(&self) -> Vec<User> {
        self.users.lock().map(|users| users.clone()).unwrap_or_default()
    }

    pub fn rides(&self) -> Vec<Ride> {
        self.rides.lock().map(|rides| rides.clone()).unwrap_or_default()
    }

    pub fn bids(&self) -> Vec<BidRecord> {
        self.bids.lock().map(|bids| bids.clone()).unwrap_or_default()
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GatewayAPI for MemoryGateway {
    async fn create_user(&self, params: CreateUserParams) -> Result<User, Error> {
        let user = User {
            id: self.next_user_id.fetch_add(1, Ordering::Relaxed),
            phone: params.phone,
            name: params.name,
            role: params.role,
            last_lat: params.last_lat,
            last_long: params.last_long,
            created_at: Utc::now(),
        };

        self.users
            .lock()
            .map_err(gateway_error)?
            .push(user.clone());

        Ok(user)
    }

    async fn create_ride(&self, params: CreateRideParams) -> Result<Ride, Error> {
        let ride = Ride {
            id: params.request_id,
            rider_id: params.rider_id,
            pickup_address: params.pickup_address,
            dropoff_address: params.dropoff_address,
            pickup_lat: params.pickup_lat,
            pickup_long: params.pickup_long,
            dropoff_lat: params.dropoff_lat,
            dropoff_long: params.dropoff_long,
            vehicle_type: params.vehicle_type,
            status: "requested".into(),
            price: params.price,
            created_at: Utc::now(),
        };

        self.rides
            .lock()
            .map_err(gateway_error)?
            .push(ride.clone());

        Ok(ride)
    }

    async fn create_bid(&self, params: CreateBidParams) -> Result<BidRecord, Error> {
        let bid = BidRecord {
            id: self.next_bid_id.fetch_add(1, Ordering::Relaxed),
            ride_id: params.request_id,
            driver_id: params.driver_id,
            amount: params.amount,
            status: "pending".into(),
            created_at: Utc::now(),
        };

        self.bids.lock().map_err(gateway_error)?.push(bid.clone());

        Ok(bid)
    }

    async fn send_otp(&self, phone: &str) -> Result<OtpDispatch, Error> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));

        self.otp_codes
            .lock()
            .map_err(gateway_error)?
            .insert(phone.to_string(), code.clone());

        Ok(OtpDispatch {
            status: "sent".into(),
            dev_code: Some(code),
        })
    }

    async fn verify_otp(&self, phone: &str, code: &str) -> Result<bool, Error> {
        let mut codes = self.otp_codes.lock().map_err(gateway_error)?;

        match codes.get(phone) {
            // codes are single use
            Some(stored) if stored == code => {
                codes.remove(phone);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
