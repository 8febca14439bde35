//! Wire-level topic names and payload codecs for the negotiation protocol.
//!
//! Requests and bids are broadcast on single global topics and filtered
//! client-side; the per-participant variants (`driver/{id}/requests`,
//! `rides/bid/{id}`) are supported as an alternate addressing scheme. A
//! production deployment would shard these by geohash or ride id, and that
//! change is confined to this module.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::{Bid, RideOptions, RideRequest, VehicleClass};
use crate::error::{parse_error, Error};

pub const RIDE_REQUESTS: &str = "rides/request/global";
pub const RIDE_BIDS: &str = "rides/bids/global";

pub fn driver_requests(driver_id: i64) -> String {
    format!("driver/{}/requests", driver_id)
}

pub fn ride_bids(request_id: &Uuid) -> String {
    format!("rides/bid/{}", request_id)
}

pub fn ride_closed(request_id: &Uuid) -> String {
    format!("rides/closed/{}", request_id)
}

/// A message decoded off the wire.
#[derive(Clone, Debug)]
pub enum Inbound {
    Request(RideRequest),
    Bid(Bid),
    Closed { request_id: Uuid },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestFrame {
    request_id: Uuid,
    pickup: String,
    destination: String,
    vehicle_type: VehicleClass,
    #[serde(with = "lenient_amount")]
    price: u64,
    #[serde(default)]
    options: RideOptions,
    ts: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BidFrame {
    ride_id: Uuid,
    // legacy broadcast payloads carried only the display name
    #[serde(default)]
    driver_id: i64,
    driver_name: String,
    #[serde(with = "lenient_amount")]
    amount: u64,
    ts: i64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedFrame {
    ride_id: Uuid,
    ts: i64,
}

// The original client published prices as strings; accept both on the way in
// and always emit numbers on the way out.
mod lenient_amount {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(value),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

pub fn encode_request(request: &RideRequest) -> Result<(String, Vec<u8>), Error> {
    let payload = serde_json::to_vec(&request_frame(request))?;

    Ok((RIDE_REQUESTS.to_string(), payload))
}

/// Targeted variant of `encode_request`; same payload, addressed topic.
pub fn encode_request_for_driver(
    request: &RideRequest,
    driver_id: i64,
) -> Result<(String, Vec<u8>), Error> {
    let payload = serde_json::to_vec(&request_frame(request))?;

    Ok((driver_requests(driver_id), payload))
}

pub fn encode_bid(bid: &Bid) -> Result<(String, Vec<u8>), Error> {
    let payload = serde_json::to_vec(&bid_frame(bid))?;

    Ok((RIDE_BIDS.to_string(), payload))
}

/// Per-ride variant of `encode_bid`; same payload, addressed topic.
pub fn encode_bid_addressed(bid: &Bid) -> Result<(String, Vec<u8>), Error> {
    let payload = serde_json::to_vec(&bid_frame(bid))?;

    Ok((ride_bids(&bid.request_id), payload))
}

pub fn encode_closure(request_id: &Uuid) -> Result<(String, Vec<u8>), Error> {
    let frame = ClosedFrame {
        ride_id: *request_id,
        ts: Utc::now().timestamp_millis(),
    };

    let payload = serde_json::to_vec(&frame)?;

    Ok((ride_closed(request_id), payload))
}

/// Parses a payload into one of the expected message shapes. Any failure is
/// "ignore this message" to callers, never a fatal condition.
pub fn decode(payload: &[u8]) -> Result<Inbound, Error> {
    if let Ok(frame) = serde_json::from_slice::<RequestFrame>(payload) {
        let request = RideRequest::restore(
            frame.request_id,
            frame.pickup,
            frame.destination,
            frame.vehicle_type,
            frame.price,
            frame.options,
            decode_timestamp(frame.ts)?,
        )
        .map_err(|_| parse_error("request payload violates invariants"))?;

        return Ok(Inbound::Request(request));
    }

    // a bid payload also satisfies the closed shape, so bids are tried first
    if let Ok(frame) = serde_json::from_slice::<BidFrame>(payload) {
        let bid = Bid::restore(
            frame.ride_id,
            frame.driver_id,
            frame.driver_name,
            frame.amount,
            decode_timestamp(frame.ts)?,
        )
        .map_err(|_| parse_error("bid payload violates invariants"))?;

        return Ok(Inbound::Bid(bid));
    }

    if let Ok(frame) = serde_json::from_slice::<ClosedFrame>(payload) {
        return Ok(Inbound::Closed {
            request_id: frame.ride_id,
        });
    }

    Err(parse_error("payload matches no known message shape"))
}

fn request_frame(request: &RideRequest) -> RequestFrame {
    RequestFrame {
        request_id: request.request_id,
        pickup: request.pickup_label.clone(),
        destination: request.destination_label.clone(),
        vehicle_type: request.vehicle_class,
        price: request.proposed_price,
        options: request.options,
        ts: request.created_at.timestamp_millis(),
    }
}

fn bid_frame(bid: &Bid) -> BidFrame {
    BidFrame {
        ride_id: bid.request_id,
        driver_id: bid.driver_id,
        driver_name: bid.driver_display_name.clone(),
        amount: bid.amount,
        ts: bid.created_at.timestamp_millis(),
    }
}

fn decode_timestamp(ts: i64) -> Result<DateTime<Utc>, Error> {
    Utc.timestamp_millis_opt(ts)
        .single()
        .ok_or_else(|| parse_error("timestamp out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RideRequest {
        RideRequest::new(
            "Current Location".into(),
            "Market".into(),
            VehicleClass::Taxi,
            150,
            RideOptions {
                air_conditioning: true,
            },
        )
        .unwrap()
    }

    #[test]
    fn request_round_trip_is_exact() {
        let request = sample_request();
        let (topic, payload) = encode_request(&request).unwrap();

        assert_eq!(topic, RIDE_REQUESTS);

        match decode(&payload).unwrap() {
            Inbound::Request(decoded) => assert_eq!(decoded, request),
            other => panic!("decoded wrong shape: {:?}", other),
        }
    }

    #[test]
    fn bid_round_trip_is_exact() {
        let bid = Bid::new(Uuid::new_v4(), 2, "Moses".into(), 140).unwrap();
        let (topic, payload) = encode_bid(&bid).unwrap();

        assert_eq!(topic, RIDE_BIDS);

        match decode(&payload).unwrap() {
            Inbound::Bid(decoded) => assert_eq!(decoded, bid),
            other => panic!("decoded wrong shape: {:?}", other),
        }
    }

    #[test]
    fn string_prices_from_legacy_clients_decode() {
        let payload = serde_json::json!({
            "requestId": Uuid::new_v4(),
            "pickup": "Current Location",
            "destination": "Market",
            "vehicleType": "Bike",
            "price": "150",
            "ts": 1_700_000_000_000i64,
        });

        match decode(payload.to_string().as_bytes()).unwrap() {
            Inbound::Request(request) => assert_eq!(request.proposed_price, 150),
            other => panic!("decoded wrong shape: {:?}", other),
        }
    }

    #[test]
    fn legacy_bids_without_driver_id_decode() {
        let payload = serde_json::json!({
            "rideId": Uuid::new_v4(),
            "amount": 160,
            "driverName": "Sarah",
            "ts": 1_700_000_000_000i64,
        });

        match decode(payload.to_string().as_bytes()).unwrap() {
            Inbound::Bid(bid) => {
                assert_eq!(bid.driver_id, 0);
                assert_eq!(bid.driver_display_name, "Sarah");
            }
            other => panic!("decoded wrong shape: {:?}", other),
        }
    }

    #[test]
    fn bid_payloads_do_not_decode_as_closures() {
        let bid = Bid::new(Uuid::new_v4(), 2, "Moses".into(), 140).unwrap();
        let (_, payload) = encode_bid_addressed(&bid).unwrap();

        assert!(matches!(decode(&payload).unwrap(), Inbound::Bid(_)));
    }

    #[test]
    fn closure_round_trip() {
        let request_id = Uuid::new_v4();
        let (topic, payload) = encode_closure(&request_id).unwrap();

        assert_eq!(topic, format!("rides/closed/{}", request_id));

        match decode(&payload).unwrap() {
            Inbound::Closed { request_id: id } => assert_eq!(id, request_id),
            other => panic!("decoded wrong shape: {:?}", other),
        }
    }

    #[test]
    fn garbage_yields_parse_error() {
        assert_eq!(decode(b"not json").unwrap_err().code, 3);
        assert_eq!(decode(b"{\"hello\":\"world\"}").unwrap_err().code, 3);
    }

    #[test]
    fn zero_priced_request_payloads_are_rejected() {
        let payload = serde_json::json!({
            "requestId": Uuid::new_v4(),
            "pickup": "Current Location",
            "destination": "Market",
            "vehicleType": "Bike",
            "price": 0,
            "ts": 1_700_000_000_000i64,
        });

        assert_eq!(decode(payload.to_string().as_bytes()).unwrap_err().code, 3);
    }

    #[test]
    fn addressed_topics_embed_the_participant() {
        let request = sample_request();

        let (topic, _) = encode_request_for_driver(&request, 2).unwrap();
        assert_eq!(topic, "driver/2/requests");

        let bid = Bid::new(request.request_id, 2, "Moses".into(), 140).unwrap();
        let (topic, _) = encode_bid_addressed(&bid).unwrap();
        assert_eq!(topic, format!("rides/bid/{}", request.request_id));
    }
}
