use std::collections::HashMap;
use uuid::Uuid;

use crate::connection::{Connection, Status as ConnectionStatus, TopicStream};
use crate::entities::{Bid, RideOptions, RideRequest};
use crate::error::{invalid_invocation_error, Error};
use crate::gateway::{CreateBidParams, DynGateway};
use crate::topics::{self, Inbound};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngagementStatus {
    Pending,
    BidSent { amount: u64 },
}

/// One inbound request this driver may act on.
pub struct Engagement {
    pub request: RideRequest,
    pub status: EngagementStatus,
}

/// Discovers broadcast ride requests and submits bids against them. The
/// session stays in its listening steady state for its whole lifetime;
/// each engagement advances independently from Pending to BidSent.
pub struct DriverSession {
    connection: Connection,
    gateway: DynGateway,
    driver_id: i64,
    display_name: String,
    engagements: Vec<Engagement>,
    request_streams: Vec<TopicStream>,
    closure_streams: HashMap<Uuid, TopicStream>,
}

impl DriverSession {
    pub fn new(
        connection: Connection,
        gateway: DynGateway,
        driver_id: i64,
        display_name: String,
    ) -> Self {
        Self {
            connection,
            gateway,
            driver_id,
            display_name,
            engagements: Vec::new(),
            request_streams: Vec::new(),
            closure_streams: HashMap::new(),
        }
    }

    pub fn is_listening(&self) -> bool {
        !self.request_streams.is_empty()
    }

    /// Open engagements, most recent first.
    pub fn engagements(&self) -> &[Engagement] {
        &self.engagements
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Subscribes the global request broadcast and this driver's targeted
    /// topic. Idempotent.
    #[tracing::instrument(skip(self))]
    pub async fn listen(&mut self) {
        if self.is_listening() {
            return;
        }

        let global = self.connection.subscribe(topics::RIDE_REQUESTS).await;
        let targeted = self
            .connection
            .subscribe(&topics::driver_requests(self.driver_id))
            .await;

        self.request_streams = vec![global, targeted];

        tracing::info!(driver_id = self.driver_id, "listening for ride requests");
    }

    /// Absorbs queued requests and closure notices. A request arriving on
    /// both the targeted and the global topic lands once; closed requests
    /// leave the list. Returns how many new requests were absorbed.
    pub async fn drain(&mut self) -> usize {
        let mut inbound = Vec::new();

        for stream in &self.request_streams {
            while let Some(payload) = stream.try_recv() {
                inbound.push(payload);
            }
        }

        let mut absorbed = 0;

        for payload in inbound {
            match topics::decode(&payload) {
                Ok(Inbound::Request(request)) => {
                    if self.is_engaged(&request.request_id) {
                        tracing::debug!(request_id = %request.request_id, "duplicate request delivery, ignoring");
                        continue;
                    }

                    tracing::info!(
                        request_id = %request.request_id,
                        price = request.proposed_price,
                        "ride request received"
                    );

                    let closed = self
                        .connection
                        .subscribe(&topics::ride_closed(&request.request_id))
                        .await;
                    self.closure_streams.insert(request.request_id, closed);

                    self.engagements.insert(
                        0,
                        Engagement {
                            request,
                            status: EngagementStatus::Pending,
                        },
                    );

                    absorbed += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(code = err.code, "undecodable payload on request topic, ignoring");
                }
            }
        }

        let mut closed_ids = Vec::new();

        for (request_id, stream) in &self.closure_streams {
            while let Some(payload) = stream.try_recv() {
                if matches!(topics::decode(&payload), Ok(Inbound::Closed { .. })) {
                    closed_ids.push(*request_id);
                }
            }
        }

        for request_id in closed_ids {
            self.engagements
                .retain(|engagement| engagement.request.request_id != request_id);
            self.closure_streams.remove(&request_id);
            self.connection
                .unsubscribe(&topics::ride_closed(&request_id))
                .await;

            tracing::info!(request_id = %request_id, "request closed by rider");
        }

        absorbed
    }

    /// Records the bid with the gateway (the authoritative write), then
    /// broadcasts it for the rider's live screen. The two channels are
    /// separate on purpose; the broadcast shares publish's silent-drop
    /// semantics while the gateway write can fail and be retried.
    #[tracing::instrument(skip(self))]
    pub async fn submit_bid(&mut self, request_id: Uuid, amount: u64) -> Result<Bid, Error> {
        let position = self
            .engagements
            .iter()
            .position(|engagement| engagement.request.request_id == request_id)
            .ok_or_else(invalid_invocation_error)?;

        let bid = Bid::new(request_id, self.driver_id, self.display_name.clone(), amount)?;

        self.gateway
            .create_bid(CreateBidParams {
                request_id,
                driver_id: self.driver_id,
                amount,
            })
            .await?;

        let (topic, payload) = topics::encode_bid(&bid)?;
        self.connection.publish(&topic, payload).await;

        self.engagements[position].status = EngagementStatus::BidSent { amount };

        tracing::info!(request_id = %request_id, amount, "bid submitted");

        Ok(bid)
    }

    /// A counter-offer is a bid at a different price and/or feature set;
    /// the proposed options must fit the request's vehicle class.
    #[tracing::instrument(skip(self))]
    pub async fn submit_counter(
        &mut self,
        request_id: Uuid,
        amount: u64,
        options: RideOptions,
    ) -> Result<Bid, Error> {
        let engagement = self
            .engagements
            .iter()
            .find(|engagement| engagement.request.request_id == request_id)
            .ok_or_else(invalid_invocation_error)?;

        options.validate_for(engagement.request.vehicle_class)?;

        self.submit_bid(request_id, amount).await
    }

    fn is_engaged(&self, request_id: &Uuid) -> bool {
        self.engagements
            .iter()
            .any(|engagement| engagement.request.request_id == *request_id)
    }
}
