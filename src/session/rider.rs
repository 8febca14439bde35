use crate::connection::{Connection, Status as ConnectionStatus, TopicStream};
use crate::entities::{Bid, RideOptions, RideRequest, VehicleClass};
use crate::error::{invalid_invocation_error, Error};
use crate::gateway::{CreateRideParams, DynGateway, Ride};
use crate::topics::{self, Inbound};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Idle,
    Searching,
    Confirmed,
    Cancelled,
}

/// Drives one outstanding ride request: publish, aggregate competing bids,
/// then accept exactly one or cancel. Owned by the screen that created it
/// and discarded with it; nothing survives the session.
pub struct RiderSession {
    connection: Connection,
    gateway: DynGateway,
    rider_id: i64,
    status: Status,
    active_request: Option<RideRequest>,
    collected_bids: Vec<Bid>,
    bid_stream: Option<TopicStream>,
}

impl RiderSession {
    pub fn new(connection: Connection, gateway: DynGateway, rider_id: i64) -> Self {
        Self {
            connection,
            gateway,
            rider_id,
            status: Status::Idle,
            active_request: None,
            collected_bids: Vec::new(),
            bid_stream: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn active_request(&self) -> Option<&RideRequest> {
        self.active_request.as_ref()
    }

    /// Collected bids, most recent first.
    pub fn collected_bids(&self) -> &[Bid] {
        &self.collected_bids
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Broadcasts a fresh request and starts collecting bids. Validation
    /// failures surface before anything is published.
    #[tracing::instrument(skip(self))]
    pub async fn submit_request(
        &mut self,
        pickup_label: String,
        destination_label: String,
        vehicle_class: VehicleClass,
        proposed_price: u64,
        options: RideOptions,
    ) -> Result<RideRequest, Error> {
        match self.status {
            Status::Idle | Status::Cancelled => {}
            _ => return Err(invalid_invocation_error()),
        }

        let request = RideRequest::new(
            pickup_label,
            destination_label,
            vehicle_class,
            proposed_price,
            options,
        )?;

        self.collected_bids.clear();
        self.bid_stream = Some(self.connection.subscribe(topics::RIDE_BIDS).await);

        let (topic, payload) = topics::encode_request(&request)?;
        self.connection.publish(&topic, payload).await;

        tracing::info!(request_id = %request.request_id, price = request.proposed_price, "ride request published");

        self.active_request = Some(request.clone());
        self.status = Status::Searching;

        Ok(request)
    }

    /// Absorbs every bid currently queued on the stream, newest first in
    /// the collection. Bids for other requests and undecodable payloads
    /// are dropped; anything arriving after the session left `Searching`
    /// is dropped too. Returns how many bids were kept.
    pub fn drain(&mut self) -> usize {
        let stream = match &self.bid_stream {
            Some(stream) => stream,
            None => return 0,
        };

        let mut absorbed = 0;

        while let Some(payload) = stream.try_recv() {
            match topics::decode(&payload) {
                Ok(Inbound::Bid(bid)) => {
                    if self.status != Status::Searching {
                        tracing::debug!("bid arrived after session closed, ignoring");
                        continue;
                    }

                    let matches_active = self
                        .active_request
                        .as_ref()
                        .map(|request| request.request_id == bid.request_id)
                        .unwrap_or(false);

                    if !matches_active {
                        tracing::debug!(request_id = %bid.request_id, "bid answers another request, ignoring");
                        continue;
                    }

                    tracing::info!(driver = %bid.driver_display_name, amount = bid.amount, "bid received");

                    self.collected_bids.insert(0, bid);
                    absorbed += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(code = err.code, "undecodable payload on bid topic, ignoring");
                }
            }
        }

        absorbed
    }

    /// Purely local: the request is abandoned and drivers are not told.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&mut self) -> Result<(), Error> {
        match self.status {
            Status::Searching => {}
            _ => return Err(invalid_invocation_error()),
        }

        self.connection.unsubscribe(topics::RIDE_BIDS).await;
        self.bid_stream = None;
        self.active_request = None;
        self.collected_bids.clear();
        self.status = Status::Cancelled;

        tracing::info!("ride request cancelled");

        Ok(())
    }

    /// Records the acceptance with the gateway, then tells competing
    /// drivers the request is closed. A gateway failure leaves the session
    /// in `Searching` so the caller can retry.
    #[tracing::instrument(skip(self, bid), fields(driver = %bid.driver_display_name, amount = bid.amount))]
    pub async fn accept_bid(&mut self, bid: &Bid) -> Result<Ride, Error> {
        match self.status {
            Status::Searching => {}
            _ => return Err(invalid_invocation_error()),
        }

        let request = match &self.active_request {
            Some(request) if request.request_id == bid.request_id => request.clone(),
            _ => return Err(invalid_invocation_error()),
        };

        let ride = self
            .gateway
            .create_ride(CreateRideParams {
                request_id: request.request_id,
                rider_id: self.rider_id,
                pickup_address: request.pickup_label.clone(),
                dropoff_address: request.destination_label.clone(),
                // device location is resolved outside the negotiation core
                pickup_lat: 0.0,
                pickup_long: 0.0,
                dropoff_lat: 0.0,
                dropoff_long: 0.0,
                vehicle_type: request.vehicle_class,
                price: bid.amount,
            })
            .await?;

        let (topic, payload) = topics::encode_closure(&request.request_id)?;
        self.connection.publish(&topic, payload).await;

        self.connection.unsubscribe(topics::RIDE_BIDS).await;
        self.bid_stream = None;
        self.active_request = None;
        self.collected_bids.clear();
        self.status = Status::Confirmed;

        tracing::info!(ride_id = %ride.id, "ride confirmed");

        Ok(ride)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Broker, MemoryTransport, Transport};
    use crate::gateway::MemoryGateway;
    use crate::session::test_support::FailingGateway;
    use std::sync::Arc;
    use tokio::time::{sleep, Duration};
    use uuid::Uuid;

    struct Fixture {
        broker: Broker,
        gateway: Arc<MemoryGateway>,
        feed: MemoryTransport,
        session: RiderSession,
    }

    async fn fixture() -> Fixture {
        let broker = Broker::new();
        let gateway = Arc::new(MemoryGateway::new());

        let connection = Connection::new(Arc::new(broker.client()));
        connection.connect().await;

        let feed = broker.client();
        feed.connect().await.unwrap();

        sleep(Duration::from_millis(20)).await;

        let session = RiderSession::new(connection, gateway.clone(), 1);

        Fixture {
            broker,
            gateway,
            feed,
            session,
        }
    }

    async fn publish_bid(feed: &MemoryTransport, request_id: Uuid, driver: &str, amount: u64) {
        let bid = Bid::new(request_id, 2, driver.into(), amount).unwrap();
        let (topic, payload) = topics::encode_bid(&bid).unwrap();

        feed.publish(&topic, payload).await.unwrap();
    }

    async fn searching_session(fixture: &mut Fixture) -> RideRequest {
        let request = fixture
            .session
            .submit_request(
                "Current Location".into(),
                "Market".into(),
                VehicleClass::Bike,
                150,
                RideOptions::default(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;

        request
    }

    #[tokio::test]
    async fn bids_collect_in_reverse_arrival_order() {
        let mut fixture = fixture().await;
        let request = searching_session(&mut fixture).await;

        assert_eq!(fixture.session.connection_status(), ConnectionStatus::Connected);

        publish_bid(&fixture.feed, request.request_id, "Moses", 140).await;
        publish_bid(&fixture.feed, request.request_id, "Sarah", 160).await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(fixture.session.drain(), 2);

        let bids = fixture.session.collected_bids();
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].driver_display_name, "Sarah");
        assert_eq!(bids[0].amount, 160);
        assert_eq!(bids[1].driver_display_name, "Moses");
        assert_eq!(bids[1].amount, 140);
    }

    #[tokio::test]
    async fn accepting_a_bid_confirms_and_clears() {
        let mut fixture = fixture().await;
        let request = searching_session(&mut fixture).await;

        let closed_observer = fixture.broker.client();
        closed_observer.connect().await.unwrap();
        closed_observer
            .subscribe(&topics::ride_closed(&request.request_id))
            .await
            .unwrap();

        publish_bid(&fixture.feed, request.request_id, "Moses", 140).await;
        publish_bid(&fixture.feed, request.request_id, "Sarah", 160).await;
        sleep(Duration::from_millis(20)).await;
        fixture.session.drain();

        let chosen = fixture.session.collected_bids()[0].clone();
        let ride = fixture.session.accept_bid(&chosen).await.unwrap();

        assert_eq!(ride.id, request.request_id);
        assert_eq!(ride.price, 160);
        assert_eq!(fixture.session.status(), Status::Confirmed);
        assert!(fixture.session.collected_bids().is_empty());
        assert!(fixture.session.active_request().is_none());
        assert_eq!(fixture.gateway.rides().len(), 1);

        // competing drivers are told the request is gone
        sleep(Duration::from_millis(20)).await;
        let mut closure_seen = false;
        while let Ok(event) = closed_observer.events().try_recv() {
            if let crate::connection::TransportEvent::Message { topic, .. } = event {
                closure_seen = topic == topics::ride_closed(&request.request_id);
            }
        }
        assert!(closure_seen);
    }

    #[tokio::test]
    async fn bids_for_other_requests_are_filtered_out() {
        let mut fixture = fixture().await;
        let request = searching_session(&mut fixture).await;

        publish_bid(&fixture.feed, Uuid::new_v4(), "Moses", 140).await;
        publish_bid(&fixture.feed, request.request_id, "Sarah", 160).await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(fixture.session.drain(), 1);
        assert_eq!(fixture.session.collected_bids().len(), 1);
        assert_eq!(
            fixture.session.collected_bids()[0].driver_display_name,
            "Sarah"
        );
    }

    #[tokio::test]
    async fn invalid_requests_fail_before_anything_is_published() {
        let mut fixture = fixture().await;

        let observer = fixture.broker.client();
        observer.connect().await.unwrap();
        observer.subscribe(topics::RIDE_REQUESTS).await.unwrap();
        sleep(Duration::from_millis(20)).await;

        let err = fixture
            .session
            .submit_request(
                "Current Location".into(),
                "Market".into(),
                VehicleClass::Bike,
                0,
                RideOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, 101);
        assert_eq!(fixture.session.status(), Status::Idle);

        sleep(Duration::from_millis(20)).await;
        while let Ok(event) = observer.events().try_recv() {
            assert!(!matches!(
                event,
                crate::connection::TransportEvent::Message { .. }
            ));
        }
    }

    #[tokio::test]
    async fn bids_after_cancel_change_nothing() {
        let mut fixture = fixture().await;
        let request = searching_session(&mut fixture).await;

        fixture.session.cancel().await.unwrap();
        assert_eq!(fixture.session.status(), Status::Cancelled);

        publish_bid(&fixture.feed, request.request_id, "Moses", 140).await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(fixture.session.drain(), 0);
        assert_eq!(fixture.session.status(), Status::Cancelled);
        assert!(fixture.session.collected_bids().is_empty());
        assert!(fixture.session.active_request().is_none());
    }

    #[tokio::test]
    async fn cancelled_sessions_can_search_again() {
        let mut fixture = fixture().await;
        let first = searching_session(&mut fixture).await;

        fixture.session.cancel().await.unwrap();

        let second = fixture
            .session
            .submit_request(
                "Current Location".into(),
                "Waterside".into(),
                VehicleClass::Keke,
                200,
                RideOptions::default(),
            )
            .await
            .unwrap();

        assert_ne!(first.request_id, second.request_id);
        assert_eq!(fixture.session.status(), Status::Searching);
    }

    #[tokio::test]
    async fn bid_collection_survives_connection_flaps() {
        let broker = Broker::new();
        let rider_transport = Arc::new(broker.client());
        let connection = Connection::new(rider_transport.clone());
        connection.connect().await;

        let feed = broker.client();
        feed.connect().await.unwrap();
        sleep(Duration::from_millis(20)).await;

        let gateway = Arc::new(MemoryGateway::new());
        let mut session = RiderSession::new(connection, gateway, 1);

        let request = session
            .submit_request(
                "Current Location".into(),
                "Market".into(),
                VehicleClass::Bike,
                150,
                RideOptions::default(),
            )
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        publish_bid(&feed, request.request_id, "Moses", 140).await;
        sleep(Duration::from_millis(20)).await;

        rider_transport.sever();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(session.connection_status(), ConnectionStatus::Connecting);

        rider_transport.restore();
        sleep(Duration::from_millis(20)).await;

        publish_bid(&feed, request.request_id, "Sarah", 160).await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(session.drain(), 2);
        assert_eq!(session.collected_bids()[0].driver_display_name, "Sarah");
        assert_eq!(session.collected_bids()[1].driver_display_name, "Moses");
    }

    #[tokio::test]
    async fn gateway_failure_keeps_the_session_searching() {
        let broker = Broker::new();
        let connection = Connection::new(Arc::new(broker.client()));
        connection.connect().await;

        let feed = broker.client();
        feed.connect().await.unwrap();
        sleep(Duration::from_millis(20)).await;

        let mut session = RiderSession::new(connection, Arc::new(FailingGateway), 1);
        let request = session
            .submit_request(
                "Current Location".into(),
                "Market".into(),
                VehicleClass::Bike,
                150,
                RideOptions::default(),
            )
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;
        publish_bid(&feed, request.request_id, "Moses", 140).await;
        sleep(Duration::from_millis(20)).await;
        session.drain();

        let chosen = session.collected_bids()[0].clone();
        let err = session.accept_bid(&chosen).await.unwrap_err();

        assert_eq!(err.code, 2);
        assert_eq!(session.status(), Status::Searching);
        assert_eq!(session.collected_bids().len(), 1);
        assert!(session.active_request().is_some());
    }

    #[tokio::test]
    async fn wrong_state_invocations_are_rejected() {
        let mut fixture = fixture().await;

        let stray = Bid::new(Uuid::new_v4(), 2, "Moses".into(), 140).unwrap();
        assert_eq!(
            fixture.session.accept_bid(&stray).await.unwrap_err().code,
            100
        );
        assert_eq!(fixture.session.cancel().await.unwrap_err().code, 100);

        searching_session(&mut fixture).await;

        let err = fixture
            .session
            .submit_request(
                "Current Location".into(),
                "Market".into(),
                VehicleClass::Bike,
                150,
                RideOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code, 100);
    }
}
