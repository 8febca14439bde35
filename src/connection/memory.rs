use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::transport::{Transport, TransportEvent};
use crate::error::{transport_error, Error};

const BROKER_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
struct Frame {
    topic: String,
    payload: Vec<u8>,
}

/// In-process broker with topic fan-out and per-topic ordering. Backs the
/// tests and the scripted simulation; a deployment would point the
/// connection manager at a real broker instead.
pub struct Broker {
    bus: broadcast::Sender<Frame>,
}

impl Broker {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BROKER_CAPACITY);

        Self { bus }
    }

    /// A new client link to this broker, one per participant process.
    pub fn client(&self) -> MemoryTransport {
        MemoryTransport::new(self.bus.clone())
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

struct Link {
    up: bool,
    subscriptions: HashSet<String>,
}

pub struct MemoryTransport {
    client_id: String,
    bus: broadcast::Sender<Frame>,
    link: Arc<Mutex<Link>>,
    events_tx: async_channel::Sender<TransportEvent>,
    events_rx: async_channel::Receiver<TransportEvent>,
    connects: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryTransport {
    fn new(bus: broadcast::Sender<Frame>) -> Self {
        let (events_tx, events_rx) = async_channel::unbounded();

        Self {
            client_id: format!("haggle_{:08x}", rand::thread_rng().gen::<u32>()),
            bus,
            link: Arc::new(Mutex::new(Link {
                up: false,
                subscriptions: HashSet::new(),
            })),
            events_tx,
            events_rx,
            connects: AtomicU64::new(0),
            pump: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Number of times `connect` actually established a link.
    pub fn connect_attempts(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    /// Simulates the broker dropping this link. The broker side forgets the
    /// link's subscriptions, as a real broker session would.
    pub fn sever(&self) {
        if let Ok(mut link) = self.link.lock() {
            link.up = false;
            link.subscriptions.clear();
        }

        let _ = self.events_tx.try_send(TransportEvent::Down);
    }

    /// Simulates the transport's built-in reconnect succeeding.
    pub fn restore(&self) {
        if let Ok(mut link) = self.link.lock() {
            link.up = true;
        }

        let _ = self.events_tx.try_send(TransportEvent::Up);
    }

    fn is_up(&self) -> bool {
        self.link.lock().map(|link| link.up).unwrap_or(false)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), Error> {
        let mut pump = self.pump.lock().map_err(|_| transport_error())?;

        if pump.is_some() {
            return Ok(());
        }

        self.connects.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut link) = self.link.lock() {
            link.up = true;
        }

        let _ = self.events_tx.try_send(TransportEvent::Up);

        let mut frames = self.bus.subscribe();
        let link = self.link.clone();
        let events = self.events_tx.clone();
        let client_id = self.client_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        let deliver = link
                            .lock()
                            .map(|link| link.up && link.subscriptions.contains(&frame.topic))
                            .unwrap_or(false);

                        if deliver {
                            let _ = events
                                .send(TransportEvent::Message {
                                    topic: frame.topic,
                                    payload: frame.payload,
                                })
                                .await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(client_id = %client_id, skipped, "broker frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *pump = Some(handle);

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }

        if let Ok(mut link) = self.link.lock() {
            link.up = false;
        }

        let _ = self.events_tx.try_send(TransportEvent::Down);

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error> {
        if !self.is_up() {
            return Err(transport_error());
        }

        // a send error only means no client is currently linked
        let _ = self.bus.send(Frame {
            topic: topic.to_string(),
            payload,
        });

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        if let Ok(mut link) = self.link.lock() {
            link.subscriptions.insert(topic.to_string());
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Error> {
        if let Ok(mut link) = self.link.lock() {
            link.subscriptions.remove(topic);
        }

        Ok(())
    }

    fn events(&self) -> async_channel::Receiver<TransportEvent> {
        self.events_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn frames_reach_subscribed_clients_only() {
        let broker = Broker::new();
        let publisher = broker.client();
        let subscribed = broker.client();
        let bystander = broker.client();

        publisher.connect().await.unwrap();
        subscribed.connect().await.unwrap();
        bystander.connect().await.unwrap();

        subscribed.subscribe("rides/bids/global").await.unwrap();

        publisher
            .publish("rides/bids/global", b"offer".to_vec())
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;

        let mut delivered = Vec::new();
        while let Ok(event) = subscribed.events().try_recv() {
            if let TransportEvent::Message { payload, .. } = event {
                delivered.push(payload);
            }
        }

        assert_eq!(delivered, vec![b"offer".to_vec()]);

        while let Ok(event) = bystander.events().try_recv() {
            assert!(!matches!(event, TransportEvent::Message { .. }));
        }
    }

    #[tokio::test]
    async fn publishing_while_down_fails() {
        let broker = Broker::new();
        let client = broker.client();

        assert_eq!(
            client
                .publish("rides/bids/global", b"offer".to_vec())
                .await
                .unwrap_err()
                .code,
            4
        );

        client.connect().await.unwrap();
        client.sever();

        assert_eq!(
            client
                .publish("rides/bids/global", b"offer".to_vec())
                .await
                .unwrap_err()
                .code,
            4
        );
    }

    #[tokio::test]
    async fn severed_links_lose_their_subscriptions() {
        let broker = Broker::new();
        let publisher = broker.client();
        let subscriber = broker.client();

        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();
        subscriber.subscribe("rides/bids/global").await.unwrap();

        subscriber.sever();
        subscriber.restore();

        publisher
            .publish("rides/bids/global", b"offer".to_vec())
            .await
            .unwrap();

        sleep(Duration::from_millis(20)).await;

        while let Ok(event) = subscriber.events().try_recv() {
            assert!(!matches!(event, TransportEvent::Message { .. }));
        }
    }

    #[tokio::test]
    async fn repeated_connects_keep_one_link() {
        let broker = Broker::new();
        let client = broker.client();

        client.connect().await.unwrap();
        client.connect().await.unwrap();

        assert_eq!(client.connect_attempts(), 1);
    }
}
