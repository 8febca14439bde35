mod memory;
mod transport;

pub use memory::{Broker, MemoryTransport};
pub use transport::{DynTransport, Transport, TransportEvent};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
}

type StatusCallback = Box<dyn Fn(Status) + Send + Sync>;

/// One process-wide link to the pub/sub transport, injected into sessions.
/// Owns the subscription set and fans inbound payloads out to per-topic
/// streams, so handlers never re-check topic identity themselves.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    transport: DynTransport,
    status: Mutex<Status>,
    listeners: Mutex<HashMap<u64, StatusCallback>>,
    next_listener_id: AtomicU64,
    routes: Mutex<HashMap<String, Vec<async_channel::Sender<Vec<u8>>>>>,
    subscriptions: Mutex<HashSet<String>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Disposable handle for one status callback; dropping it removes exactly
/// that callback.
pub struct StatusListener {
    id: u64,
    registry: Weak<Inner>,
}

impl StatusListener {
    pub fn cancel(self) {}
}

impl Drop for StatusListener {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if let Ok(mut listeners) = inner.listeners.lock() {
                listeners.remove(&self.id);
            }
        }
    }
}

/// Ordered stream of raw payloads for a single topic.
pub struct TopicStream {
    topic: String,
    receiver: async_channel::Receiver<Vec<u8>>,
}

impl TopicStream {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.receiver.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }
}

impl Connection {
    pub fn new(transport: DynTransport) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                status: Mutex::new(Status::Disconnected),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(0),
                routes: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashSet::new()),
                pump: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> Status {
        self.inner
            .status
            .lock()
            .map(|status| *status)
            .unwrap_or(Status::Disconnected)
    }

    /// Establishes the link; no-op while a connection already exists or is
    /// in progress. Link failures are absorbed here, the transport retries
    /// with its own backoff.
    #[tracing::instrument(skip(self))]
    pub async fn connect(&self) {
        match self.status() {
            Status::Disconnected => {}
            _ => return,
        }

        self.inner.set_status(Status::Connecting);

        let events = self.inner.transport.events();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            Inner::pump(inner, events).await;
        });

        if let Ok(mut pump) = self.inner.pump.lock() {
            *pump = Some(handle);
        }

        if let Err(err) = self.inner.transport.connect().await {
            tracing::warn!(code = err.code, "transport connect failed, awaiting retry");
        }
    }

    /// Tears the link down and forgets all routes. The connection can be
    /// re-established with `connect`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if let Ok(mut pump) = self.inner.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }

        if let Err(err) = self.inner.transport.disconnect().await {
            tracing::warn!(code = err.code, "transport disconnect failed");
        }

        if let Ok(mut routes) = self.inner.routes.lock() {
            routes.clear();
        }

        if let Ok(mut subscriptions) = self.inner.subscriptions.lock() {
            subscriptions.clear();
        }

        self.inner.set_status(Status::Disconnected);
    }

    /// Registers a status callback, fired immediately with the current
    /// status and on every transition after that.
    pub fn add_status_listener<F>(&self, callback: F) -> StatusListener
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        callback(self.status());

        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.insert(id, Box::new(callback));
        }

        StatusListener {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Messages sent while the link is down are dropped, not queued; the
    /// protocol has no outbox.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) {
        if self.status() != Status::Connected {
            tracing::warn!(topic, "cannot publish, connection is not up");
            return;
        }

        if let Err(err) = self.inner.transport.publish(topic, payload).await {
            tracing::warn!(topic, code = err.code, "publish failed");
        }
    }

    /// Adds the topic to the subscription set (idempotent) and returns a
    /// stream of its payloads. Subscriptions are replayed onto the
    /// transport whenever the link comes back up.
    pub async fn subscribe(&self, topic: &str) -> TopicStream {
        let (sender, receiver) = async_channel::unbounded();

        if let Ok(mut routes) = self.inner.routes.lock() {
            routes.entry(topic.to_string()).or_default().push(sender);
        }

        let newly_subscribed = self
            .inner
            .subscriptions
            .lock()
            .map(|mut subscriptions| subscriptions.insert(topic.to_string()))
            .unwrap_or(false);

        if newly_subscribed {
            if let Err(err) = self.inner.transport.subscribe(topic).await {
                tracing::warn!(topic, code = err.code, "transport subscribe failed");
            }
        }

        TopicStream {
            topic: topic.to_string(),
            receiver,
        }
    }

    /// Removes the topic from the subscription set and closes its streams.
    /// Messages already queued on a stream may still be observed by its
    /// holder. Safe to call for topics never subscribed.
    pub async fn unsubscribe(&self, topic: &str) {
        if let Ok(mut routes) = self.inner.routes.lock() {
            routes.remove(topic);
        }

        let was_subscribed = self
            .inner
            .subscriptions
            .lock()
            .map(|mut subscriptions| subscriptions.remove(topic))
            .unwrap_or(false);

        if was_subscribed {
            if let Err(err) = self.inner.transport.unsubscribe(topic).await {
                tracing::warn!(topic, code = err.code, "transport unsubscribe failed");
            }
        }
    }
}

impl Inner {
    async fn pump(inner: Arc<Inner>, events: async_channel::Receiver<TransportEvent>) {
        while let Ok(event) = events.recv().await {
            match event {
                TransportEvent::Up => {
                    inner.set_status(Status::Connected);
                    inner.resubscribe().await;
                }
                TransportEvent::Down => {
                    inner.set_status(Status::Connecting);
                }
                TransportEvent::Message { topic, payload } => {
                    inner.dispatch(&topic, payload);
                }
            }
        }
    }

    fn set_status(&self, next: Status) {
        {
            let mut status = match self.status.lock() {
                Ok(status) => status,
                Err(_) => return,
            };

            if *status == next {
                return;
            }

            *status = next;
        }

        tracing::info!(status = ?next, "connection status changed");

        if let Ok(listeners) = self.listeners.lock() {
            for callback in listeners.values() {
                callback(next);
            }
        }
    }

    // a broker session drop forgets server-side subscriptions, so the set
    // is replayed on every link-up
    async fn resubscribe(&self) {
        let topics: Vec<String> = self
            .subscriptions
            .lock()
            .map(|subscriptions| subscriptions.iter().cloned().collect())
            .unwrap_or_default();

        for topic in topics {
            if let Err(err) = self.transport.subscribe(&topic).await {
                tracing::warn!(topic, code = err.code, "resubscribe failed");
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: Vec<u8>) {
        if let Ok(mut routes) = self.routes.lock() {
            if let Some(senders) = routes.get_mut(topic) {
                senders.retain(|sender| sender.try_send(payload.clone()).is_ok());
            }
        }
    }
}
