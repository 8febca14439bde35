use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Error;

/// Link-level events reported by a transport. The connection manager owns
/// the interpretation; transports only report what happened on the wire.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Up,
    Down,
    Message { topic: String, payload: Vec<u8> },
}

/// The underlying publish-subscribe layer: topic fan-out, at-least-once
/// delivery, ordered per topic per link. Reconnection after a drop is the
/// transport's job (fixed backoff), not the connection manager's.
#[async_trait]
pub trait Transport {
    async fn connect(&self) -> Result<(), Error>;
    async fn disconnect(&self) -> Result<(), Error>;
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), Error>;
    async fn subscribe(&self, topic: &str) -> Result<(), Error>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), Error>;
    fn events(&self) -> async_channel::Receiver<TransportEvent>;
}

pub type DynTransport = Arc<dyn Transport + Send + Sync>;
