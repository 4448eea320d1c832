use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Buffer between a socket's reader task and the event loop.
pub(crate) const EVENT_BUFFER: usize = 256;

/// A request/response transport, e.g. HTTP. One call, one answer.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends a request object (or an array of them) and returns the raw
    /// response body.
    async fn request(&self, payload: Value) -> Result<Value>;
}

/// What a duplex connection reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded JSON message (object or batch array).
    Message(Value),
    /// The connection hit an error. A `Close` follows when it is fatal.
    Error(String),
    /// The connection is gone.
    Close,
    /// A fresh connection is up; subscriptions should be re-established.
    Connect,
}

/// One open duplex connection: text frames out, events in. Dropping
/// `outgoing` closes the connection.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Opens duplex connections (WebSocket, IPC). Called again on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug + 'static {
    async fn connect(&self) -> Result<Connection>;
}
