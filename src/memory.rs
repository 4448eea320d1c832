//! In-process duplex transport.
//!
//! Every `connect` on a [`MemoryConnector`] hands the other end of the new
//! connection to the paired [`MemoryServer`] as a [`MemoryPeer`], which can
//! read requests and push responses, notifications and connection events.

use crate::{
    error::{Error, Result},
    transport::{Connection, Connector, TransportEvent, EVENT_BUFFER},
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    online: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryServer) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            MemoryConnector {
                peers,
                online: online.clone(),
                attempts: attempts.clone(),
            },
            MemoryServer {
                accepted: Mutex::new(accepted),
                online,
                attempts,
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Connection("memory server is offline".to_string()));
        }

        let (outgoing, requests) = mpsc::channel(EVENT_BUFFER);
        let (events, incoming) = mpsc::channel(EVENT_BUFFER);
        self.peers
            .send(MemoryPeer { requests, events })
            .map_err(|_| Error::Connection("memory server is gone".to_string()))?;

        Ok(Connection { outgoing, incoming })
    }
}

#[derive(Debug)]
pub struct MemoryServer {
    accepted: Mutex<mpsc::UnboundedReceiver<MemoryPeer>>,
    online: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryServer {
    /// Waits for the next connection. `None` once the connector is dropped.
    pub async fn accept(&self) -> Option<MemoryPeer> {
        self.accepted.lock().await.recv().await
    }

    /// While offline every connect attempt fails.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Server side of one in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    requests: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next frame the client sent, decoded. `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Value> {
        let text = self.requests.recv().await?;
        serde_json::from_str(&text).ok()
    }

    pub async fn reply(&self, message: Value) -> bool {
        self.emit(TransportEvent::Message(message)).await
    }

    pub async fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Reports an error followed by a close, the way a dropped socket does.
    pub async fn drop_connection(self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_string())).await;
        let _ = self.events.send(TransportEvent::Close).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, server) = MemoryConnector::pair();
        let mut connection = connector.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        connection.outgoing.send(r#"{"id":0}"#.to_string()).await.unwrap();
        assert_eq!(peer.recv().await, Some(json!({"id": 0})));

        assert!(peer.reply(json!({"id": 0, "result": 1})).await);
        assert_eq!(
            connection.incoming.recv().await,
            Some(TransportEvent::Message(json!({"id": 0, "result": 1})))
        );
    }

    #[tokio::test]
    async fn offline_server_refuses_connections() {
        let (connector, server) = MemoryConnector::pair();
        server.set_online(false);
        assert!(matches!(connector.connect().await, Err(Error::Connection(_))));
        assert_eq!(server.connect_attempts(), 1);
    }
}
