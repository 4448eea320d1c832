use crate::{
    error::{Error, Result},
    transport::{Connection, Connector, TransportEvent, EVENT_BUFFER},
};
use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::Value;
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a node's WebSocket endpoint. Each call to `connect` opens a
/// new socket with its own reader and writer task.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection> {
        info!("Connecting to WebSocket at {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        info!("WebSocket connection established");

        let (sink, stream) = ws_stream.split();
        let (outgoing, outgoing_rx) = mpsc::channel(EVENT_BUFFER);
        let (events, incoming) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(write_frames(sink, outgoing_rx));
        tokio::spawn(read_frames(stream, events));

        Ok(Connection { outgoing, incoming })
    }
}

async fn write_frames(mut sink: SplitSink<WsStream, Message>, mut outgoing: mpsc::Receiver<String>) {
    while let Some(text) = outgoing.recv().await {
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            error!("Failed to send WebSocket frame: {}", e);
            return;
        }
    }

    debug!("Closing WebSocket");
    if let Err(e) = sink.close().await {
        debug!("WebSocket close failed: {}", e);
    }
}

async fn read_frames(mut stream: SplitStream<WsStream>, events: mpsc::Sender<TransportEvent>) {
    while let Some(msg) = stream.next().await {
        let event = match msg {
            Ok(Message::Text(text)) => match parse(&text) {
                Some(event) => event,
                None => continue,
            },
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => match parse(&text) {
                    Some(event) => event,
                    None => continue,
                },
                Err(e) => {
                    error!("Failed to decode binary message as UTF-8: {}", e);
                    continue;
                }
            },
            // tungstenite queues the pong itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Ok(Message::Close(frame)) => {
                info!("WebSocket connection closed by server: {:?}", frame);
                break;
            }
            Err(e) => {
                match &e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        info!("WebSocket connection closed");
                    }
                    WsError::Protocol(p) => error!("WebSocket protocol error: {}", p),
                    _ => error!("WebSocket error: {}", e),
                }
                let _ = events.send(TransportEvent::Error(e.to_string())).await;
                break;
            }
        };

        if events.send(event).await.is_err() {
            // event loop is gone
            return;
        }
    }

    let _ = events.send(TransportEvent::Close).await;
}

fn parse(text: &str) -> Option<TransportEvent> {
    match serde_json::from_str::<Value>(text) {
        Ok(json) => Some(TransportEvent::Message(json)),
        Err(e) => {
            error!("Failed to parse message as JSON: {}", e);
            debug!("Raw message: {}", text);
            None
        }
    }
}

pub(crate) fn ws_url(url: &Url) -> Result<Url> {
    match url.scheme() {
        "ws" | "wss" => Ok(url.clone()),
        scheme => Err(Error::UnsupportedEndpoint(format!(
            "{scheme}:// is not a WebSocket endpoint"
        ))),
    }
}
