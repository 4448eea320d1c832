use crate::{
    batch::Batch,
    config::{HttpConfig, SocketConfig},
    error::{Error, Result},
    event_loop::{BatchReply, Command, EventLoop},
    http::HttpTransport,
    payload::PayloadBuilder,
    subscriptions::{SubscribeRequest, Subscription},
    transport::{Connector, Transport},
    validator::into_result,
    websocket::{ws_url, WsConnector},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

#[derive(Debug, Clone)]
enum Backend {
    Http {
        transport: Arc<dyn Transport>,
        builder: Arc<PayloadBuilder>,
    },
    Socket {
        command_sender: mpsc::Sender<Command>,
        cancellation_token: CancellationToken,
    },
}

/// Handle to a node. Cheap to clone; clones share the connection.
///
/// HTTP clients answer every call with one POST and cannot subscribe. Socket
/// clients (WebSocket, IPC, or any [`Connector`]) multiplex calls and
/// subscriptions over one connection and reconnect when it drops.
#[derive(Debug, Clone)]
pub struct RpcClient {
    backend: Backend,
}

impl RpcClient {
    pub fn http(url: Url) -> Result<Self> {
        Self::http_with_config(url, HttpConfig::default())
    }

    pub fn http_with_config(url: Url, config: HttpConfig) -> Result<Self> {
        Ok(Self::with_transport(HttpTransport::with_config(url, config)?))
    }

    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            backend: Backend::Http {
                transport: Arc::new(transport),
                builder: Arc::new(PayloadBuilder::new()),
            },
        }
    }

    pub async fn ws(url: Url) -> Result<Self> {
        Self::connect(WsConnector::new(ws_url(&url)?), SocketConfig::default()).await
    }

    #[cfg(unix)]
    pub async fn ipc(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::connect(crate::ipc::IpcConnector::new(path), SocketConfig::default()).await
    }

    /// Picks the transport from the endpoint: `http(s)://`, `ws(s)://`, or a
    /// filesystem path / `ipc://` URL for a unix socket.
    pub async fn from_endpoint(endpoint: &str) -> Result<Self> {
        match Url::parse(endpoint) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Self::http(url),
                "ws" | "wss" => Self::ws(url).await,
                #[cfg(unix)]
                "ipc" | "file" => Self::ipc(url.path()).await,
                scheme => Err(Error::UnsupportedEndpoint(format!("{scheme}://"))),
            },
            #[cfg(unix)]
            Err(url::ParseError::RelativeUrlWithoutBase) => Self::ipc(endpoint).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Opens the first connection and starts the connection's event loop.
    pub async fn connect(connector: impl Connector, config: SocketConfig) -> Result<Self> {
        let connection = connector.connect().await?;
        let (command_sender, command_receiver) = mpsc::channel(config.command_capacity.max(1));
        let cancellation_token = CancellationToken::new();

        let event_loop = EventLoop::new(
            Box::new(connector),
            config,
            command_receiver,
            cancellation_token.clone(),
        );
        tokio::spawn(event_loop.run(connection));

        Ok(Self {
            backend: Backend::Socket {
                command_sender,
                cancellation_token,
            },
        })
    }

    pub fn supports_subscriptions(&self) -> bool {
        matches!(self.backend, Backend::Socket { .. })
    }

    /// Calls `method` and returns its raw result.
    pub async fn send(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match &self.backend {
            Backend::Http { transport, builder } => {
                let payload = builder.to_payload(method, params)?;
                let response = transport.request(payload.to_value()).await?;
                into_result(response, Some(&payload))
            }
            Backend::Socket { command_sender, .. } => {
                let (response_sender, response_receiver) = oneshot::channel();
                let command = Command::Call {
                    method: method.to_string(),
                    params,
                    response_sender,
                };
                roundtrip(command_sender, command, response_receiver).await
            }
        }
    }

    /// Calls `method` and deserializes its result.
    pub async fn request<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let result = self.send(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Issues `subscribe_method` (e.g. `eth_subscribe`) with
    /// `subscription_method` (e.g. `newHeads`) as its first parameter.
    pub async fn subscribe(
        &self,
        subscribe_method: &str,
        subscription_method: &str,
        params: Vec<Value>,
    ) -> Result<Subscription> {
        let Backend::Socket { command_sender, .. } = &self.backend else {
            return Err(Error::SubscriptionsNotSupported);
        };

        let (response_sender, response_receiver) = oneshot::channel();
        let command = Command::Subscribe {
            request: SubscribeRequest::new(subscribe_method, subscription_method, params),
            response_sender,
        };
        let subscription = roundtrip(command_sender, command, response_receiver).await?;
        info!("Subscribed to {} as {}", subscription_method, subscription.id());
        Ok(subscription)
    }

    /// Returns the node's answer. The subscription is dropped locally whenever
    /// the node answers, whether it answers `true` or `false`.
    pub async fn unsubscribe(&self, id: &str, unsubscribe_method: &str) -> Result<bool> {
        let Backend::Socket { command_sender, .. } = &self.backend else {
            return Err(Error::SubscriptionsNotSupported);
        };

        let (response_sender, response_receiver) = oneshot::channel();
        let command = Command::Unsubscribe {
            id: id.to_string(),
            method: unsubscribe_method.to_string(),
            response_sender,
        };
        roundtrip(command_sender, command, response_receiver).await
    }

    /// Unsubscribes every subscription whose subscribe method starts with the
    /// same three characters as `unsubscribe_method` (all of them for `None`).
    /// Fails if any of them was not confirmed by the node.
    pub async fn clear_subscriptions(&self, unsubscribe_method: Option<&str>) -> Result<bool> {
        let Backend::Socket { command_sender, .. } = &self.backend else {
            return Err(Error::SubscriptionsNotSupported);
        };

        let (response_sender, response_receiver) = oneshot::channel();
        let command = Command::ClearSubscriptions {
            method: unsubscribe_method.map(str::to_string),
            response_sender,
        };
        roundtrip(command_sender, command, response_receiver).await
    }

    /// Sends every call of `batch` in one request. The outer error covers the
    /// batch as a whole; each call gets its own result, in the order added.
    pub async fn send_batch(&self, batch: Batch) -> Result<Vec<Result<Value>>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let (requests, responses) = match &self.backend {
            Backend::Http { transport, builder } => {
                let requests = batch
                    .calls()
                    .into_iter()
                    .map(|(method, params)| builder.to_payload(&method, params))
                    .collect::<Result<Vec<_>>>()?;
                let payload = Value::Array(requests.iter().map(|r| r.to_value()).collect());
                match transport.request(payload).await? {
                    Value::Array(responses) => (requests, responses),
                    other => return Err(Error::InvalidResponse(other.to_string())),
                }
            }
            Backend::Socket { command_sender, .. } => {
                let (response_sender, response_receiver) = oneshot::channel();
                let command = Command::Batch {
                    calls: batch.calls(),
                    response_sender,
                };
                let reply: BatchReply = roundtrip(command_sender, command, response_receiver).await?;
                reply
            }
        };

        debug!("Batch of {} answered with {} responses", requests.len(), responses.len());
        Ok(batch.distribute(&requests, responses))
    }

    /// Starts a batch bound to this client.
    pub fn batch(&self) -> BatchRequest<'_> {
        BatchRequest {
            client: self,
            batch: Batch::new(),
        }
    }

    /// Closes the connection and stops reconnecting. Pending requests are
    /// rejected and subscriptions end. No-op for HTTP clients.
    pub fn disconnect(&self) {
        if let Backend::Socket {
            cancellation_token, ..
        } = &self.backend
        {
            cancellation_token.cancel();
        }
    }
}

async fn roundtrip<T>(
    command_sender: &mpsc::Sender<Command>,
    command: Command,
    response_receiver: oneshot::Receiver<Result<T>>,
) -> Result<T> {
    command_sender
        .send(command)
        .await
        .map_err(|_| Error::ConnectionClosed)?;
    response_receiver
        .await
        .map_err(|_| Error::ConnectionClosed)?
}

/// Builder returned by [`RpcClient::batch`].
pub struct BatchRequest<'a> {
    client: &'a RpcClient,
    batch: Batch,
}

impl<'a> BatchRequest<'a> {
    pub fn add(mut self, method: &str, params: Vec<Value>) -> Self {
        self.batch.add(method, params);
        self
    }

    pub fn add_with(
        mut self,
        method: &str,
        params: Vec<Value>,
        formatter: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.batch.add_with(method, params, formatter);
        self
    }

    pub async fn execute(self) -> Result<Vec<Result<Value>>> {
        self.client.send_batch(self.batch).await
    }
}
