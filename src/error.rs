use crate::types::{Id, JsonRpcError};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The response did not have the shape of a JSON-RPC response.
    #[error("Invalid JSON RPC response: {0}")]
    InvalidResponse(String),

    /// The node answered with an `error` member.
    #[error(transparent)]
    Node(#[from] JsonRpcError),

    #[error("Invalid JSON RPC response ID (request: {request} / response: {response})")]
    IdMismatch { request: Id, response: String },

    #[error("Undefined JSON RPC result")]
    UndefinedResult,

    #[error("Invalid method parameter(s): {params}")]
    InvalidMethod { params: String },

    #[error("Connection closed before a response was received")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    #[error("The current provider does not support subscriptions")]
    SubscriptionsNotSupported,

    #[error("Subscription with id {0} does not exist")]
    UnknownSubscription(String),

    #[error("Subscription {0} is being re-established")]
    SubscriptionPending(String),

    #[error("Could not unsubscribe all subscriptions: {}", failed.join(", "))]
    ClearSubscriptions { failed: Vec<String> },

    #[error("Unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl Error {
    /// Errors raised because the connection went away rather than because of
    /// anything the node said.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed
                | Error::Connection(_)
                | Error::ReconnectFailed { .. }
                | Error::WebSocket(_)
                | Error::Io(_)
        )
    }
}
