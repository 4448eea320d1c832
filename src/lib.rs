//! JSON-RPC plumbing for Conflux and Ethereum nodes: request/response
//! correlation by id, subscriptions that survive reconnects, and batches, over
//! HTTP, WebSocket or IPC.

pub mod batch;
pub mod cli;
pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
mod event_loop;
pub mod http;
#[cfg(unix)]
pub mod ipc;
pub mod memory;
pub mod payload;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod validator;
pub mod websocket;

pub use batch::Batch;
pub use client::{BatchRequest, RpcClient};
pub use config::{HttpConfig, ReconnectConfig, SocketConfig};
pub use error::{Error, Result};
pub use subscriptions::{Notification, Subscription, SubscriptionState};
pub use transport::{Connection, Connector, Transport, TransportEvent};
pub use types::*;
