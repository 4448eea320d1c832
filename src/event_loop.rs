use crate::{
    config::SocketConfig,
    correlator::{Correlator, Routed},
    error::{Error, Result},
    subscriptions::{SubscribeRequest, Subscription, SubscriptionRegistry},
    transport::{Connection, Connector, TransportEvent},
    types::{Id, JsonRpcRequest},
    validator::into_result,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub(crate) type BatchReply = (Vec<JsonRpcRequest>, Vec<Value>);

pub(crate) enum Command {
    Call {
        method: String,
        params: Vec<Value>,
        response_sender: oneshot::Sender<Result<Value>>,
    },
    Batch {
        calls: Vec<(String, Vec<Value>)>,
        response_sender: oneshot::Sender<Result<BatchReply>>,
    },
    Subscribe {
        request: SubscribeRequest,
        response_sender: oneshot::Sender<Result<Subscription>>,
    },
    Unsubscribe {
        id: String,
        method: String,
        response_sender: oneshot::Sender<Result<bool>>,
    },
    ClearSubscriptions {
        method: Option<String>,
        response_sender: oneshot::Sender<Result<bool>>,
    },
}

enum Pending {
    Call(oneshot::Sender<Result<Value>>),
    Batch {
        requests: Vec<JsonRpcRequest>,
        response_sender: oneshot::Sender<Result<BatchReply>>,
    },
    Subscribe {
        request: SubscribeRequest,
        response_sender: oneshot::Sender<Result<Subscription>>,
    },
    Resubscribe {
        id: String,
    },
    Unsubscribe {
        id: String,
        reply: UnsubscribeReply,
    },
}

enum UnsubscribeReply {
    Caller(oneshot::Sender<Result<bool>>),
    Group(u64),
}

struct ClearGroup {
    remaining: usize,
    failed: Vec<String>,
    response_sender: oneshot::Sender<Result<bool>>,
}

enum Exit {
    Dropped,
    Cancelled,
    HandlesGone,
}

/// Owns one socket connection together with its pending requests and
/// subscriptions. All mutation happens on this task; client handles talk to
/// it through `Command`s, so a subscriber that unsubscribes from inside its
/// own notification handling simply queues another command.
pub(crate) struct EventLoop {
    connector: Box<dyn Connector>,
    config: SocketConfig,
    command_receiver: mpsc::Receiver<Command>,
    cancellation_token: CancellationToken,
    outgoing: Option<mpsc::Sender<String>>,
    correlator: Correlator<Pending>,
    registry: SubscriptionRegistry,
    groups: HashMap<u64, ClearGroup>,
    next_group: u64,
}

impl EventLoop {
    pub fn new(
        connector: Box<dyn Connector>,
        config: SocketConfig,
        command_receiver: mpsc::Receiver<Command>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let registry = SubscriptionRegistry::new(config.notification_capacity);
        Self {
            connector,
            config,
            command_receiver,
            cancellation_token,
            outgoing: None,
            correlator: Correlator::new(),
            registry,
            groups: HashMap::new(),
            next_group: 0,
        }
    }

    pub async fn run(mut self, connection: Connection) {
        let mut connection = Some(connection);
        let mut reconnected = false;

        while let Some(Connection { outgoing, mut incoming }) = connection.take() {
            self.outgoing = Some(outgoing);
            if reconnected {
                self.on_connect().await;
            }

            let exit = self.drive(&mut incoming).await;
            self.tear_down();

            match exit {
                Exit::Dropped => {
                    connection = self.reconnect().await;
                    reconnected = true;
                }
                Exit::Cancelled => info!("Connection closed on request"),
                Exit::HandlesGone => debug!("All client handles dropped, closing connection"),
            }
        }

        self.registry.clear();
        self.command_receiver.close();
        while let Some(command) = self.command_receiver.recv().await {
            reject(command, Error::ConnectionClosed);
        }
        debug!("RPC event loop stopped");
    }

    async fn drive(&mut self, incoming: &mut mpsc::Receiver<TransportEvent>) -> Exit {
        loop {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => return Exit::Cancelled,
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => return Exit::HandlesGone,
                },
                event = incoming.recv() => match event {
                    Some(TransportEvent::Message(message)) => self.handle_message(message),
                    Some(TransportEvent::Error(reason)) => {
                        warn!("Connection error: {}", reason);
                        self.registry.broadcast_error(&reason);
                    }
                    Some(TransportEvent::Connect) => self.on_connect().await,
                    Some(TransportEvent::Close) | None => {
                        warn!("Connection dropped");
                        return Exit::Dropped;
                    }
                },
            }
        }
    }

    /// Rejects everything in flight. Subscriptions stay registered and wait
    /// for the next connection.
    fn tear_down(&mut self) {
        self.outgoing = None;
        let pending = self.correlator.drain();
        if !pending.is_empty() {
            info!("Rejecting {} pending request(s)", pending.len());
        }
        for pending in pending {
            self.fail(pending, Error::ConnectionClosed);
        }
        self.registry.mark_reconnecting();
    }

    async fn reconnect(&mut self) -> Option<Connection> {
        let policy = self.config.reconnect.clone();
        if !policy.enabled {
            self.registry.fail_all(|| Error::ConnectionClosed);
            return None;
        }

        for attempt in 0..policy.max_attempts {
            let delay = policy.delay_for(attempt);
            debug!("Reconnecting in {:?}", delay);

            let sleep = time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => return None,
                    _ = &mut sleep => break,
                    command = self.command_receiver.recv() => match command {
                        // nothing is queued while disconnected
                        Some(command) => reject(command, Error::ConnectionClosed),
                        None => return None,
                    },
                }
            }

            let connecting = tokio::select! {
                _ = self.cancellation_token.cancelled() => return None,
                result = self.connector.connect() => result,
            };
            match connecting {
                Ok(connection) => {
                    info!("Reconnected after {} attempt(s)", attempt + 1);
                    return Some(connection);
                }
                Err(e) => warn!(
                    "Reconnect attempt {}/{} failed: {}",
                    attempt + 1,
                    policy.max_attempts,
                    e
                ),
            }
        }

        error!("Failed to reconnect after {} attempts", policy.max_attempts);
        let attempts = policy.max_attempts;
        self.registry
            .fail_all(|| Error::ReconnectFailed { attempts });
        None
    }

    async fn on_connect(&mut self) {
        for (id, request) in self.registry.begin_resubscribe() {
            match self.correlator.prepare(&request.subscribe_method, request.rpc_params()) {
                Ok(payload) => self.dispatch(payload, Pending::Resubscribe { id }).await,
                Err(e) => self.registry.finish_resubscribe(&id, Err(e)),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Call {
                method,
                params,
                response_sender,
            } => match self.correlator.prepare(&method, params) {
                Ok(payload) => self.dispatch(payload, Pending::Call(response_sender)).await,
                Err(e) => {
                    let _ = response_sender.send(Err(e));
                }
            },
            Command::Batch {
                calls,
                response_sender,
            } => self.send_batch(calls, response_sender).await,
            Command::Subscribe {
                request,
                response_sender,
            } => match self
                .correlator
                .prepare(&request.subscribe_method, request.rpc_params())
            {
                Ok(payload) => {
                    let pending = Pending::Subscribe {
                        request,
                        response_sender,
                    };
                    self.dispatch(payload, pending).await
                }
                Err(e) => {
                    let _ = response_sender.send(Err(e));
                }
            },
            Command::Unsubscribe {
                id,
                method,
                response_sender,
            } => {
                self.unsubscribe(&id, &method, UnsubscribeReply::Caller(response_sender))
                    .await
            }
            Command::ClearSubscriptions {
                method,
                response_sender,
            } => self.clear_subscriptions(method, response_sender).await,
        }
    }

    async fn send_batch(
        &mut self,
        calls: Vec<(String, Vec<Value>)>,
        response_sender: oneshot::Sender<Result<BatchReply>>,
    ) {
        if calls.is_empty() {
            let _ = response_sender.send(Ok((Vec::new(), Vec::new())));
            return;
        }

        let requests = match calls
            .into_iter()
            .map(|(method, params)| self.correlator.prepare(&method, params))
            .collect::<Result<Vec<_>>>()
        {
            Ok(requests) => requests,
            Err(e) => {
                let _ = response_sender.send(Err(e));
                return;
            }
        };

        let text = match serde_json::to_string(&requests) {
            Ok(text) => text,
            Err(e) => {
                let _ = response_sender.send(Err(e.into()));
                return;
            }
        };
        let ids: Vec<Id> = requests.iter().map(|request| request.id.clone()).collect();
        let first = ids[0].clone();
        self.correlator.track_batch(
            ids,
            Pending::Batch {
                requests,
                response_sender,
            },
        );
        self.write(first, text).await;
    }

    async fn unsubscribe(&mut self, id: &str, method: &str, reply: UnsubscribeReply) {
        let current = match self.registry.begin_unsubscribe(id) {
            Ok(current) => current,
            Err(e) => return self.settle_unsubscribe(id, reply, Err(e)),
        };

        match self
            .correlator
            .prepare(method, vec![Value::String(current.clone())])
        {
            Ok(payload) => {
                let pending = Pending::Unsubscribe { id: current, reply };
                self.dispatch(payload, pending).await
            }
            Err(e) => {
                let outcome = Err(e);
                self.registry.finish_unsubscribe(&current, &outcome);
                self.settle_unsubscribe(&current, reply, outcome)
            }
        }
    }

    async fn clear_subscriptions(
        &mut self,
        method: Option<String>,
        response_sender: oneshot::Sender<Result<bool>>,
    ) {
        let targets = self.registry.matching(method.as_deref());
        if targets.is_empty() {
            let _ = response_sender.send(Ok(true));
            return;
        }

        let group = self.next_group;
        self.next_group += 1;
        self.groups.insert(
            group,
            ClearGroup {
                remaining: targets.len(),
                failed: Vec::new(),
                response_sender,
            },
        );

        // every unsubscribe goes out before any answer is looked at
        for (id, unsubscribe_method) in targets {
            self.unsubscribe(&id, &unsubscribe_method, UnsubscribeReply::Group(group))
                .await;
        }
    }

    async fn dispatch(&mut self, payload: JsonRpcRequest, pending: Pending) {
        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => return self.fail(pending, e.into()),
        };
        trace!("Sending request {} ({})", payload.id, payload.method);
        self.correlator.track(payload.id.clone(), pending);
        self.write(payload.id, text).await;
    }

    async fn write(&mut self, id: Id, text: String) {
        let sent = match &self.outgoing {
            Some(outgoing) => outgoing.send(text).await.is_ok(),
            None => false,
        };
        if !sent {
            if let Some(pending) = self.correlator.take(&id) {
                self.fail(pending, Error::ConnectionClosed);
            }
        }
    }

    fn handle_message(&mut self, message: Value) {
        match self.correlator.route(message) {
            Routed::Response {
                response, context, ..
            } => self.complete(context, into_result(response, None)),
            Routed::Batch { responses, context } => match context {
                Pending::Batch {
                    requests,
                    response_sender,
                } => {
                    let _ = response_sender.send(Ok((requests, responses)));
                }
                other => self.fail(
                    other,
                    Error::InvalidResponse("batch response to a single request".to_string()),
                ),
            },
            Routed::Rejected { response, context } => {
                self.complete(context, into_result(response, None))
            }
            Routed::Notification(params) => {
                if !self.registry.notify(&params.subscription, params.result) {
                    debug!("Notification for unknown subscription {}", params.subscription);
                }
            }
            Routed::Discarded(_) => {}
        }
    }

    fn complete(&mut self, pending: Pending, outcome: Result<Value>) {
        match pending {
            Pending::Call(response_sender) => {
                let _ = response_sender.send(outcome);
            }
            Pending::Batch {
                response_sender, ..
            } => {
                let _ = response_sender.send(outcome.and_then(|_| {
                    Err(Error::InvalidResponse(
                        "single response to a batch request".to_string(),
                    ))
                }));
            }
            Pending::Subscribe {
                request,
                response_sender,
            } => {
                let reply = outcome
                    .and_then(subscription_id)
                    .map(|id| self.registry.insert(id, request));
                let _ = response_sender.send(reply);
            }
            Pending::Resubscribe { id } => {
                self.registry
                    .finish_resubscribe(&id, outcome.and_then(subscription_id));
            }
            Pending::Unsubscribe { id, reply } => {
                let outcome = outcome.map(|value| truthy(&value));
                self.registry.finish_unsubscribe(&id, &outcome);
                self.settle_unsubscribe(&id, reply, outcome);
            }
        }
    }

    fn fail(&mut self, pending: Pending, error: Error) {
        match pending {
            // the subscription is resubscribed again on the next connect
            Pending::Resubscribe { .. } => {}
            Pending::Unsubscribe { id, reply } => {
                let outcome = Err(error);
                self.registry.finish_unsubscribe(&id, &outcome);
                self.settle_unsubscribe(&id, reply, outcome);
            }
            other => self.complete(other, Err(error)),
        }
    }

    fn settle_unsubscribe(&mut self, id: &str, reply: UnsubscribeReply, outcome: Result<bool>) {
        match reply {
            UnsubscribeReply::Caller(response_sender) => {
                let _ = response_sender.send(outcome);
            }
            UnsubscribeReply::Group(group) => {
                let Some(clear) = self.groups.get_mut(&group) else {
                    return;
                };
                clear.remaining -= 1;
                match outcome {
                    Ok(true) => {}
                    Ok(false) => clear.failed.push(id.to_string()),
                    Err(e) => {
                        debug!("Unsubscribe of {} failed: {}", id, e);
                        clear.failed.push(id.to_string());
                    }
                }

                if clear.remaining == 0 {
                    if let Some(clear) = self.groups.remove(&group) {
                        let result = if clear.failed.is_empty() {
                            Ok(true)
                        } else {
                            Err(Error::ClearSubscriptions {
                                failed: clear.failed,
                            })
                        };
                        let _ = clear.response_sender.send(result);
                    }
                }
            }
        }
    }
}

fn subscription_id(result: Value) -> Result<String> {
    match result {
        Value::String(id) => Ok(id),
        other => Err(Error::InvalidResponse(format!(
            "expected a subscription id, got {other}"
        ))),
    }
}

// Nodes answer unsubscribe with a boolean, but not all of them.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(string) => !string.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn reject(command: Command, error: Error) {
    match command {
        Command::Call {
            response_sender, ..
        } => {
            let _ = response_sender.send(Err(error));
        }
        Command::Batch {
            response_sender, ..
        } => {
            let _ = response_sender.send(Err(error));
        }
        Command::Subscribe {
            response_sender, ..
        } => {
            let _ = response_sender.send(Err(error));
        }
        Command::Unsubscribe {
            response_sender, ..
        }
        | Command::ClearSubscriptions {
            response_sender, ..
        } => {
            let _ = response_sender.send(Err(error));
        }
    }
}
