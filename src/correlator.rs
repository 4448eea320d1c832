use crate::{
    error::Result,
    payload::PayloadBuilder,
    types::{Id, JsonRpcRequest, SubscriptionParams},
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

struct PendingEntry<T> {
    members: Vec<Id>,
    batch: bool,
    context: T,
}

/// What an inbound message turned out to be.
#[derive(Debug)]
pub enum Routed<T> {
    /// Answer to a single pending request.
    Response { id: Id, response: Value, context: T },
    /// Answer to a pending batch. `responses` is the array as received.
    Batch { responses: Vec<Value>, context: T },
    /// An error object without an id while a batch is pending. It fails the
    /// oldest batch as a whole.
    Rejected { response: Value, context: T },
    /// Server-pushed notification for a subscription.
    Notification(SubscriptionParams),
    /// Nothing is waiting for this message.
    Discarded(Value),
}

/// Tracks in-flight requests on one connection and matches inbound messages
/// to them by id.
///
/// `T` is whatever the owner needs to finish the request once it is answered.
/// Each id resolves at most once: routing a response removes its entry.
pub struct Correlator<T> {
    builder: PayloadBuilder,
    pending: HashMap<Id, PendingEntry<T>>,
    // batch member id -> id the batch is stored under
    batch_members: HashMap<Id, Id>,
    // keys of pending batches, oldest first
    batch_order: VecDeque<Id>,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Self {
        Self {
            builder: PayloadBuilder::new(),
            pending: HashMap::new(),
            batch_members: HashMap::new(),
            batch_order: VecDeque::new(),
        }
    }

    pub fn prepare(&self, method: &str, params: Vec<Value>) -> Result<JsonRpcRequest> {
        self.builder.to_payload(method, params)
    }

    pub fn track(&mut self, id: Id, context: T) {
        self.pending.insert(
            id.clone(),
            PendingEntry {
                members: vec![id],
                batch: false,
                context,
            },
        );
    }

    /// Tracks a batch under its first id; every member id can complete it.
    pub fn track_batch(&mut self, ids: Vec<Id>, context: T) {
        let Some(key) = ids.first().cloned() else {
            return;
        };
        for id in &ids {
            self.batch_members.insert(id.clone(), key.clone());
        }
        self.batch_order.push_back(key.clone());
        self.pending.insert(
            key,
            PendingEntry {
                members: ids,
                batch: true,
                context,
            },
        );
    }

    pub fn is_pending(&self, id: &Id) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Removes an entry without a response, e.g. when the write failed.
    pub fn take(&mut self, id: &Id) -> Option<T> {
        let key = self.batch_members.get(id).cloned().unwrap_or_else(|| id.clone());
        let entry = self.pending.remove(&key)?;
        self.forget_members(&entry);
        Some(entry.context)
    }

    pub fn route(&mut self, message: Value) -> Routed<T> {
        match message {
            Value::Array(responses) => self.route_batch(responses),
            message => self.route_single(message),
        }
    }

    /// Removes every pending entry. Used when the connection is torn down.
    pub fn drain(&mut self) -> Vec<T> {
        self.batch_members.clear();
        self.batch_order.clear();
        self.pending.drain().map(|(_, entry)| entry.context).collect()
    }

    fn route_single(&mut self, message: Value) -> Routed<T> {
        let id = message.get("id").and_then(Id::from_value);

        if let Some(id) = id.clone() {
            if self.pending.get(&id).is_some_and(|entry| !entry.batch) {
                if let Some(entry) = self.pending.remove(&id) {
                    trace!("Resolving request {}", id);
                    return Routed::Response {
                        id,
                        response: message,
                        context: entry.context,
                    };
                }
            }
        }

        if let Some(params) = SubscriptionParams::from_message(&message) {
            return Routed::Notification(params);
        }

        let error = message.get("error").is_some_and(|error| !error.is_null());
        if id.is_none() && error {
            if let Some(entry) = self.take_oldest_batch() {
                debug!("Id-less error fails the oldest pending batch: {}", message);
                return Routed::Rejected {
                    response: message,
                    context: entry.context,
                };
            }
        }

        debug!("Discarding message nobody is waiting for: {}", message);
        Routed::Discarded(message)
    }

    fn route_batch(&mut self, responses: Vec<Value>) -> Routed<T> {
        let key = responses
            .iter()
            .filter_map(|response| response.get("id").and_then(Id::from_value))
            .find_map(|id| self.batch_members.get(&id).cloned());

        let entry = match key {
            Some(key) => self.pending.remove(&key).map(|entry| {
                self.forget_members(&entry);
                entry
            }),
            // nothing to correlate by, positions decide
            None => self.take_oldest_batch(),
        };

        match entry {
            Some(entry) => {
                trace!("Resolving batch of {} with {} responses", entry.members.len(), responses.len());
                Routed::Batch {
                    responses,
                    context: entry.context,
                }
            }
            None => {
                debug!("Discarding batch response nobody is waiting for");
                Routed::Discarded(Value::Array(responses))
            }
        }
    }

    fn take_oldest_batch(&mut self) -> Option<PendingEntry<T>> {
        let key = self.batch_order.front()?.clone();
        let entry = self.pending.remove(&key)?;
        self.forget_members(&entry);
        Some(entry)
    }

    fn forget_members(&mut self, entry: &PendingEntry<T>) {
        if entry.batch {
            for id in &entry.members {
                self.batch_members.remove(id);
            }
            if let Some(key) = entry.members.first() {
                self.batch_order.retain(|pending| pending != key);
            }
        }
    }
}
