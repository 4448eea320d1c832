use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Item delivered to a subscriber: a notification payload, or an error raised
/// by the connection the subscription lives on.
pub type Notification = Result<Value>;

/// Lifecycle of one subscription.
///
/// ```text
/// Unsubscribed -> Subscribing -> Active -> Unsubscribing -> Unsubscribed
///                      ^           |
///                      |           v
///                      +----- Reconnecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Active,
    Unsubscribing,
    Reconnecting,
}

/// Everything needed to (re-)issue a subscribe call.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    /// e.g. `eth_subscribe` or `cfx_subscribe`
    pub subscribe_method: String,
    /// e.g. `newHeads` or `logs`
    pub subscription_method: String,
    pub params: Vec<Value>,
}

impl SubscribeRequest {
    pub fn new(subscribe_method: &str, subscription_method: &str, params: Vec<Value>) -> Self {
        Self {
            subscribe_method: subscribe_method.to_string(),
            subscription_method: subscription_method.to_string(),
            params,
        }
    }

    /// Params of the RPC call: the subscription method name comes first.
    pub fn rpc_params(&self) -> Vec<Value> {
        std::iter::once(Value::String(self.subscription_method.clone()))
            .chain(self.params.iter().cloned())
            .collect()
    }

    pub fn namespace(&self) -> &str {
        self.subscribe_method
            .split_once('_')
            .map_or(self.subscribe_method.as_str(), |(namespace, _)| namespace)
    }

    pub fn unsubscribe_method(&self) -> String {
        format!("{}_unsubscribe", self.namespace())
    }
}

/// Receiving end of a subscription.
///
/// `id` is the id the server returned when the subscription was created. It
/// stays valid for `unsubscribe` after reconnects re-key the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: String,
    receiver: mpsc::Receiver<Notification>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }

    pub fn into_receiver(self) -> mpsc::Receiver<Notification> {
        self.receiver
    }
}

#[derive(Debug)]
struct Entry {
    origin_id: String,
    request: SubscribeRequest,
    state: SubscriptionState,
    sender: mpsc::Sender<Notification>,
}

impl Entry {
    fn deliver(&self, id: &str, notification: Notification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Subscriber for {} is lagging, dropping notification", id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber for {} is gone", id);
                false
            }
        }
    }
}

/// Active subscriptions of one connection, keyed by the id the server
/// currently knows them under.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Entry>,
    capacity: usize,
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stores a freshly created subscription and hands back its receiver.
    pub fn insert(&mut self, id: String, request: SubscribeRequest) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        debug!("Subscription {} to {} is active", id, request.subscription_method);
        self.entries.insert(
            id.clone(),
            Entry {
                origin_id: id.clone(),
                request,
                state: SubscriptionState::Active,
                sender,
            },
        );
        Subscription { id, receiver }
    }

    /// Current server-side id for either a current id or an original one.
    pub fn resolve(&self, id: &str) -> Option<&str> {
        if let Some((current, _)) = self.entries.get_key_value(id) {
            return Some(current.as_str());
        }
        self.entries
            .iter()
            .find(|(_, entry)| entry.origin_id == id)
            .map(|(current, _)| current.as_str())
    }

    pub fn state(&self, id: &str) -> SubscriptionState {
        self.resolve(id)
            .and_then(|current| self.entries.get(current))
            .map_or(SubscriptionState::Unsubscribed, |entry| entry.state)
    }

    pub fn request(&self, id: &str) -> Option<&SubscribeRequest> {
        let current = self.resolve(id)?;
        self.entries.get(current).map(|entry| &entry.request)
    }

    /// Delivers a notification. Returns `false` when no subscription has the id
    /// or the subscriber could not take it.
    /// A subscription whose handle was dropped is removed here.
    pub fn notify(&mut self, id: &str, payload: Value) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        if entry.sender.is_closed() {
            debug!("Subscriber for {} is gone, forgetting the subscription", id);
            self.entries.remove(id);
            return false;
        }
        entry.deliver(id, Ok(payload))
    }

    /// Pushes a connection-level error to every subscriber.
    pub fn broadcast_error(&self, message: &str) {
        for (id, entry) in &self.entries {
            entry.deliver(id, Err(Error::Connection(message.to_string())));
        }
    }

    /// Ids (current) and unsubscribe methods of every subscription whose
    /// subscribe method shares its first three characters with `method`.
    /// Every subscription matches when `method` is `None`.
    pub fn matching(&self, method: Option<&str>) -> Vec<(String, String)> {
        let prefix = method.map(|method| method.get(..3).unwrap_or(method));
        self.entries
            .iter()
            .filter(|(_, entry)| {
                prefix.map_or(true, |prefix| entry.request.subscribe_method.starts_with(prefix))
            })
            .map(|(id, entry)| {
                let unsubscribe = method
                    .map(str::to_string)
                    .unwrap_or_else(|| entry.request.unsubscribe_method());
                (id.clone(), unsubscribe)
            })
            .collect()
    }

    /// Marks a subscription as being unsubscribed and returns its current id.
    pub fn begin_unsubscribe(&mut self, id: &str) -> Result<String> {
        let current = self
            .resolve(id)
            .map(str::to_string)
            .ok_or_else(|| Error::UnknownSubscription(id.to_string()))?;
        let entry = self
            .entries
            .get_mut(&current)
            .ok_or_else(|| Error::UnknownSubscription(id.to_string()))?;

        match entry.state {
            SubscriptionState::Active | SubscriptionState::Reconnecting => {
                entry.state = SubscriptionState::Unsubscribing;
                Ok(current)
            }
            _ => Err(Error::SubscriptionPending(id.to_string())),
        }
    }

    /// Settles an unsubscribe. Any answer from the node removes the entry,
    /// `false` included; an error puts it back to `Active`.
    pub fn finish_unsubscribe(&mut self, id: &str, outcome: &Result<bool>) {
        match outcome {
            Ok(removed) => {
                if self.entries.remove(id).is_some() {
                    debug!("Subscription {} removed (node answered {})", id, removed);
                }
            }
            Err(error) => {
                if let Some(entry) = self.entries.get_mut(id) {
                    debug!("Unsubscribe of {} failed: {}", id, error);
                    entry.state = SubscriptionState::Active;
                }
            }
        }
    }

    /// Connection dropped: every subscription waits to be re-established.
    pub fn mark_reconnecting(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = SubscriptionState::Reconnecting;
        }
    }

    /// Moves every subscription that is not already being (re)subscribed or
    /// torn down into `Subscribing` and returns what to resubscribe with.
    /// Subscriptions nobody listens to any more are dropped instead.
    pub fn begin_resubscribe(&mut self) -> Vec<(String, SubscribeRequest)> {
        self.entries.retain(|id, entry| {
            let open = !entry.sender.is_closed();
            if !open {
                debug!("Not resubscribing {}, its subscriber is gone", id);
            }
            open
        });

        let mut resubscribe = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if matches!(
                entry.state,
                SubscriptionState::Active | SubscriptionState::Reconnecting
            ) {
                entry.state = SubscriptionState::Subscribing;
                resubscribe.push((id.clone(), entry.request.clone()));
            }
        }
        if !resubscribe.is_empty() {
            info!("Resubscribing {} subscription(s)", resubscribe.len());
        }
        resubscribe
    }

    /// Settles a resubscribe: re-keys the entry under the new id, or ends the
    /// subscription with the error.
    pub fn finish_resubscribe(&mut self, old_id: &str, outcome: Result<String>) {
        let Some(mut entry) = self.entries.remove(old_id) else {
            return;
        };

        match outcome {
            Ok(new_id) => {
                debug!("Subscription {} is now {}", old_id, new_id);
                entry.state = SubscriptionState::Active;
                self.entries.insert(new_id, entry);
            }
            Err(error) => {
                warn!("Failed to resubscribe {}: {}", old_id, error);
                entry.deliver(old_id, Err(error));
            }
        }
    }

    /// Ends every subscription with an error built by `error`.
    pub fn fail_all(&mut self, error: impl Fn() -> Error) {
        for (id, entry) in self.entries.drain() {
            entry.deliver(&id, Err(error()));
        }
    }

    /// Ends every subscription silently; receivers see the channel close.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heads() -> SubscribeRequest {
        SubscribeRequest::new("eth_subscribe", "newHeads", vec![])
    }

    #[test]
    fn subscribe_request_params_lead_with_method() {
        let request = SubscribeRequest::new("cfx_subscribe", "logs", vec![json!({"address": "0x1"})]);
        assert_eq!(request.rpc_params(), vec![json!("logs"), json!({"address": "0x1"})]);
        assert_eq!(request.namespace(), "cfx");
        assert_eq!(request.unsubscribe_method(), "cfx_unsubscribe");
    }

    #[tokio::test]
    async fn notifications_reach_the_subscriber() {
        let mut registry = SubscriptionRegistry::new(4);
        let mut subscription = registry.insert("0x1".into(), heads());
        assert_eq!(registry.state("0x1"), SubscriptionState::Active);

        assert!(registry.notify("0x1", json!({"number": "0x10"})));
        assert!(!registry.notify("0x2", json!({})));
        assert_eq!(subscription.next().await.unwrap().unwrap(), json!({"number": "0x10"}));

        registry.broadcast_error("socket reset");
        assert!(matches!(subscription.next().await, Some(Err(Error::Connection(_)))));
    }

    #[test]
    fn lagging_subscriber_drops_notifications() {
        let mut registry = SubscriptionRegistry::new(1);
        let mut subscription = registry.insert("0x1".into(), heads());
        assert!(registry.notify("0x1", json!(1)));
        assert!(!registry.notify("0x1", json!(2)));
        assert_eq!(subscription.try_next().unwrap().unwrap(), json!(1));
        assert!(subscription.try_next().is_none());
    }

    #[test]
    fn unsubscribe_transitions() {
        let mut registry = SubscriptionRegistry::new(4);
        let _subscription = registry.insert("0x1".into(), heads());

        assert!(matches!(registry.begin_unsubscribe("0x9"), Err(Error::UnknownSubscription(_))));

        let current = registry.begin_unsubscribe("0x1").unwrap();
        assert_eq!(registry.state("0x1"), SubscriptionState::Unsubscribing);
        assert!(matches!(registry.begin_unsubscribe("0x1"), Err(Error::SubscriptionPending(_))));

        registry.finish_unsubscribe(&current, &Err(Error::ConnectionClosed));
        assert_eq!(registry.state("0x1"), SubscriptionState::Active);

        let current = registry.begin_unsubscribe("0x1").unwrap();
        registry.finish_unsubscribe(&current, &Ok(false));
        assert_eq!(registry.state("0x1"), SubscriptionState::Unsubscribed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn resubscribe_rekeys_and_keeps_origin_alias() {
        let mut registry = SubscriptionRegistry::new(4);
        let mut subscription = registry.insert("0xold".into(), heads());

        registry.mark_reconnecting();
        assert_eq!(registry.state("0xold"), SubscriptionState::Reconnecting);

        let resubscribe = registry.begin_resubscribe();
        assert_eq!(resubscribe, vec![("0xold".to_string(), heads())]);
        assert!(registry.begin_resubscribe().is_empty());

        registry.finish_resubscribe("0xold", Ok("0xnew".into()));
        assert_eq!(registry.resolve("0xold"), Some("0xnew"));
        assert_eq!(registry.state("0xnew"), SubscriptionState::Active);

        assert!(registry.notify("0xnew", json!("payload")));
        assert!(!registry.notify("0xold", json!("stale")));
        assert_eq!(subscription.next().await.unwrap().unwrap(), json!("payload"));
    }

    #[tokio::test]
    async fn failed_resubscribe_ends_the_subscription() {
        let mut registry = SubscriptionRegistry::new(4);
        let mut subscription = registry.insert("0x1".into(), heads());
        registry.begin_resubscribe();
        registry.finish_resubscribe("0x1", Err(Error::ConnectionClosed));

        assert!(registry.is_empty());
        assert!(matches!(subscription.next().await, Some(Err(Error::ConnectionClosed))));
        assert!(subscription.next().await.is_none());
    }

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let mut registry = SubscriptionRegistry::new(4);
        let heads_subscription = registry.insert("0x1".into(), heads());
        let _logs = registry.insert("0x2".into(), SubscribeRequest::new("eth_subscribe", "logs", vec![]));
        let pending = registry.insert("0x3".into(), heads());

        drop(heads_subscription);
        assert!(!registry.notify("0x1", json!({"number": "0x1"})));
        assert_eq!(registry.state("0x1"), SubscriptionState::Unsubscribed);
        assert_eq!(registry.len(), 2);

        drop(pending);
        registry.mark_reconnecting();
        let resubscribe = registry.begin_resubscribe();
        assert_eq!(resubscribe.len(), 1);
        assert_eq!(resubscribe[0].0, "0x2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn matching_uses_the_method_prefix() {
        let mut registry = SubscriptionRegistry::new(4);
        let _eth = registry.insert("0x1".into(), heads());
        let _cfx = registry.insert("0x2".into(), SubscribeRequest::new("cfx_subscribe", "epochs", vec![]));

        let eth = registry.matching(Some("eth_unsubscribe"));
        assert_eq!(eth, vec![("0x1".to_string(), "eth_unsubscribe".to_string())]);

        let mut all = registry.matching(None);
        all.sort();
        assert_eq!(
            all,
            vec![
                ("0x1".to_string(), "eth_unsubscribe".to_string()),
                ("0x2".to_string(), "cfx_unsubscribe".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn fail_all_closes_every_receiver() {
        let mut registry = SubscriptionRegistry::new(4);
        let mut subscription = registry.insert("0x1".into(), heads());
        registry.fail_all(|| Error::ReconnectFailed { attempts: 3 });
        assert!(matches!(subscription.next().await, Some(Err(Error::ReconnectFailed { attempts: 3 }))));
        assert!(subscription.next().await.is_none());
    }
}
