use crate::core::traits::NotificationHandler;
use crate::core::types::{Epoch, Notification};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

struct Entry {
    handler: Arc<dyn NotificationHandler>,
    /// Insertion sequence, used to replay in original add order
    seq: u64,
    /// Connection the subscribe call was last sent on
    sent_on: Option<Epoch>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: u64,
}

/// Channels the caller wants active, and the handler consuming each one.
///
/// Every registered channel is "desired": it is replayed after each reconnect
/// until `remove` drops it. Handlers are invoked outside the lock.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `channel`.
    ///
    /// Re-adding an existing channel swaps its handler but keeps its original
    /// replay position. Returns `true` if the channel was not registered before.
    pub fn add(&self, channel: &str, handler: Arc<dyn NotificationHandler>) -> bool {
        let mut inner = self.write();
        if let Some(entry) = inner.entries.get_mut(channel) {
            entry.handler = handler;
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            channel.to_string(),
            Entry {
                handler,
                seq,
                sent_on: None,
            },
        );
        true
    }

    /// Stop wanting `channel`. Returns `false` if it was not registered.
    pub fn remove(&self, channel: &str) -> bool {
        self.write().entries.remove(channel).is_some()
    }

    pub fn contains(&self, channel: &str) -> bool {
        self.read().entries.contains_key(channel)
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Deliver a notification to its channel's handler.
    ///
    /// Notifications for unknown channels are discarded with a warning: they are
    /// expected around subscribe/unsubscribe races. Returns whether a handler ran.
    pub fn dispatch(&self, notification: Notification) -> bool {
        let handler = self
            .read()
            .entries
            .get(&notification.channel)
            .map(|entry| Arc::clone(&entry.handler));

        match handler {
            Some(handler) => {
                handler.handle(notification);
                true
            }
            None => {
                warn!(channel = %notification.channel, "Notification for unsubscribed channel discarded");
                false
            }
        }
    }

    /// Channels to replay after reconnecting, in the order they were first added.
    pub fn all_desired(&self) -> Vec<String> {
        let inner = self.read();
        let channels = ordered(inner.entries.iter());
        debug!(count = channels.len(), "Collected desired subscriptions");
        channels
    }

    /// Take the right to send `channel`'s subscribe call on `epoch`.
    ///
    /// Only the first claimant per channel and epoch gets `true`; unknown
    /// channels are never claimed.
    pub fn claim(&self, channel: &str, epoch: Epoch) -> bool {
        match self.write().entries.get_mut(channel) {
            Some(entry) if entry.sent_on != Some(epoch) => {
                entry.sent_on = Some(epoch);
                true
            }
            _ => false,
        }
    }

    /// Claim every channel not yet sent on `epoch`, in add order.
    pub fn claim_unsent(&self, epoch: Epoch) -> Vec<String> {
        let mut inner = self.write();
        let unsent = inner
            .entries
            .iter_mut()
            .filter(|(_, entry)| entry.sent_on != Some(epoch));
        let mut claimed = Vec::new();
        for (channel, entry) in unsent {
            entry.sent_on = Some(epoch);
            claimed.push((channel.clone(), entry.seq));
        }
        claimed.sort_by_key(|(_, seq)| *seq);
        claimed.into_iter().map(|(channel, _)| channel).collect()
    }
}

fn ordered<'a>(entries: impl Iterator<Item = (&'a String, &'a Entry)>) -> Vec<String> {
    let mut channels: Vec<(&String, u64)> = entries.map(|(channel, entry)| (channel, entry.seq)).collect();
    channels.sort_by_key(|(_, seq)| *seq);
    channels.into_iter().map(|(channel, _)| channel.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> (Arc<dyn NotificationHandler>, Arc<Mutex<Vec<serde_json::Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |n: Notification| sink.lock().unwrap().push(n.data);
        (Arc::new(handler), seen)
    }

    fn notification(channel: &str, data: serde_json::Value) -> Notification {
        Notification {
            channel: channel.to_string(),
            data,
        }
    }

    #[test]
    fn test_dispatch_routes_by_channel() {
        let registry = SubscriptionRegistry::new();
        let (book_x, seen_x) = recorder();
        let (book_y, seen_y) = recorder();
        registry.add("book.X", book_x);
        registry.add("book.Y", book_y);

        assert!(registry.dispatch(notification("book.X", json!(1))));
        assert!(registry.dispatch(notification("book.Y", json!(2))));
        assert!(registry.dispatch(notification("book.X", json!(3))));

        assert_eq!(*seen_x.lock().unwrap(), vec![json!(1), json!(3)]);
        assert_eq!(*seen_y.lock().unwrap(), vec![json!(2)]);
    }

    #[test]
    fn test_unknown_channel_is_discarded() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.dispatch(notification("ticker.ETH", json!({}))));
    }

    #[test]
    fn test_all_desired_keeps_add_order() {
        let registry = SubscriptionRegistry::new();
        for channel in ["c", "a", "d", "b"] {
            let (handler, _) = recorder();
            registry.add(channel, handler);
        }
        registry.remove("d");
        let (handler, _) = recorder();
        assert!(!registry.add("c", handler));

        assert_eq!(registry.all_desired(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_remove_stops_delivery() {
        let registry = SubscriptionRegistry::new();
        let (handler, seen) = recorder();
        registry.add("trades.X", handler);
        assert!(registry.remove("trades.X"));
        assert!(!registry.remove("trades.X"));
        assert!(!registry.dispatch(notification("trades.X", json!(1))));
        assert!(seen.lock().unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_each_channel_is_claimed_once_per_epoch() {
        let registry = SubscriptionRegistry::new();
        for channel in ["b", "a"] {
            let (handler, _) = recorder();
            registry.add(channel, handler);
        }

        assert_eq!(registry.claim_unsent(1), vec!["b", "a"]);
        assert!(!registry.claim("a", 1));

        // Added after the replay snapshot: exactly one side may send it
        let (handler, _) = recorder();
        registry.add("c", handler);
        assert!(registry.claim("c", 1));
        assert!(registry.claim_unsent(1).is_empty());

        // A new connection starts unclaimed
        assert_eq!(registry.claim_unsent(2), vec!["b", "a", "c"]);
        assert!(!registry.claim("missing", 2));
    }

    #[test]
    fn test_handler_may_touch_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let inner = Arc::clone(&registry);
        let handler = move |n: Notification| {
            inner.remove(&n.channel);
        };
        registry.add("once", Arc::new(handler));
        assert!(registry.dispatch(notification("once", json!(null))));
        assert!(!registry.contains("once"));
    }
}
