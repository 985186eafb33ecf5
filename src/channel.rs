//! Channel hierarchy and glob dispatch.
//!
//! Bayeux channels are slash-separated paths (`/a/b/c`). A message
//! delivered on such a path is also routed to single-level (`/a/b/*`) and
//! recursive (`/a/**`, `/a/b/**`, `/**`) glob subscribers, in that order,
//! innermost scope first.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tracing::warn;

use crate::message::Message;

pub type Listener = Box<dyn Fn(&Message) + Send + Sync>;

struct Entry {
    id: u64,
    /// Listeners survive a handshake reset; subscriptions do not.
    is_listener: bool,
    callback: Listener,
}

/// Routes incoming messages to subscribers and permanent listeners.
#[derive(Default)]
pub struct ChannelBus {
    entries: RwLock<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

/// Identifies a single subscription so it can later be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn insert(&self, channel: &str, is_listener: bool, callback: Listener) -> (SubscriptionId, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap();
        let bucket = entries.entry(channel.to_string()).or_default();
        let first_subscriber = !is_listener && bucket.iter().all(|e| e.is_listener);
        bucket.push(Entry {
            id,
            is_listener,
            callback,
        });
        (SubscriptionId(id), first_subscriber)
    }

    /// Registers a subscription. Returns whether this was the first local
    /// subscriber for `channel` (crossing 0 -> 1), which decides whether
    /// the caller must emit a `/meta/subscribe`.
    pub fn subscribe(&self, channel: &str, callback: Listener) -> (SubscriptionId, bool) {
        self.insert(channel, false, callback)
    }

    /// Registers a permanent listener. Never counted for subscribe/unsubscribe
    /// dedup and never cleared by [`ChannelBus::clear_subscriptions`].
    pub fn add_listener(&self, channel: &str, callback: Listener) -> SubscriptionId {
        self.insert(channel, true, callback).0
    }

    /// Removes a subscription or listener. Returns whether this removed the
    /// last local subscriber for its channel (crossing 1 -> 0).
    pub fn remove(&self, channel: &str, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap();
        let Some(bucket) = entries.get_mut(channel) else {
            return false;
        };
        bucket.retain(|e| e.id != id.0);
        let remaining_subscribers = bucket.iter().filter(|e| !e.is_listener).count();
        if bucket.is_empty() {
            entries.remove(channel);
        }
        remaining_subscribers == 0
    }

    /// Clears every non-listener subscription, e.g. on a requested
    /// handshake. Listeners are left in place.
    pub fn clear_subscriptions(&self) {
        let mut entries = self.entries.write().unwrap();
        for bucket in entries.values_mut() {
            bucket.retain(|e| e.is_listener);
        }
        entries.retain(|_, bucket| !bucket.is_empty());
    }

    /// Every pattern that should be notified for a message delivered on
    /// `channel`, most specific first: the exact channel, the single-level
    /// wildcard at the immediate parent, then recursive wildcards from the
    /// deepest prefix out to the root.
    fn matching_patterns(channel: &str) -> Vec<String> {
        let segments: Vec<&str> = channel.trim_start_matches('/').split('/').collect();
        let mut patterns = vec![channel.to_string()];

        let prefix = |n: usize| -> String {
            if n == 0 {
                String::new()
            } else {
                format!("/{}", segments[..n].join("/"))
            }
        };

        patterns.push(format!("{}/*", prefix(segments.len() - 1)));

        for i in (0..segments.len()).rev() {
            patterns.push(format!("{}/**", prefix(i)));
        }

        patterns
    }

    /// Dispatches `message` to every matching subscriber and listener.
    ///
    /// A callback that panics is caught and logged; dispatch continues to
    /// the remaining callbacks rather than unwinding past this call.
    pub fn dispatch(&self, message: &Message) {
        let entries = self.entries.read().unwrap();
        for pattern in Self::matching_patterns(&message.channel) {
            let Some(bucket) = entries.get(&pattern) else {
                continue;
            };
            for entry in bucket {
                let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)(message)));
                if result.is_err() {
                    warn!(channel = %message.channel, pattern = %pattern, "channel listener panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn msg(channel: &str) -> Message {
        Message::new::<()>("1", channel, None).unwrap()
    }

    #[test]
    fn exact_subscriber_receives_message() {
        let bus = ChannelBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("/foo/bar", Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.dispatch(&msg("/foo/bar"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn single_level_wildcard_matches_only_immediate_children() {
        let bus = ChannelBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("/foo/*", Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.dispatch(&msg("/foo/bar"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.dispatch(&msg("/foo/bar/baz"));
        assert_eq!(hits.load(Ordering::SeqCst), 1, "single-level glob must not match two levels down");
    }

    #[test]
    fn recursive_wildcard_matches_any_depth() {
        let bus = ChannelBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("/foo/**", Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.dispatch(&msg("/foo/bar"));
        bus.dispatch(&msg("/foo/bar/baz"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribe_dedup_reports_first_and_last() {
        let bus = ChannelBus::new();
        let (_id1, first) = bus.subscribe("/foo", Box::new(|_| {}));
        assert!(first);
        let (id2, first2) = bus.subscribe("/foo", Box::new(|_| {}));
        assert!(!first2);

        let last = bus.remove("/foo", id2);
        assert!(!last, "one subscriber remains");
    }

    #[test]
    fn clear_subscriptions_keeps_listeners() {
        let bus = ChannelBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("/foo", Box::new(|_| {}));
        bus.add_listener("/foo", Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.clear_subscriptions();
        bus.dispatch(&msg("/foo"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let bus = ChannelBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        bus.subscribe("/foo", Box::new(|_| panic!("boom")));
        let h = hits.clone();
        bus.subscribe("/foo", Box::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        bus.dispatch(&msg("/foo"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
