//! Correlates in-flight requests with the reply that eventually answers them.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::message::Message;

/// A one-shot callback invoked with the reply matching a request's `id`.
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send>;

/// Maps a message id to the callback that should receive its reply.
///
/// A callback is removed from the table before it is invoked, mirroring
/// the `pending` map in the teacher's WebSocket client: correlation state
/// must never outlive its single use.
#[derive(Default)]
pub struct CallbackTable {
    pending: Mutex<HashMap<String, ReplyCallback>>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a callback for `id`. Overwrites (and drops) any prior
    /// callback registered under the same id.
    pub fn register(&self, id: impl Into<String>, callback: ReplyCallback) {
        self.pending.lock().unwrap().insert(id.into(), callback);
    }

    /// Removes and returns the callback registered for `id`, if any.
    pub fn take(&self, id: &str) -> Option<ReplyCallback> {
        self.pending.lock().unwrap().remove(id)
    }

    /// Resolves the callback for `reply.id`, if one is registered.
    pub fn resolve(&self, reply: Message) {
        if let Some(cb) = self.take(&reply.id) {
            cb(reply);
        }
    }

    pub fn cancel(&self, id: &str) {
        self.pending.lock().unwrap().remove(id);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
