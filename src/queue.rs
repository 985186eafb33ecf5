//! Outbound message buffer held while the session cannot send immediately
//! (batching, or not yet past the handshake).

use std::sync::Mutex;

use crate::message::Message;

#[derive(Default)]
pub struct MessageQueue {
    messages: Mutex<Vec<Message>>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, message: Message) {
        self.messages.lock().unwrap().push(message);
    }

    /// Removes and returns every queued message, leaving the queue empty.
    ///
    /// Swap-with-empty rather than `drain()` so two concurrent flushes can
    /// never both observe (and double-send) the same batch.
    pub fn drain(&self) -> Vec<Message> {
        let mut guard = self.messages.lock().unwrap();
        std::mem::take(&mut *guard)
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_the_queue_and_preserves_order() {
        let q = MessageQueue::new();
        q.push(Message::new::<()>("1", "/a", None).unwrap());
        q.push(Message::new::<()>("2", "/b", None).unwrap());
        assert_eq!(q.len(), 2);

        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, "1");
        assert_eq!(drained[1].id, "2");
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_drains_never_duplicate_messages() {
        use std::sync::Arc;
        use std::thread;

        let q = Arc::new(MessageQueue::new());
        for i in 0..100 {
            q.push(Message::new::<()>(i.to_string(), "/a", None).unwrap());
        }

        let q1 = q.clone();
        let q2 = q.clone();
        let h1 = thread::spawn(move || q1.drain());
        let h2 = thread::spawn(move || q2.drain());
        let a = h1.join().unwrap();
        let b = h2.join().unwrap();

        assert_eq!(a.len() + b.len(), 100);
        assert!(q.is_empty());
    }
}
