//! Pluggable transport interface and registry.
//!
//! A [`Transport`] only knows how to move batches of messages across one
//! kind of wire; it has no opinion about session lifecycle. Replies (and
//! failures) are pushed back to the engine through a [`TransportListener`]
//! rather than returned from `send`, since a real long-polling or
//! WebSocket transport does not get its reply back on the same call that
//! sent the request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::{BayeuxError, Result};
use crate::message::Message;

/// A boxed, `Send` future — lets [`Transport`] use plain methods that
/// return async work instead of requiring an `async-trait` dependency
/// this crate otherwise has no use for.
pub type DynFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receives messages and failures pushed back by a transport.
pub trait TransportListener: Send + Sync {
    /// Called with every message (reply or server push) a transport
    /// receives, in wire order.
    fn on_messages(&self, messages: Vec<Message>);

    /// Called when a batch could not be delivered or no reply arrived.
    /// `messages` are the requests that are now presumed failed so the
    /// engine can synthesize failure replies for each of them.
    fn on_failure(&self, messages: &[Message], error: &BayeuxError);
}

/// One wire protocol capable of carrying Bayeux messages.
pub trait Transport: Send + Sync {
    /// The name advertised in `supportedConnectionTypes`, e.g.
    /// `"long-polling"` or `"websocket"`.
    fn name(&self) -> &str;

    /// Whether this transport can be used for `url` at the negotiated
    /// protocol `version`. Lets a transport decline based on URL scheme.
    fn accept(&self, version: &str, url: &str) -> bool;

    /// Prepares the transport to communicate with `url`, registering the
    /// listener that will receive replies for the lifetime of the
    /// transport.
    fn init<'a>(&'a self, url: &'a str, listener: Arc<dyn TransportListener>) -> DynFuture<'a, Result<()>>;

    /// Sends a batch of messages. Resolves once the batch has been
    /// handed off, not once replies arrive — those come back through the
    /// listener registered in [`Transport::init`].
    fn send<'a>(&'a self, messages: Vec<Message>) -> DynFuture<'a, Result<()>>;

    /// Gracefully shuts the transport down, e.g. closing sockets.
    fn terminate<'a>(&'a self) -> DynFuture<'a, ()>;

    /// Tears the transport down immediately, without waiting on in-flight
    /// work, for the disconnect-without-reply-wait path.
    fn abort(&self);
}

/// Registers the transports a client is willing to use and negotiates
/// one against a server-advertised list.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
        }
    }

    /// Registers a transport. Registration order is the client's
    /// preference order used during negotiation.
    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    /// Looks up a registered transport by name, e.g. to re-acquire the
    /// transport a prior negotiation picked.
    pub fn find(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.name() == name).cloned()
    }

    /// Picks the first client-preferred, server-supported, `accept`-ing
    /// transport. `client-order priority`: the first transport in
    /// registration order whose name appears in `server_supported` wins.
    pub fn negotiate(
        &self,
        version: &str,
        url: &str,
        server_supported: &[String],
    ) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .filter(|t| t.accept(version, url))
            .find(|t| server_supported.iter().any(|s| s == t.name()))
            .cloned()
    }

    /// The client's offered transport names, in preference order, used
    /// to populate `supportedConnectionTypes` on the handshake request.
    pub fn client_names(&self, version: &str, url: &str) -> Vec<String> {
        self.transports
            .iter()
            .filter(|t| t.accept(version, url))
            .map(|t| t.name().to_string())
            .collect()
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! A scriptable transport double for tests: push expected outcomes,
    //! pop sent batches, assert on what was sent.

    use super::*;
    use std::sync::Mutex;

    enum Scripted {
        Reply(Vec<Message>),
        Fail(BayeuxError),
    }

    #[derive(Default)]
    pub struct MockTransport {
        name: String,
        sent: Mutex<Vec<Message>>,
        script: Mutex<std::collections::VecDeque<Scripted>>,
        listener: Mutex<Option<Arc<dyn TransportListener>>>,
    }

    impl MockTransport {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                sent: Mutex::new(Vec::new()),
                script: Mutex::new(std::collections::VecDeque::new()),
                listener: Mutex::new(None),
            }
        }

        /// Queues a reply batch to deliver on the next `send`.
        pub fn push_reply(&self, messages: Vec<Message>) {
            self.script.lock().unwrap().push_back(Scripted::Reply(messages));
        }

        /// Queues a failure to deliver on the next `send`.
        pub fn push_failure(&self, error: BayeuxError) {
            self.script.lock().unwrap().push_back(Scripted::Fail(error));
        }

        /// Pops every batch sent so far, in order.
        pub fn drain_sent(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// Pushes messages straight to the registered listener, simulating
        /// a reply or server push that arrives out of band rather than
        /// synchronously on the `send` call that triggered it.
        pub fn deliver(&self, messages: Vec<Message>) {
            if let Some(listener) = self.listener.lock().unwrap().clone() {
                listener.on_messages(messages);
            }
        }
    }

    impl Transport for MockTransport {
        fn name(&self) -> &str {
            &self.name
        }

        fn accept(&self, _version: &str, _url: &str) -> bool {
            true
        }

        fn init<'a>(
            &'a self,
            _url: &'a str,
            listener: Arc<dyn TransportListener>,
        ) -> DynFuture<'a, Result<()>> {
            *self.listener.lock().unwrap() = Some(listener);
            Box::pin(async { Ok(()) })
        }

        fn send<'a>(&'a self, messages: Vec<Message>) -> DynFuture<'a, Result<()>> {
            self.sent.lock().unwrap().extend(messages.iter().cloned());
            let scripted = self.script.lock().unwrap().pop_front();
            let listener = self.listener.lock().unwrap().clone();
            Box::pin(async move {
                match (scripted, listener) {
                    (Some(Scripted::Reply(reply)), Some(listener)) => {
                        listener.on_messages(reply);
                        Ok(())
                    }
                    (Some(Scripted::Fail(err)), Some(listener)) => {
                        listener.on_failure(&messages, &err);
                        Err(BayeuxError::Transport(err.to_string()))
                    }
                    _ => Ok(()),
                }
            })
        }

        fn terminate<'a>(&'a self) -> DynFuture<'a, ()> {
            Box::pin(async {})
        }

        fn abort(&self) {}
    }
}
