//! Session engine: the public client surface.
//!
//! Ties the state machine, reconnect policy, transport registry and
//! channel bus together. Every public method is synchronous and returns
//! immediately; the actual network I/O a call triggers (sending a
//! handshake, negotiating a transport, flushing a batch) is handed off to
//! a spawned task, matching the "no transition blocks on I/O" rule — the
//! CAS that changes the session's state always happens on the calling
//! thread, before any socket is touched.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::callback::{CallbackTable, ReplyCallback};
use crate::channel::{ChannelBus, Listener, SubscriptionId};
use crate::error::{BayeuxError, Result};
use crate::message::{
    Advice, IdGenerator, Message, ReconnectAdvice, BAYEUX_VERSION, META_CONNECT, META_DISCONNECT,
    META_HANDSHAKE, META_SUBSCRIBE, META_UNSUBSCRIBE,
};
use crate::queue::MessageQueue;
use crate::reconnect::ReconnectConfig;
use crate::scheduler::Scheduler;
use crate::state::{SessionState, StateMachine, StateTag};
use crate::transport::{Transport, TransportListener, TransportRegistry};

/// Client-side policy knobs, constructed once by the embedding
/// application and cloned into the engine.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The Bayeux endpoint, passed to every transport's `init`.
    pub url: String,
    pub backoff_increment: Duration,
    pub max_backoff: Duration,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            backoff_increment: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

/// What a handshake reply means for the in-flight `handshake()` call: has
/// it finally resolved, or is the engine retrying transparently.
enum HandshakeOutcome {
    Resolved(Message),
    Retrying(Message),
}

struct Inner {
    config: SessionConfig,
    reconnect: ReconnectConfig,
    registry: Mutex<TransportRegistry>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    negotiated_transport_name: Mutex<Option<String>>,
    state: StateMachine,
    channels: ChannelBus,
    queue: MessageQueue,
    callbacks: CallbackTable,
    ids: IdGenerator,
    batch_depth: Mutex<usize>,
    /// Sticky copy of the most recently received advice, used when a
    /// reply (or a synthesized transport-failure reply) carries none.
    advice: Mutex<Advice>,
    handshake_fields: Mutex<HashMap<String, Value>>,
    /// Fires once when the in-flight handshake() call finally resolves
    /// (success or terminal failure), not on every intermediate rehandshake
    /// retry.
    handshake_callback: Mutex<Option<ReplyCallback>>,
    /// Whether the next `/meta/connect` this engine sends must carry
    /// `advice.timeout = 0`, per the "first connect after handshake or an
    /// unconnected failure" rule.
    immediate_next_connect: Mutex<bool>,
    scheduler: Scheduler,
}

/// A live Bayeux client session. Cheap to clone — clones share the same
/// underlying state.
#[derive(Clone)]
pub struct SessionEngine(Arc<Inner>);

struct EngineListener(Weak<Inner>);

impl TransportListener for EngineListener {
    fn on_messages(&self, messages: Vec<Message>) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let engine = SessionEngine(inner);
        for message in messages {
            engine.handle_incoming(message);
        }
    }

    fn on_failure(&self, messages: &[Message], error: &BayeuxError) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let engine = SessionEngine(inner);
        engine.handle_transport_failure(messages, error);
    }
}

impl SessionEngine {
    /// Builds a new session with a scheduler it owns and will shut down
    /// on termination.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_scheduler(config, Scheduler::owned())
    }

    /// Builds a new session against a scheduler shared with other
    /// sessions; it is never shut down by this engine.
    pub fn with_injected_scheduler(config: SessionConfig, scheduler: Scheduler) -> Self {
        Self::with_scheduler(config, scheduler)
    }

    fn with_scheduler(config: SessionConfig, scheduler: Scheduler) -> Self {
        let reconnect = ReconnectConfig {
            backoff_increment: config.backoff_increment,
            max_backoff: config.max_backoff,
        };
        Self(Arc::new(Inner {
            config,
            reconnect,
            registry: Mutex::new(TransportRegistry::new()),
            transport: Mutex::new(None),
            negotiated_transport_name: Mutex::new(None),
            state: StateMachine::new(),
            channels: ChannelBus::new(),
            queue: MessageQueue::new(),
            callbacks: CallbackTable::new(),
            ids: IdGenerator::new(),
            batch_depth: Mutex::new(0),
            advice: Mutex::new(Advice::default()),
            handshake_fields: Mutex::new(HashMap::new()),
            handshake_callback: Mutex::new(None),
            immediate_next_connect: Mutex::new(false),
            scheduler,
        }))
    }

    /// Registers a transport. Registration order is the client's
    /// preference order used during negotiation.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.0.registry.lock().unwrap().register(transport);
    }

    pub fn tag(&self) -> StateTag {
        self.0.state.tag()
    }

    pub fn client_id(&self) -> Option<String> {
        self.0.state.snapshot().client_id().map(str::to_string)
    }

    /// The backoff currently carried by a `REHANDSHAKING` or `UNCONNECTED`
    /// state, if the session is in one of those states.
    pub fn backoff(&self) -> Option<Duration> {
        self.0.state.snapshot().backoff()
    }

    /// Blocks the caller until the state tag equals or implies one of
    /// `targets`, or `deadline` elapses.
    pub fn wait_for(&self, deadline: Duration, targets: &[StateTag]) -> bool {
        self.0.state.wait_for(deadline, targets)
    }

    fn client_names(&self) -> Vec<String> {
        self.0
            .registry
            .lock()
            .unwrap()
            .client_names(BAYEUX_VERSION, &self.0.config.url)
    }

    // ---- public lifecycle operations ----------------------------------

    /// Initiates a handshake. `template` fields are merged onto the
    /// handshake message (see [`Message::merge_template`]); `callback`
    /// fires once when the handshake finally resolves, success or
    /// terminal failure, not on every intermediate rehandshake retry.
    pub fn handshake(
        &self,
        template: Option<HashMap<String, Value>>,
        callback: Option<ReplyCallback>,
    ) -> Result<()> {
        let outcome = self
            .0
            .state
            .update(|s| matches!(s.tag(), StateTag::Disconnected).then_some(SessionState::Handshaking));
        if !outcome.applied() {
            return Err(BayeuxError::IllegalUse(
                "handshake() called while session is not disconnected",
            ));
        }

        // A requested handshake clears subscriptions; auto-rehandshake
        // retries triggered by server advice do not re-enter here.
        self.0.channels.clear_subscriptions();
        if let Some(fields) = template {
            *self.0.handshake_fields.lock().unwrap() = fields;
        }
        *self.0.handshake_callback.lock().unwrap() = callback;

        let client_names = self.client_names();
        if client_names.is_empty() {
            self.enter_terminating(false);
            return Err(BayeuxError::NoTransport {
                client: Vec::new(),
                server: Vec::new(),
            });
        }

        let name = client_names[0].clone();
        let transport = self.0.registry.lock().unwrap().find(&name);
        let Some(transport) = transport else {
            self.enter_terminating(false);
            return Err(BayeuxError::NoTransport {
                client: client_names,
                server: Vec::new(),
            });
        };

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.init_transport(transport, &name).await {
                warn!(error = %e, "failed to initialize transport for handshake");
                engine.enter_terminating(false);
                return;
            }
            if let Err(e) = engine.send_handshake_message(client_names).await {
                warn!(error = %e, "failed to send handshake");
            }
        });
        Ok(())
    }

    /// Disconnects cleanly if a connection is in progress or established;
    /// otherwise moves straight to termination.
    pub fn disconnect(&self, callback: Option<ReplyCallback>) {
        let tag = self.0.state.tag();
        if matches!(
            tag,
            StateTag::Connecting | StateTag::Connected | StateTag::Disconnecting
        ) {
            let captured = Cell::new(None::<String>);
            let outcome = self.0.state.update(|s| {
                let client_id = s.client_id().map(str::to_string);
                captured.set(client_id.clone());
                Some(SessionState::Disconnecting { client_id })
            });
            if outcome.applied() {
                self.schedule_send_disconnect(callback, captured.into_inner());
            }
        } else {
            self.enter_terminating(false);
            if let Some(cb) = callback {
                if let Ok(mut synthetic) = Message::new::<()>(self.0.ids.next(), META_DISCONNECT, None) {
                    synthetic.successful = Some(true);
                    cb(synthetic);
                }
            }
        }
    }

    /// Terminates immediately: the transport's `abort()` runs instead of
    /// a clean `terminate()`, and no `/meta/disconnect` is sent.
    pub fn abort(&self) {
        let outcome = self.0.state.update(|_| Some(SessionState::Terminating { abort: true }));
        if outcome.applied() {
            self.run_terminating_cleanup();
        }
    }

    /// Publishes application data. Rejects meta channels outright.
    pub fn publish<T: Serialize>(
        &self,
        channel: &str,
        data: &T,
        callback: Option<ReplyCallback>,
    ) -> Result<()> {
        if channel.starts_with("/meta/") {
            return Err(BayeuxError::IllegalUse("cannot publish on a meta channel"));
        }
        let id = self.0.ids.next();
        let mut msg = Message::new(id.clone(), channel, Some(data))?;
        msg.client_id = self.client_id();
        if let Some(cb) = callback {
            self.0.callbacks.register(id, cb);
        }
        self.send_or_queue(msg);
        Ok(())
    }

    /// Subscribes to `channel`. Sends `/meta/subscribe` only when this
    /// crosses 0 -> 1 local subscribers for the channel. Rejected while the
    /// session has never been handshaken (or has fully terminated back to
    /// `DISCONNECTED`): there is no session for the server to associate the
    /// subscription with.
    pub fn subscribe(&self, channel: impl Into<String>, callback: Listener) -> Result<SubscriptionId> {
        if matches!(self.0.state.tag(), StateTag::Disconnected) {
            return Err(BayeuxError::IllegalUse("cannot subscribe while disconnected"));
        }
        let channel = channel.into();
        let (id, first) = self.0.channels.subscribe(&channel, callback);
        if first {
            self.send_meta_subscribe(channel, false);
        }
        Ok(id)
    }

    /// Unsubscribes. Sends `/meta/unsubscribe` only when this crosses the
    /// last local subscriber for the channel.
    pub fn unsubscribe(&self, channel: &str, id: SubscriptionId) {
        let last = self.0.channels.remove(channel, id);
        if last {
            self.send_meta_subscribe(channel.to_string(), true);
        }
    }

    /// Registers a permanent listener, never cleared by a handshake reset.
    pub fn add_listener(&self, channel: impl AsRef<str>, callback: Listener) -> SubscriptionId {
        self.0.channels.add_listener(channel.as_ref(), callback)
    }

    /// Sends `data` to `/service/<target>`. If no reply arrives within
    /// `timeout`, synthesizes a failure with `error: "406::timeout"`.
    pub fn remote_call<T: Serialize>(
        &self,
        target: &str,
        data: &T,
        timeout: Duration,
        callback: ReplyCallback,
    ) -> Result<()> {
        let channel = format!("/service/{target}");
        let id = self.0.ids.next();
        let mut msg = Message::new(id.clone(), channel.clone(), Some(data))?;
        msg.client_id = self.client_id();
        self.0.callbacks.register(id.clone(), callback);

        let engine = self.clone();
        let timeout_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(cb) = engine.0.callbacks.take(&timeout_id) {
                if let Ok(mut synthetic) = Message::new::<()>(timeout_id, channel, None) {
                    synthetic.successful = Some(false);
                    synthetic.error = Some("406::timeout".to_string());
                    cb(synthetic);
                }
            }
        });

        self.send_or_queue(msg);
        Ok(())
    }

    /// Opens a nestable batch: outbound messages are queued rather than
    /// sent until the outermost `end_batch`.
    pub fn start_batch(&self) {
        *self.0.batch_depth.lock().unwrap() += 1;
    }

    /// Closes one level of batching. At depth 0 this flushes the queue.
    pub fn end_batch(&self) -> Result<()> {
        let mut depth = self.0.batch_depth.lock().unwrap();
        if *depth == 0 {
            return Err(BayeuxError::UnbalancedBatch);
        }
        *depth -= 1;
        let flush = *depth == 0;
        drop(depth);
        if flush {
            let engine = self.clone();
            tokio::spawn(async move { engine.flush_queue().await });
        }
        Ok(())
    }

    // ---- meta-reply classification -------------------------------------

    fn handle_incoming(&self, message: Message) {
        match message.channel.as_str() {
            META_HANDSHAKE => self.handle_handshake_reply(message),
            META_CONNECT => self.handle_connect_reply(message),
            META_DISCONNECT => self.handle_disconnect_reply(message),
            _ => {
                self.0.callbacks.resolve(message.clone());
                self.0.channels.dispatch(&message);
            }
        }
    }

    fn handle_transport_failure(&self, messages: &[Message], error: &BayeuxError) {
        let connection_type = self.0.negotiated_transport_name.lock().unwrap().clone();
        for message in messages {
            warn!(channel = %message.channel, error = %error, "transport failure");
            let synthetic = message.synthetic_failure(error.to_string(), connection_type.clone());
            self.handle_incoming(synthetic);
        }
    }

    fn handle_handshake_reply(&self, reply: Message) {
        // Held across both the transition applied below and the
        // callbacks/dispatch that follow, so a concurrent `wait_for` never
        // observes the new tag before listeners have actually been told.
        let _scope = self.0.state.enter_update_scope();
        let outcome = if reply.successful.unwrap_or(false) {
            self.process_successful_handshake(reply)
        } else {
            self.process_failed_handshake(reply)
        };
        let message = match outcome {
            HandshakeOutcome::Resolved(msg) => {
                self.resolve_handshake(msg.clone());
                msg
            }
            HandshakeOutcome::Retrying(msg) => msg,
        };
        self.0.callbacks.resolve(message.clone());
        self.0.channels.dispatch(&message);
    }

    /// What a handshake reply (real or client-synthesized) means for the
    /// `handshake()` caller's one-shot callback: whether the call has
    /// finally resolved, or the engine is about to retry transparently.
    /// Either way the carried message is what channel listeners see.
    fn process_successful_handshake(&self, reply: Message) -> HandshakeOutcome {
        if let Some(advice) = &reply.advice {
            *self.0.advice.lock().unwrap() = advice.clone();
        }

        let server_supported = reply.supported_connection_types.clone().unwrap_or_default();
        let client_names = self.client_names();
        let negotiated = self
            .0
            .registry
            .lock()
            .unwrap()
            .negotiate(BAYEUX_VERSION, &self.0.config.url, &server_supported);

        let Some(transport) = negotiated else {
            let client_list = client_names.join(",");
            let server_list = server_supported.join(",");
            tracing::error!(client = %client_list, server = %server_list, "handshake negotiation failed");
            let mut synthetic = reply;
            synthetic.successful = Some(false);
            synthetic.error = Some(format!("405:c[{client_list}],s[{server_list}]:no transport"));
            self.enter_terminating(false);
            return HandshakeOutcome::Resolved(synthetic);
        };

        let reconnect = reply
            .advice
            .as_ref()
            .and_then(|a| a.reconnect)
            .unwrap_or(ReconnectAdvice::Retry);

        if reconnect == ReconnectAdvice::None {
            self.enter_terminating(false);
            return HandshakeOutcome::Resolved(reply);
        }

        let client_id = reply.client_id.clone().unwrap_or_default();
        let transport_name = transport.name().to_string();
        let transport_changed =
            self.0.negotiated_transport_name.lock().unwrap().as_deref() != Some(transport_name.as_str());

        let outcome = self
            .0
            .state
            .update(|_| Some(SessionState::Connecting { client_id: client_id.clone() }));
        if outcome.applied() {
            *self.0.immediate_next_connect.lock().unwrap() = true;
            let engine = self.clone();
            tokio::spawn(async move {
                if transport_changed {
                    engine.swap_transport(transport).await;
                }
                engine.flush_queue().await;
                if let Err(e) = engine.send_connect().await {
                    warn!(error = %e, "failed to send connect after handshake");
                }
            });
        }
        HandshakeOutcome::Resolved(reply)
    }

    fn process_failed_handshake(&self, reply: Message) -> HandshakeOutcome {
        if let Some(advice) = &reply.advice {
            *self.0.advice.lock().unwrap() = advice.clone();
        }
        let reconnect = reply
            .advice
            .as_ref()
            .and_then(|a| a.reconnect)
            .unwrap_or(ReconnectAdvice::Handshake);

        if reconnect == ReconnectAdvice::None {
            self.enter_terminating(false);
            return HandshakeOutcome::Resolved(reply);
        }

        let current_backoff = match self.0.state.snapshot() {
            SessionState::Rehandshaking { backoff } => backoff,
            _ => Duration::ZERO,
        };
        let backoff = self.0.reconnect.next_backoff(current_backoff);
        let outcome = self.0.state.update(|_| Some(SessionState::Rehandshaking { backoff }));
        if outcome.applied() {
            info!(backoff_ms = backoff.as_millis() as u64, "handshake failed, scheduling rehandshake");
            self.schedule_rehandshake(backoff);
        }
        HandshakeOutcome::Retrying(reply)
    }

    fn resolve_handshake(&self, reply: Message) {
        if let Some(cb) = self.0.handshake_callback.lock().unwrap().take() {
            cb(reply);
        }
    }

    fn handle_connect_reply(&self, reply: Message) {
        let _scope = self.0.state.enter_update_scope();
        if reply.successful.unwrap_or(false) {
            self.process_successful_connect(reply.clone());
        } else {
            self.process_failed_connect(reply.clone());
        }
        self.0.callbacks.resolve(reply.clone());
        self.0.channels.dispatch(&reply);
    }

    fn process_successful_connect(&self, reply: Message) {
        if let Some(advice) = &reply.advice {
            *self.0.advice.lock().unwrap() = advice.clone();
        }
        let reconnect = reply
            .advice
            .as_ref()
            .and_then(|a| a.reconnect)
            .unwrap_or(ReconnectAdvice::Retry);

        if reconnect == ReconnectAdvice::None {
            self.enter_disconnecting_from_server();
            return;
        }

        let Some(client_id) = reply.client_id.clone().or_else(|| self.client_id()) else {
            return;
        };
        let outcome = self.0.state.update(|s| match s.tag() {
            StateTag::Connecting | StateTag::Connected | StateTag::Unconnected => {
                Some(SessionState::Connected { client_id: client_id.clone() })
            }
            _ => None,
        });
        if outcome.applied() {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.send_connect().await {
                    warn!(error = %e, "failed to send next connect");
                }
            });
        }
    }

    fn process_failed_connect(&self, reply: Message) {
        if let Some(advice) = &reply.advice {
            *self.0.advice.lock().unwrap() = advice.clone();
        }
        let reconnect = reply
            .advice
            .as_ref()
            .and_then(|a| a.reconnect)
            .unwrap_or(ReconnectAdvice::Retry);

        match reconnect {
            ReconnectAdvice::Handshake => {
                let outcome = self
                    .0
                    .state
                    .update(|_| Some(SessionState::Rehandshaking { backoff: Duration::ZERO }));
                if outcome.applied() {
                    warn!("server requested rehandshake after failed connect");
                    self.schedule_rehandshake(Duration::ZERO);
                }
            }
            ReconnectAdvice::None => {
                self.enter_terminating(false);
            }
            ReconnectAdvice::Retry => {
                let reconnect_cfg = &self.0.reconnect;
                let captured_backoff = Cell::new(Duration::ZERO);
                let outcome = self.0.state.update(|s| {
                    let (current_backoff, unconnect_since, client_id) = match s {
                        SessionState::Unconnected { backoff, unconnect_since, client_id } => {
                            (*backoff, *unconnect_since, client_id.clone())
                        }
                        _ => (Duration::ZERO, Instant::now(), s.client_id()?.to_string()),
                    };
                    let next = reconnect_cfg.next_backoff(current_backoff);
                    captured_backoff.set(next);
                    Some(SessionState::Unconnected { client_id, backoff: next, unconnect_since })
                });
                if outcome.applied() {
                    warn!(backoff_ms = captured_backoff.get().as_millis() as u64, "connect failed, retrying");
                    self.schedule_unconnected_retry(captured_backoff.get());
                }
            }
        }
    }

    fn enter_disconnecting_from_server(&self) {
        let captured = Cell::new(None::<String>);
        let outcome = self.0.state.update(|s| {
            let client_id = s.client_id().map(str::to_string);
            captured.set(client_id.clone());
            Some(SessionState::Disconnecting { client_id })
        });
        if outcome.applied() {
            info!("server advice requested disconnect on a successful connect reply");
            self.schedule_send_disconnect(None, captured.into_inner());
        }
    }

    fn handle_disconnect_reply(&self, reply: Message) {
        let _scope = self.0.state.enter_update_scope();
        self.enter_terminating(false);
        self.0.callbacks.resolve(reply.clone());
        self.0.channels.dispatch(&reply);
    }

    // ---- scheduled and deferred actions --------------------------------

    fn schedule_rehandshake(&self, backoff: Duration) {
        let interval = Duration::from_millis(self.0.advice.lock().unwrap().interval.unwrap_or(0));
        let engine = self.clone();
        self.0.scheduler.schedule(backoff + interval, move || engine.retry_handshake());
    }

    fn retry_handshake(&self) {
        let client_names = self.client_names();
        if client_names.is_empty() {
            self.enter_terminating(false);
            return;
        }
        let name = client_names[0].clone();
        let transport = self.0.registry.lock().unwrap().find(&name);
        let engine = self.clone();
        tokio::spawn(async move {
            if let Some(transport) = transport {
                if let Err(e) = engine.ensure_transport(transport, &name).await {
                    warn!(error = %e, "failed to prepare transport for rehandshake");
                    return;
                }
            }
            if let Err(e) = engine.send_handshake_message(client_names).await {
                warn!(error = %e, "failed to send rehandshake");
            }
        });
    }

    fn schedule_unconnected_retry(&self, backoff: Duration) {
        let advice = self.0.advice.lock().unwrap().clone();
        let unconnect_since = match self.0.state.snapshot() {
            SessionState::Unconnected { unconnect_since, .. } => unconnect_since,
            _ => Instant::now(),
        };
        let elapsed = unconnect_since.elapsed();
        let max_interval = advice.max_interval.unwrap_or(0);
        let threshold = advice.timeout.unwrap_or(0) + advice.interval.unwrap_or(0) + max_interval;
        let should_escalate = max_interval > 0 && (elapsed + backoff).as_millis() as u64 > threshold;
        let interval = Duration::from_millis(advice.interval.unwrap_or(0));
        let delay = backoff + interval;

        if should_escalate {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                backoff_ms = backoff.as_millis() as u64,
                "unconnected too long, escalating to rehandshake instead of retrying connect"
            );
            let engine = self.clone();
            self.0.scheduler.schedule(delay, move || engine.escalate_to_rehandshake());
        } else {
            *self.0.immediate_next_connect.lock().unwrap() = true;
            let engine = self.clone();
            self.0.scheduler.schedule(delay, move || {
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = engine.send_connect().await {
                        warn!(error = %e, "failed unconnected retry connect");
                    }
                });
            });
        }
    }

    fn escalate_to_rehandshake(&self) {
        let outcome = self
            .0
            .state
            .update(|_| Some(SessionState::Rehandshaking { backoff: Duration::ZERO }));
        if outcome.applied() {
            self.schedule_rehandshake(Duration::ZERO);
        }
    }

    fn schedule_send_disconnect(&self, callback: Option<ReplyCallback>, client_id: Option<String>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let id = engine.0.ids.next();
            match Message::new::<()>(id.clone(), META_DISCONNECT, None) {
                Ok(mut msg) => {
                    msg.client_id = client_id;
                    if let Some(cb) = callback {
                        engine.0.callbacks.register(id, cb);
                    }
                    if let Err(e) = engine.send_now(vec![msg]).await {
                        warn!(error = %e, "failed to send disconnect");
                    }
                }
                Err(e) => warn!(error = %e, "failed to build disconnect message"),
            }
        });
    }

    fn enter_terminating(&self, abort: bool) -> bool {
        let outcome = self.0.state.update(|_| Some(SessionState::Terminating { abort }));
        if outcome.applied() {
            self.run_terminating_cleanup();
        }
        outcome.applied()
    }

    fn run_terminating_cleanup(&self) {
        self.0.scheduler.cancel_pending();
        let transport = self.0.transport.lock().unwrap().take();
        self.0.negotiated_transport_name.lock().unwrap().take();
        let abort = matches!(self.0.state.snapshot(), SessionState::Terminating { abort: true });
        let engine = self.clone();
        tokio::spawn(async move {
            if let Some(t) = transport {
                if abort {
                    t.abort();
                } else {
                    t.terminate().await;
                }
            }
            if engine.0.scheduler.is_owned() {
                engine.0.scheduler.shutdown();
            }
            engine.0.state.update(|_| Some(SessionState::Disconnected));
        });
    }

    // ---- wire plumbing ---------------------------------------------------

    async fn init_transport(&self, transport: Arc<dyn Transport>, name: &str) -> Result<()> {
        let listener: Arc<dyn TransportListener> = Arc::new(EngineListener(Arc::downgrade(&self.0)));
        transport.init(&self.0.config.url, listener).await?;
        *self.0.transport.lock().unwrap() = Some(transport);
        *self.0.negotiated_transport_name.lock().unwrap() = Some(name.to_string());
        Ok(())
    }

    async fn ensure_transport(&self, transport: Arc<dyn Transport>, name: &str) -> Result<()> {
        let already_active = self.0.negotiated_transport_name.lock().unwrap().as_deref() == Some(name);
        if already_active {
            return Ok(());
        }
        self.init_transport(transport, name).await
    }

    async fn swap_transport(&self, transport: Arc<dyn Transport>) {
        let old = self.0.transport.lock().unwrap().take();
        if let Some(old) = old {
            old.terminate().await;
        }
        let name = transport.name().to_string();
        if let Err(e) = self.init_transport(transport, &name).await {
            warn!(error = %e, "failed to initialize negotiated transport");
        }
    }

    /// Sends a batch through the active transport.
    ///
    /// Stamps `clientId` onto any message that does not already carry one
    /// immediately before handing the batch off, rather than trusting
    /// whatever `client_id()` returned when the message was built: a
    /// `publish`/`subscribe` enqueued before the handshake resolved was
    /// built with `client_id: None` (there was no session yet), and by the
    /// time it is actually flushed — after a successful handshake, or at
    /// the end of a batch opened before one — the session may well have a
    /// `clientId` the message still needs. A handshake request legitimately
    /// has no `clientId` to stamp; `client_id()` reads `None` for it too,
    /// so the no-op is harmless.
    async fn send_now(&self, mut messages: Vec<Message>) -> Result<()> {
        let client_id = self.client_id();
        for msg in &mut messages {
            if msg.client_id.is_none() {
                msg.client_id = client_id.clone();
            }
        }
        let transport = self.0.transport.lock().unwrap().clone();
        match transport {
            Some(t) => t.send(messages).await,
            None => Err(BayeuxError::Transport("no active transport".into())),
        }
    }

    async fn flush_queue(&self) {
        let queued = self.0.queue.drain();
        if queued.is_empty() {
            return;
        }
        if let Err(e) = self.send_now(queued).await {
            warn!(error = %e, "failed to flush queued messages");
        }
    }

    fn send_or_queue(&self, msg: Message) {
        let batching = *self.0.batch_depth.lock().unwrap() > 0;
        let handshaken = self.client_id().is_some();
        if batching || !handshaken {
            self.0.queue.push(msg);
        } else {
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.send_now(vec![msg]).await {
                    warn!(error = %e, "failed to send message");
                }
            });
        }
    }

    async fn send_handshake_message(&self, client_names: Vec<String>) -> Result<()> {
        let id = self.0.ids.next();
        let mut msg = Message::new::<()>(id, META_HANDSHAKE, None)?;
        msg.version = Some(BAYEUX_VERSION.to_string());
        msg.minimum_version = Some(BAYEUX_VERSION.to_string());
        msg.supported_connection_types = Some(client_names);
        let template = self.0.handshake_fields.lock().unwrap().clone();
        msg.merge_template(template);
        self.send_now(vec![msg]).await
    }

    async fn send_connect(&self) -> Result<()> {
        let Some(client_id) = self.client_id() else {
            return Err(BayeuxError::IllegalUse("no clientId to connect with"));
        };
        let id = self.0.ids.next();
        let mut msg = Message::new::<()>(id, META_CONNECT, None)?;
        msg.client_id = Some(client_id);
        msg.connection_type = self.0.negotiated_transport_name.lock().unwrap().clone();

        let immediate = {
            let mut flag = self.0.immediate_next_connect.lock().unwrap();
            std::mem::replace(&mut *flag, false)
        };
        if immediate {
            msg.advice = Some(Advice { timeout: Some(0), ..Advice::default() });
        }
        self.send_now(vec![msg]).await
    }

    fn send_meta_subscribe(&self, channel: String, unsubscribe: bool) {
        let channel_name = if unsubscribe { META_UNSUBSCRIBE } else { META_SUBSCRIBE };
        let id = self.0.ids.next();
        match Message::new::<()>(id, channel_name, None) {
            Ok(mut msg) => {
                msg.client_id = self.client_id();
                msg.subscription = Some(channel);
                self.send_or_queue(msg);
            }
            Err(e) => warn!(error = %e, "failed to build subscribe message"),
        }
    }
}
