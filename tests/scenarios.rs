//! End-to-end fixture scenarios against the public `SessionEngine` API.
//!
//! Each test scripts a `MockTransport` with the exact reply bodies the
//! scenario calls for and asserts on state transitions and wire traffic,
//! not on internal engine structure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bayeux_client::message::{Advice, ReconnectAdvice, META_CONNECT, META_HANDSHAKE, META_SUBSCRIBE};
use bayeux_client::transport::mock::MockTransport;
use bayeux_client::{Message, SessionConfig, SessionEngine, StateTag};

fn reply(channel: &str, successful: bool) -> Message {
    let mut m = Message::new::<()>("ignored", channel, None).unwrap();
    m.successful = Some(successful);
    m
}

fn engine_with_mock() -> (SessionEngine, Arc<MockTransport>) {
    let engine = SessionEngine::new(SessionConfig::new("https://example.test/bayeux"));
    let transport = Arc::new(MockTransport::new("long-polling"));
    engine.register_transport(transport.clone());
    (engine, transport)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_lifecycle() {
    let (engine, transport) = engine_with_mock();

    let mut handshake_reply = reply("/meta/handshake", true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    handshake_reply.advice = Some(Advice {
        reconnect: Some(ReconnectAdvice::Retry),
        interval: Some(0),
        timeout: Some(30_000),
        max_interval: None,
    });
    transport.push_reply(vec![handshake_reply]);
    transport.push_reply(vec![reply(META_CONNECT, true)]);
    transport.push_reply(vec![reply("/meta/disconnect", true)]);

    assert_eq!(engine.tag(), StateTag::Disconnected);
    engine.handshake(None, None).unwrap();
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Connected]));
    assert_eq!(engine.client_id().as_deref(), Some("c1"));

    engine.disconnect(None);
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Disconnected]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_requested_rehandshake() {
    let (engine, transport) = engine_with_mock();

    let mut handshake_reply = reply("/meta/handshake", true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    handshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![handshake_reply]);

    let mut failed_connect = reply(META_CONNECT, false);
    failed_connect.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Handshake), ..Advice::default() });
    transport.push_reply(vec![failed_connect]);

    let mut rehandshake_reply = reply("/meta/handshake", true);
    rehandshake_reply.client_id = Some("c2".into());
    rehandshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    rehandshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![rehandshake_reply]);
    transport.push_reply(vec![reply(META_CONNECT, true)]);

    engine.handshake(None, None).unwrap();
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Rehandshaking]));
    // A server-requested rehandshake after a failed connect carries no
    // prior backoff to build on, so it starts the rehandshake clock at
    // zero rather than the first linear-backoff increment.
    assert_eq!(engine.backoff(), Some(Duration::ZERO));
    assert!(engine.wait_for(Duration::from_secs(2), &[StateTag::Connected]));
    assert_eq!(engine.client_id().as_deref(), Some("c2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negotiation_failure_terminates_with_synthesized_error() {
    let (engine, transport) = engine_with_mock();

    let mut handshake_reply = reply("/meta/handshake", true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["websocket".into()]);
    transport.push_reply(vec![handshake_reply]);

    let observed = Arc::new(Mutex::new(None));
    let captured = observed.clone();
    engine.add_listener(
        "/meta/handshake",
        Box::new(move |m: &Message| {
            *captured.lock().unwrap() = m.error.clone();
        }),
    );

    engine.handshake(None, None).unwrap();
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Disconnected]));
    assert_eq!(
        observed.lock().unwrap().as_deref(),
        Some("405:c[long-polling],s[websocket]:no transport")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribe_dedup_sends_one_wire_message_and_fans_out_to_both_callbacks() {
    let (engine, transport) = engine_with_mock();

    let mut handshake_reply = reply("/meta/handshake", true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    handshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![handshake_reply]);
    transport.push_reply(vec![reply(META_CONNECT, true)]);

    engine.handshake(None, None).unwrap();
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Connected]));

    let hits = Arc::new(AtomicUsize::new(0));
    let h1 = hits.clone();
    let h2 = hits.clone();
    engine.start_batch();
    engine.subscribe("/foo", Box::new(move |_| { h1.fetch_add(1, Ordering::SeqCst); })).unwrap();
    engine.subscribe("/foo", Box::new(move |_| { h2.fetch_add(1, Ordering::SeqCst); })).unwrap();
    engine.end_batch().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sent = transport.drain_sent();
    let subscribe_count = sent.iter().filter(|m| m.channel == META_SUBSCRIBE && m.subscription.as_deref() == Some("/foo")).count();
    assert_eq!(subscribe_count, 1, "two subscribes to the same channel must emit exactly one wire message");

    let push = reply("/foo", true);
    transport.deliver(vec![push]);

    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_race_rejects_late_connect_success() {
    let (engine, transport) = engine_with_mock();

    let mut handshake_reply = reply("/meta/handshake", true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    handshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![handshake_reply]);

    engine.handshake(None, None).unwrap();
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Connecting]));

    engine.disconnect(None);
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Disconnecting]));

    // A connect reply that arrives late, after disconnect() already moved
    // the session to DISCONNECTING, must not pull it back out.
    let mut late = reply(META_CONNECT, true);
    late.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.deliver(vec![late]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_ne!(engine.tag(), StateTag::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconnected_retries_escalate_to_rehandshake_once_past_max_interval() {
    let mut config = SessionConfig::new("https://example.test/bayeux");
    config.backoff_increment = Duration::from_millis(5);
    config.max_backoff = Duration::from_millis(1000);
    let engine = SessionEngine::new(config);
    let transport = Arc::new(MockTransport::new("long-polling"));
    engine.register_transport(transport.clone());

    let mut handshake_reply = reply(META_HANDSHAKE, true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    handshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![handshake_reply]);

    // advice.timeout + advice.interval + advice.maxInterval == 1ms, so even
    // the very first failed connect's 5ms backoff already blows past the
    // threshold: escalation is deterministic after exactly one failure,
    // with no dependence on real-time scheduling jitter.
    let mut failed_connect = reply(META_CONNECT, false);
    failed_connect.advice = Some(Advice {
        reconnect: Some(ReconnectAdvice::Retry),
        timeout: Some(0),
        interval: Some(0),
        max_interval: Some(1),
    });
    transport.push_reply(vec![failed_connect]);

    let mut rehandshake_reply = reply(META_HANDSHAKE, true);
    rehandshake_reply.client_id = Some("c2".into());
    rehandshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    rehandshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![rehandshake_reply]);
    transport.push_reply(vec![reply(META_CONNECT, true)]);

    engine.handshake(None, None).unwrap();
    // Unconnected is a fleeting transient here (the threshold is blown on
    // the very first failure), so asserting directly on Connected via c2
    // is the reliable signal that escalation happened rather than an
    // ordinary connect retry.
    assert!(
        engine.wait_for(Duration::from_secs(2), &[StateTag::Connected]),
        "repeated connect failures past maxInterval must escalate to a rehandshake and reconnect"
    );
    assert_eq!(engine.client_id().as_deref(), Some("c2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_call_synthesizes_timeout_failure_when_no_reply_arrives() {
    let (engine, transport) = engine_with_mock();

    let mut handshake_reply = reply(META_HANDSHAKE, true);
    handshake_reply.client_id = Some("c1".into());
    handshake_reply.supported_connection_types = Some(vec!["long-polling".into()]);
    handshake_reply.advice = Some(Advice { reconnect: Some(ReconnectAdvice::Retry), ..Advice::default() });
    transport.push_reply(vec![handshake_reply]);
    transport.push_reply(vec![reply(META_CONNECT, true)]);

    engine.handshake(None, None).unwrap();
    assert!(engine.wait_for(Duration::from_secs(1), &[StateTag::Connected]));

    let outcome = Arc::new(Mutex::new(None));
    let captured = outcome.clone();
    engine
        .remote_call(
            "echo",
            &(),
            Duration::from_millis(20),
            Box::new(move |reply: Message| {
                *captured.lock().unwrap() = Some((reply.successful, reply.error));
            }),
        )
        .unwrap();

    // No scripted reply is ever delivered for this call; only the timeout
    // can resolve it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = outcome.lock().unwrap().clone();
    assert_eq!(seen, Some((Some(false), Some("406::timeout".to_string()))));
}
