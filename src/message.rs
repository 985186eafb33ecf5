//! Bayeux message envelope.
//!
//! Mirrors the wire shape described in the protocol's `/meta/*` channels:
//! a JSON object carrying an `id`, a `channel`, and a grab-bag of optional
//! fields whose presence depends on which channel is in play. Application
//! payloads are kept as a [`RawValue`] so the engine never pays to parse
//! data it only forwards.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_DISCONNECT: &str = "/meta/disconnect";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_UNSUBSCRIBE: &str = "/meta/unsubscribe";

pub const BAYEUX_VERSION: &str = "1.0";

/// What the server wants the client to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectAdvice {
    Retry,
    Handshake,
    None,
}

/// Server-supplied guidance accompanying a reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Advice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectAdvice>,
    /// Milliseconds the server will hold a `/meta/connect` open for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Milliseconds the client should wait before its next connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Upper bound, in milliseconds, on how long the client may go without
    /// a successful connect before it must re-handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<u64>,
}

/// Diagnostic detail attached to a synthesized transport-failure reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub exception: String,
    pub connection_type: Option<String>,
}

/// The set of top-level field names the engine manages itself; a
/// handshake template may not overwrite any of these.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "channel",
    "supportedConnectionTypes",
    "version",
    "minimumVersion",
];

/// A single Bayeux message, inbound or outbound.
///
/// `id` is always present on requests and echoed back on replies; it is
/// the correlation key used by [`crate::callback::CallbackTable`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub channel: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,

    /// The negotiated transport name, carried on `/meta/connect` requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,

    /// Extra fields merged in from a handshake template. Flattened onto
    /// the wire object rather than nested, so a server sees e.g. an `ext`
    /// auth block as a top-level sibling of `channel`, not wrapped in a
    /// container field the protocol doesn't define.
    #[serde(flatten, default)]
    pub ext: HashMap<String, serde_json::Value>,
}

/// Monotonic generator for client-assigned message ids.
///
/// The spec requires ids be unique per session, not globally; a per-session
/// counter is simpler and cheaper than a UUID and makes wire traces easy to
/// read in tests.
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> String {
        self.0.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

impl Message {
    /// Builds a request message with a serialized payload.
    pub fn new<T: Serialize>(
        id: impl Into<String>,
        channel: impl Into<String>,
        data: Option<&T>,
    ) -> serde_json::Result<Self> {
        let data = match data {
            Some(d) => Some(RawValue::from_string(serde_json::to_string(d)?)?),
            None => None,
        };
        Ok(Self {
            id: id.into(),
            channel: channel.into(),
            client_id: None,
            successful: None,
            data,
            subscription: None,
            connection_type: None,
            advice: None,
            supported_connection_types: None,
            version: None,
            minimum_version: None,
            error: None,
            failure: None,
            ext: HashMap::new(),
        })
    }

    /// Merges `template` onto this message's extension fields, dropping any
    /// key in [`RESERVED_FIELDS`] so a caller-supplied handshake template
    /// can never shadow a field the engine itself manages.
    pub fn merge_template(&mut self, template: HashMap<String, serde_json::Value>) {
        for (key, value) in template {
            if !RESERVED_FIELDS.contains(&key.as_str()) {
                self.ext.insert(key, value);
            }
        }
    }

    /// Deserializes the `data` field, if present.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> serde_json::Result<Option<T>> {
        match &self.data {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }

    /// Builds a reply to this message, preserving its `id`.
    pub fn reply(&self, successful: bool) -> Self {
        Self {
            id: self.id.clone(),
            channel: self.channel.clone(),
            client_id: self.client_id.clone(),
            successful: Some(successful),
            data: None,
            subscription: self.subscription.clone(),
            connection_type: None,
            advice: None,
            supported_connection_types: None,
            version: None,
            minimum_version: None,
            error: None,
            failure: None,
            ext: HashMap::new(),
        }
    }

    /// Synthesizes a failure reply for a message that never made it over
    /// the wire, e.g. because the transport reported an I/O error.
    pub fn synthetic_failure(&self, exception: impl Into<String>, connection_type: Option<String>) -> Self {
        let mut reply = self.reply(false);
        reply.failure = Some(Failure {
            exception: exception.into(),
            connection_type,
        });
        reply
    }

    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }
}
