//! Client-side Bayeux protocol engine.
//!
//! Drives the handshake/connect/disconnect lifecycle against a pluggable
//! [`transport::Transport`], applies server reconnect advice, and routes
//! inbound messages to channel subscribers. See [`session::SessionEngine`]
//! for the entry point.

pub mod callback;
pub mod channel;
pub mod error;
pub mod message;
pub mod queue;
pub mod reconnect;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod transport;

pub use channel::{Listener, SubscriptionId};
pub use error::{BayeuxError, Result};
pub use message::{Advice, Message, ReconnectAdvice};
pub use reconnect::ReconnectConfig;
pub use scheduler::Scheduler;
pub use session::{SessionConfig, SessionEngine};
pub use state::StateTag;
pub use transport::{DynFuture, Transport, TransportListener, TransportRegistry};
