//! Async Rust client for the xAPI websocket trading protocol.
//!
//! The crate is organized by protocol concern:
//! - `client`: endpoint selection and session construction.
//! - `session`: the session handle for correlated commands and streaming
//!   subscriptions.
//! - `subscription`: channel keys, listeners, and subscription state.
//! - `proto`: wire frames and the push-channel vocabulary.
//! - `config` / `error`: timing configuration and the error taxonomy.
//!
//! Every outbound frame of a session passes through one rate-limited queue,
//! replies are matched to calls by `customTag`, and a keepalive ping is sent
//! on a fixed period for as long as the session lives.

/// Client entry point.
pub mod client;
/// Endpoints, session modes, and timing configuration.
pub mod config;
/// Error type shared by all operations.
pub mod error;
/// Wire frame types and push channels.
pub mod proto;
/// Session handle and lifecycle events.
pub mod session;
/// Streaming channel keys, listeners, and subscription state.
pub mod subscription;

mod correlator;
mod demux;
mod governor;
mod keepalive;
mod transport;

pub use client::XapiClient;
pub use config::{AccountType, SessionConfig, SessionDefaults, SessionMode};
pub use error::XapiError;
pub use proto::{Reply, StreamChannel};
pub use session::{Session, SessionEvent, StreamSessionId};
pub use subscription::{ChannelKey, Listener, ListenerId, StreamEvent, SubscriptionState};
pub use transport::ConnectionState;
