//! # eventlink - Streaming subscriptions and bulk result binding
//!
//! eventlink keeps a long-polling Bayeux session open against a Salesforce
//! streaming endpoint and fans the events of each subscribed channel out to
//! registered services. Every channel carries a replay cursor, so a restarted
//! session resumes after the last processed event instead of losing or
//! replaying it.
//!
//! It also binds bulk query results (CSV text with a heading row) to typed
//! records.
//!
//! ## Core Concepts
//!
//! - **Listener**: One streaming session plus the services attached to it
//! - **StreamingConnector**: Bayeux handshake, connect loop and subscriptions
//! - **ReplayFrom**: Per-channel cursor (`-1` new events only, `-2` all retained, `n` after `n`)
//! - **EventDispatcher**: Worker that invokes services in registration order
//! - **decoder**: CSV text to `Vec<T>` through serde or a runtime `Shape`
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use eventlink::{HandlerResult, Listener, ListenerConfig, StreamEvent};
//!
//! let listener = Listener::from_config(ListenerConfig::new(-1, false))?;
//! listener.attach(
//!     "/topic/AccountUpdates",
//!     Arc::new(|event: &StreamEvent| -> HandlerResult {
//!         println!("{:?} {:?}", event.replay_id, event.payload);
//!         Ok(())
//!     }),
//! )?;
//! listener.start("user@example.com", "password+token")?;
//!
//! #[derive(serde::Deserialize)]
//! struct Account { #[serde(rename = "Id")] id: String, #[serde(rename = "Name")] name: String }
//! let accounts: Vec<Account> = eventlink::decoder::decode(&bulk_csv)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Session plumbing
pub mod auth;
pub mod bayeux;
pub mod config;
pub mod connector;
pub mod error;

// Consumers
pub mod dispatcher;
pub mod listener;
pub mod registry;

// Bulk results
pub mod decoder;

// Re-export primary types at crate root for convenience
pub use auth::{Credential, CredentialProvider, LoginClient, SoapLogin};
pub use bayeux::{Advice, HttpTransport, Message, MetaChannel, Reconnect, StreamEvent, Transport};
pub use config::{ConnectorConfig, DispatcherConfig, ListenerConfig};
pub use connector::{
    ConnectorState, EventConsumer, LoggingObserver, MetaObserver, StreamingConnector, SubscriptionHandle,
};
pub use decoder::{decode, decode_shaped, decode_with, records, DecodeOptions, DecodedRecord, Field, FieldType, Shape};
pub use dispatcher::{dispatch, DispatchStats, EventDispatcher, EventSink};
pub use error::{
    AuthError, ConfigError, ConnectorError, DecodeError, DispatchError, ListenerError, ListenerResult, TransportError,
};
pub use listener::Listener;
pub use registry::{
    ChannelSubscription, EventHandler, HandlerResult, RegisteredService, ReplayFrom, ServiceId, SubscriptionRegistry,
};
