//! Bayeux long-polling wire layer.
//!
//! Message model, meta channels and the transport seam used by the connector.
//! Nothing here holds session state.

/// Message model and constructors.
pub mod message;
/// HTTP transport.
pub mod transport;

pub use message::{Advice, Message, MetaChannel, Reconnect, StreamEvent};
pub use transport::{HttpTransport, Transport};
