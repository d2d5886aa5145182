//! RPC to agents over the agent message bus.
//!
//! - [`envelope`]: the JSON wire format shared with the transport service
//! - [`transport`]: outbound delivery ([`HttpTransport`] in production)
//! - [`messenger`]: sessions, at-most-one in-flight action per host,
//!   timeouts and cancellation

pub mod envelope;
pub mod messenger;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use envelope::{Body, Envelope, MessageType, Subprocess, PLUGIN};
pub use messenger::{AgentMessenger, SessionEvent};
pub use transport::{HttpTransport, Transport};
