//! Device agent plumbing: transport, request correlation, and pooling.
//!
//! An [`AgentConnection`] wraps one message channel to the device agent of a
//! single session. Requests are matched to replies by a per-connection wire
//! id, so any number of requests may be in flight at once. The
//! [`ConnectionPool`] keeps at most one long-lived connection per session.

pub mod connection;
pub mod error;
pub mod fake_transport;
pub mod pool;
pub mod transport;

pub use connection::{AgentConnection, Deadline};
pub use error::{Error, Result};
pub use pool::ConnectionPool;
pub use transport::{ConnectOptions, Transport, TransportParts, TransportReceiver, WebSocketTransport};
