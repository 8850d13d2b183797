use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("agent at {url} is unreachable: {message}")]
	Unreachable { url: String, message: String },
	#[error("handshake with {url} did not complete within {}ms", after.as_millis())]
	HandshakeTimeout { url: String, after: Duration },
	#[error("agent did not reply to {request_id} within {}ms", after.as_millis())]
	Timeout { request_id: String, after: Duration },
	#[error("request {0} was cancelled")]
	Cancelled(String),
	#[error("agent connection closed")]
	ChannelClosed,
	#[error("agent transport failed: {0}")]
	Transport(String),
	#[error("agent message serialization failed: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl Error {
	/// True when the connection that produced this error cannot be reused.
	pub fn is_connection_fatal(&self) -> bool {
		matches!(self, Error::ChannelClosed | Error::Transport(_))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
