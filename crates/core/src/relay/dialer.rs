//! Opening agent connections for a resolved pod address.

use std::sync::Arc;

use async_trait::async_trait;
use droidplane_runtime::{AgentConnection, ConnectOptions, WebSocketTransport};

#[async_trait]
pub trait AgentDialer: Send + Sync {
	/// Connects to the agent listening on `address` (an IP, no port).
	async fn dial(&self, address: &str) -> droidplane_runtime::Result<Arc<AgentConnection>>;
}

/// Dials `ws://<address>:<port><path>`.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
	port: u16,
	path: String,
	options: ConnectOptions,
}

impl WebSocketDialer {
	pub fn new(port: u16, path: impl Into<String>, options: ConnectOptions) -> Self {
		let path = path.into();
		let path = if path.starts_with('/') { path } else { format!("/{path}") };
		Self { port, path, options }
	}

	pub fn url(&self, address: &str) -> String {
		format!("ws://{}{}", host_port(address, self.port), self.path)
	}
}

/// `address:port`, bracketing IPv6 literals.
pub fn host_port(address: &str, port: u16) -> String {
	if address.contains(':') && !address.starts_with('[') {
		format!("[{address}]:{port}")
	} else {
		format!("{address}:{port}")
	}
}

#[async_trait]
impl AgentDialer for WebSocketDialer {
	async fn dial(&self, address: &str) -> droidplane_runtime::Result<Arc<AgentConnection>> {
		let url = self.url(address);
		let (transport, message_rx) = WebSocketTransport::connect(&url, &self.options).await?;
		Ok(AgentConnection::spawn(url, transport.into_transport_parts(message_rx)))
	}
}
