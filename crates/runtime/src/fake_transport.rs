//! In-memory transport for testing correlation without a live agent.
//!
//! # Example
//!
//! ```ignore
//! let (parts, controller) = FakeTransportBuilder::new().build();
//! let connection = AgentConnection::spawn("fake://s1", parts);
//!
//! let reply = tokio::spawn(async move { connection.request("tap", json!({"x": 1}), &deadline).await });
//! let sent = controller.wait_for_sent(1).await;
//! controller.inject_reply(sent[0]["requestId"].as_str().unwrap(), json!("tapped"));
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use droidplane_protocol::AgentReply;
use serde_json::Value as JsonValue;
use tokio::sync::{Mutex, mpsc};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};

/// Builds a fake agent channel.
pub struct FakeTransportBuilder {
	fail_sends: bool,
}

impl FakeTransportBuilder {
	pub fn new() -> Self {
		Self { fail_sends: false }
	}

	/// Every send fails with a transport error.
	pub fn failing_sends(mut self) -> Self {
		self.fail_sends = true;
		self
	}

	/// Returns the parts for [`crate::AgentConnection::spawn`] and the controller driving them.
	pub fn build(self) -> (TransportParts, FakeTransportController) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		let sent_messages = Arc::new(Mutex::new(Vec::new()));
		let closed = Arc::new(Mutex::new(false));

		let sender = FakeTransportSender {
			sent: Arc::clone(&sent_messages),
			closed: Arc::clone(&closed),
			fail_sends: self.fail_sends,
		};

		let receiver = FakeTransportReceiver { inbound_rx, message_tx };

		let controller = FakeTransportController {
			inbound_tx: Some(inbound_tx),
			sent: sent_messages,
			closed,
		};

		let parts = TransportParts {
			sender: Box::new(sender),
			receiver: Box::new(receiver),
			message_rx,
		};

		(parts, controller)
	}
}

impl Default for FakeTransportBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Controller for injecting agent replies and inspecting sent requests.
pub struct FakeTransportController {
	inbound_tx: Option<mpsc::UnboundedSender<JsonValue>>,
	sent: Arc<Mutex<Vec<JsonValue>>>,
	closed: Arc<Mutex<bool>>,
}

impl FakeTransportController {
	/// Inject a raw JSON message as if the agent had sent it.
	pub fn inject(&self, message: JsonValue) {
		if let Some(tx) = &self.inbound_tx {
			let _ = tx.send(message);
		}
	}

	/// Inject a successful reply for `request_id`.
	pub fn inject_reply(&self, request_id: &str, data: JsonValue) {
		self.inject(serde_json::to_value(AgentReply::ok(request_id, data)).unwrap_or_default());
	}

	/// Inject an error reply for `request_id`.
	pub fn inject_error(&self, request_id: &str, message: &str) {
		self.inject(serde_json::to_value(AgentReply::error(request_id, message)).unwrap_or_default());
	}

	/// Simulate the agent going away.
	pub fn disconnect(&mut self) {
		self.inbound_tx = None;
	}

	/// Drains the requests sent so far.
	pub async fn take_sent(&self) -> Vec<JsonValue> {
		std::mem::take(&mut *self.sent.lock().await)
	}

	/// Waits until at least `count` messages were sent, then takes them.
	pub async fn wait_for_sent(&self, count: usize) -> Vec<JsonValue> {
		for _ in 0..400 {
			{
				let mut sent = self.sent.lock().await;
				if sent.len() >= count {
					return std::mem::take(&mut *sent);
				}
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		self.take_sent().await
	}

	/// Whether the connection closed its sending half.
	pub async fn is_closed(&self) -> bool {
		*self.closed.lock().await
	}
}

struct FakeTransportSender {
	sent: Arc<Mutex<Vec<JsonValue>>>,
	closed: Arc<Mutex<bool>>,
	fail_sends: bool,
}

impl Transport for FakeTransportSender {
	fn send(&mut self, message: JsonValue) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		let sent = Arc::clone(&self.sent);
		let fail = self.fail_sends;
		Box::pin(async move {
			if fail {
				return Err(Error::Transport("fake send failure".into()));
			}
			sent.lock().await.push(message);
			Ok(())
		})
	}

	fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		let closed = Arc::clone(&self.closed);
		Box::pin(async move {
			*closed.lock().await = true;
			Ok(())
		})
	}
}

struct FakeTransportReceiver {
	inbound_rx: mpsc::UnboundedReceiver<JsonValue>,
	message_tx: mpsc::UnboundedSender<JsonValue>,
}

impl TransportReceiver for FakeTransportReceiver {
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			while let Some(message) = self.inbound_rx.recv().await {
				if self.message_tx.send(message).is_err() {
					break;
				}
			}
			Ok(())
		})
	}
}
