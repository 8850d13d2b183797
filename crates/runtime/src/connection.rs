//! Request/reply correlation on top of an agent transport.
//!
//! # Message Flow
//!
//! 1. Caller invokes [`AgentConnection::request`] with an action, args, and a [`Deadline`]
//! 2. The connection assigns a fresh wire id and registers a oneshot listener under it
//! 3. `{action, args, requestId}` is sent through the transport
//! 4. The `run` loop receives agent replies and completes the listener whose id matches
//! 5. The caller gets the reply, a timeout, or a cancellation, whichever comes first
//!
//! Replies are matched by id only, never by arrival order. Wire ids are
//! generated here rather than taken from clients, so two callers that picked
//! the same request id can share one connection without cross-delivery.
//!
//! Every exit path of `request` drops a [`PendingGuard`], which removes the
//! listener. A late reply for a request that already timed out finds no
//! listener and is discarded.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use droidplane_protocol::{AgentReply, AgentRequest};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportParts, TransportReceiver};

type PendingMap = Mutex<HashMap<String, oneshot::Sender<Result<AgentReply>>>>;

/// Time budget and cancellation signal for one dispatch.
#[derive(Debug, Clone)]
pub struct Deadline {
	pub timeout: Duration,
	pub cancel: CancellationToken,
}

impl Deadline {
	pub fn new(timeout: Duration) -> Self {
		Self {
			timeout,
			cancel: CancellationToken::new(),
		}
	}

	pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
		Self { timeout, cancel }
	}
}

/// Removes a pending listener when dropped.
struct PendingGuard<'a> {
	pending: &'a PendingMap,
	id: String,
}

impl<'a> PendingGuard<'a> {
	fn register(pending: &'a PendingMap, id: String, tx: oneshot::Sender<Result<AgentReply>>) -> Self {
		pending.lock().insert(id.clone(), tx);
		Self { pending, id }
	}
}

impl Drop for PendingGuard<'_> {
	fn drop(&mut self) {
		if self.pending.lock().remove(&self.id).is_some() {
			trace!(target = "droidplane.agent", request_id = %self.id, "pending listener deregistered");
		}
	}
}

/// One correlated channel to a session's device agent.
pub struct AgentConnection {
	endpoint: String,
	next_id: AtomicU64,
	pending: PendingMap,
	sender: AsyncMutex<Box<dyn Transport>>,
	inbound: Mutex<Option<(Box<dyn TransportReceiver>, mpsc::UnboundedReceiver<Value>)>>,
	shutdown: CancellationToken,
}

impl AgentConnection {
	pub fn new(endpoint: impl Into<String>, parts: TransportParts) -> Self {
		Self {
			endpoint: endpoint.into(),
			next_id: AtomicU64::new(1),
			pending: Mutex::new(HashMap::new()),
			sender: AsyncMutex::new(parts.sender),
			inbound: Mutex::new(Some((parts.receiver, parts.message_rx))),
			shutdown: CancellationToken::new(),
		}
	}

	/// Creates the connection and spawns its message loop.
	pub fn spawn(endpoint: impl Into<String>, parts: TransportParts) -> Arc<Self> {
		let connection = Arc::new(Self::new(endpoint, parts));
		let _task: JoinHandle<()> = tokio::spawn({
			let connection = Arc::clone(&connection);
			async move { connection.run().await }
		});
		connection
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}

	/// Sends one request and waits for its correlated reply.
	pub async fn request(&self, action: &str, args: Value, deadline: &Deadline) -> Result<AgentReply> {
		if self.is_closed() {
			return Err(Error::ChannelClosed);
		}

		let wire_id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
		let (tx, rx) = oneshot::channel();
		let _guard = PendingGuard::register(&self.pending, wire_id.clone(), tx);

		let exchange = async {
			let message = serde_json::to_value(AgentRequest {
				action: action.to_string(),
				args,
				request_id: wire_id.clone(),
			})?;
			self.sender.lock().await.send(message).await?;
			trace!(target = "droidplane.agent", endpoint = %self.endpoint, request_id = %wire_id, %action, "request sent");
			rx.await.map_err(|_| Error::ChannelClosed)?
		};

		tokio::select! {
			biased;
			_ = deadline.cancel.cancelled() => Err(Error::Cancelled(wire_id.clone())),
			outcome = tokio::time::timeout(deadline.timeout, exchange) => match outcome {
				Ok(result) => result,
				Err(_) => {
					debug!(target = "droidplane.agent", endpoint = %self.endpoint, request_id = %wire_id, %action, "agent request timed out");
					Err(Error::Timeout {
						request_id: wire_id.clone(),
						after: deadline.timeout,
					})
				}
			},
		}
	}

	/// Runs the inbound loop until the agent goes away or [`close`](Self::close) is called.
	///
	/// Every request still pending when the loop ends fails with
	/// [`Error::ChannelClosed`].
	pub async fn run(&self) {
		let Some((receiver, mut message_rx)) = self.inbound.lock().take() else {
			warn!(target = "droidplane.agent", endpoint = %self.endpoint, "connection loop already started");
			return;
		};

		let endpoint = self.endpoint.clone();
		let receiver_task = tokio::spawn(async move {
			if let Err(err) = receiver.run().await {
				debug!(target = "droidplane.agent", %endpoint, error = %err, "agent transport ended with error");
			}
		});

		loop {
			tokio::select! {
				_ = self.shutdown.cancelled() => break,
				message = message_rx.recv() => match message {
					Some(message) => self.dispatch(message),
					None => break,
				},
			}
		}

		receiver_task.abort();
		self.shutdown.cancel();
		self.fail_pending();
		debug!(target = "droidplane.agent", endpoint = %self.endpoint, "agent connection loop finished");
	}

	fn dispatch(&self, message: Value) {
		let reply: AgentReply = match serde_json::from_value(message) {
			Ok(reply) => reply,
			Err(err) => {
				warn!(target = "droidplane.agent", endpoint = %self.endpoint, error = %err, "ignoring malformed agent reply");
				return;
			}
		};

		let Some(request_id) = reply.request_id.clone() else {
			warn!(target = "droidplane.agent", endpoint = %self.endpoint, "ignoring agent reply without requestId");
			return;
		};

		let listener = self.pending.lock().remove(&request_id);
		match listener {
			Some(tx) => {
				let _ = tx.send(Ok(reply));
			}
			None => debug!(target = "droidplane.agent", endpoint = %self.endpoint, %request_id, "discarding reply with no pending request"),
		}
	}

	fn fail_pending(&self) {
		let drained: Vec<_> = self.pending.lock().drain().collect();
		for (_, tx) in drained {
			let _ = tx.send(Err(Error::ChannelClosed));
		}
	}

	/// Stops the loop and closes the transport.
	pub async fn close(&self) {
		self.shutdown.cancel();
		if let Err(err) = self.sender.lock().await.close().await {
			trace!(target = "droidplane.agent", endpoint = %self.endpoint, error = %err, "transport close failed");
		}
	}

	/// Stops the loop without waiting on the transport. Usable from `Drop`.
	pub fn stop(&self) {
		self.shutdown.cancel();
	}

	pub fn is_closed(&self) -> bool {
		self.shutdown.is_cancelled()
	}

	/// Number of requests awaiting a reply.
	pub fn pending_count(&self) -> usize {
		self.pending.lock().len()
	}
}

impl std::fmt::Debug for AgentConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AgentConnection")
			.field("endpoint", &self.endpoint)
			.field("pending", &self.pending_count())
			.field("closed", &self.is_closed())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fake_transport::FakeTransportBuilder;
	use droidplane_protocol::ReplyStatus;
	use serde_json::json;

	fn deadline(ms: u64) -> Deadline {
		Deadline::new(Duration::from_millis(ms))
	}

	fn request_id(message: &Value) -> String {
		message["requestId"].as_str().expect("request should carry requestId").to_string()
	}

	#[tokio::test]
	async fn reply_completes_matching_request() {
		let (parts, controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);

		let call = tokio::spawn({
			let connection = Arc::clone(&connection);
			async move { connection.request("tap", json!({"x": 100, "y": 200}), &deadline(1000)).await }
		});

		let sent = controller.wait_for_sent(1).await;
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0]["action"], "tap");
		assert_eq!(sent[0]["args"], json!({"x": 100, "y": 200}));

		controller.inject_reply(&request_id(&sent[0]), json!("tapped"));
		let reply = call.await.unwrap().expect("request should succeed");
		assert_eq!(reply.status, ReplyStatus::Ok);
		assert_eq!(reply.data, Some(json!("tapped")));
		assert_eq!(connection.pending_count(), 0);
	}

	#[tokio::test]
	async fn out_of_order_replies_do_not_cross_deliver() {
		let (parts, controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);

		let mut calls = Vec::new();
		for i in 0..3 {
			let connection = Arc::clone(&connection);
			calls.push(tokio::spawn(async move {
				connection.request("getProp", json!({"name": format!("p{i}")}), &deadline(1000)).await
			}));
		}

		let sent = controller.wait_for_sent(3).await;
		assert_eq!(sent.len(), 3);
		for message in sent.iter().rev() {
			let name = message["args"]["name"].as_str().unwrap();
			controller.inject_reply(&request_id(message), json!(format!("value-of-{name}")));
		}

		for (i, call) in calls.into_iter().enumerate() {
			let reply = call.await.unwrap().expect("request should succeed");
			assert_eq!(reply.data, Some(json!(format!("value-of-p{i}"))));
		}
	}

	#[tokio::test]
	async fn timeout_deregisters_listener_and_late_reply_is_dropped() {
		let (parts, controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);

		let err = connection.request("screenshot", json!({}), &deadline(30)).await.expect_err("request should time out");
		assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");
		assert_eq!(connection.pending_count(), 0);

		let sent = controller.take_sent().await;
		controller.inject_reply(&request_id(&sent[0]), json!("late"));
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(connection.pending_count(), 0);
		assert!(!connection.is_closed());
	}

	#[tokio::test]
	async fn cancellation_deregisters_listener() {
		let (parts, _controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);
		let deadline = deadline(5_000);

		let call = tokio::spawn({
			let connection = Arc::clone(&connection);
			let deadline = deadline.clone();
			async move { connection.request("uiDump", json!({}), &deadline).await }
		});
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(connection.pending_count(), 1);

		deadline.cancel.cancel();
		let err = call.await.unwrap().expect_err("request should be cancelled");
		assert!(matches!(err, Error::Cancelled(_)));
		assert_eq!(connection.pending_count(), 0);
	}

	#[tokio::test]
	async fn agent_disconnect_fails_pending_requests() {
		let (parts, mut controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);

		let call = tokio::spawn({
			let connection = Arc::clone(&connection);
			async move { connection.request("reboot", json!({}), &deadline(2_000)).await }
		});
		controller.wait_for_sent(1).await;
		controller.disconnect();

		let err = call.await.unwrap().expect_err("request should fail");
		assert!(matches!(err, Error::ChannelClosed));
		assert!(connection.is_closed());
		assert!(matches!(
			connection.request("tap", json!({}), &deadline(100)).await,
			Err(Error::ChannelClosed)
		));
	}

	#[tokio::test]
	async fn send_failure_is_reported_and_cleaned_up() {
		let (parts, _controller) = FakeTransportBuilder::new().failing_sends().build();
		let connection = AgentConnection::spawn("fake://s1", parts);

		let err = connection.request("tap", json!({}), &deadline(500)).await.expect_err("send should fail");
		assert!(err.is_connection_fatal());
		assert_eq!(connection.pending_count(), 0);
	}

	#[tokio::test]
	async fn stop_ends_the_loop_and_fails_pending() {
		let (parts, _controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);

		let call = tokio::spawn({
			let connection = Arc::clone(&connection);
			async move { connection.request("uiDump", json!({}), &deadline(2_000)).await }
		});
		tokio::time::sleep(Duration::from_millis(20)).await;
		connection.stop();

		let err = call.await.unwrap().expect_err("request should fail");
		assert!(matches!(err, Error::ChannelClosed));
		assert!(connection.is_closed());
		assert_eq!(connection.pending_count(), 0);
	}

	#[tokio::test]
	async fn close_marks_connection_closed() {
		let (parts, controller) = FakeTransportBuilder::new().build();
		let connection = AgentConnection::spawn("fake://s1", parts);
		connection.close().await;
		assert!(connection.is_closed());
		assert!(controller.is_closed().await);
	}
}
