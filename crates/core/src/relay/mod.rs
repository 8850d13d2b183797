//! Command relay between control clients and device agents.
//!
//! Every client message names one action from a closed set. Lifecycle
//! actions go to the provisioner and registry; device actions are forwarded
//! to the session's agent over a pooled or ephemeral connection and the
//! agent's reply is returned under the client's request id.

pub mod dialer;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use droidplane_protocol::{Action, AgentReply, ClientMessage, DeviceAction, RelayReply, ReplyStatus, parse_package_list};
use droidplane_runtime::pool::OwnerId;
use droidplane_runtime::{AgentConnection, ConnectionPool, Deadline};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::manifest::ResourceId;
use crate::provision::{CreateSessionRequest, ProvisionedSession, Provisioner, ScaledSession};
use crate::session::{SessionRegistry, validate_session_id};

pub use dialer::{AgentDialer, WebSocketDialer, host_port};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Arguments consumed by the relay and never forwarded to the agent.
const PERSIST_ARG: &str = "persist";
const TIMEOUT_ARG: &str = "timeoutMs";

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
	pub request_timeout: Duration,
	/// Upper bound for a per-request `timeoutMs` override.
	pub max_request_timeout: Duration,
}

impl Default for RelayConfig {
	fn default() -> Self {
		Self {
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			max_request_timeout: DEFAULT_MAX_REQUEST_TIMEOUT,
		}
	}
}

/// One connected control client.
///
/// Owns the pooled connections it created and cancels its in-flight
/// dispatches when closed.
#[derive(Debug, Clone)]
pub struct RelayClient {
	id: OwnerId,
	cancel: CancellationToken,
}

impl RelayClient {
	pub fn id(&self) -> OwnerId {
		self.id
	}

	pub fn is_closed(&self) -> bool {
		self.cancel.is_cancelled()
	}
}

/// Device-action arguments split into what the relay consumes and what it forwards.
#[derive(Debug)]
struct DispatchArgs {
	forward: Value,
	persist: bool,
	timeout: Duration,
}

impl DispatchArgs {
	fn parse(args: Option<Value>, config: &RelayConfig) -> Result<Self> {
		let mut args = match args {
			None | Some(Value::Null) => Map::new(),
			Some(Value::Object(map)) => map,
			Some(other) => return Err(Error::InvalidPayload(format!("args must be an object, got {other}"))),
		};

		let persist = match args.remove(PERSIST_ARG) {
			None | Some(Value::Null) => false,
			Some(Value::Bool(flag)) => flag,
			Some(other) => return Err(Error::InvalidPayload(format!("{PERSIST_ARG} must be a boolean, got {other}"))),
		};
		let timeout = match args.remove(TIMEOUT_ARG) {
			None | Some(Value::Null) => config.request_timeout,
			Some(value) => match value.as_u64().filter(|ms| *ms > 0) {
				Some(ms) => Duration::from_millis(ms).min(config.max_request_timeout),
				None => return Err(Error::InvalidPayload(format!("{TIMEOUT_ARG} must be a positive integer, got {value}"))),
			},
		};

		Ok(Self {
			forward: Value::Object(args),
			persist,
			timeout,
		})
	}
}

pub struct CommandRelay {
	provisioner: Arc<Provisioner>,
	registry: Arc<SessionRegistry>,
	dialer: Arc<dyn AgentDialer>,
	pool: ConnectionPool,
	config: RelayConfig,
	next_client: AtomicU64,
}

impl CommandRelay {
	pub fn new(provisioner: Arc<Provisioner>, registry: Arc<SessionRegistry>, dialer: Arc<dyn AgentDialer>, config: RelayConfig) -> Self {
		Self {
			provisioner,
			registry,
			dialer,
			pool: ConnectionPool::new(),
			config,
			next_client: AtomicU64::new(1),
		}
	}

	pub fn registry(&self) -> &Arc<SessionRegistry> {
		&self.registry
	}

	pub fn provisioner(&self) -> &Arc<Provisioner> {
		&self.provisioner
	}

	pub fn pool(&self) -> &ConnectionPool {
		&self.pool
	}

	pub fn config(&self) -> &RelayConfig {
		&self.config
	}

	pub fn open_client(&self) -> RelayClient {
		let client = RelayClient {
			id: self.next_client.fetch_add(1, Ordering::Relaxed),
			cancel: CancellationToken::new(),
		};
		debug!(target = "droidplane.relay", client = client.id, "client connected");
		client
	}

	/// Cancels the client's in-flight dispatches and closes the pooled
	/// connections only it was using.
	pub async fn close_client(&self, client: &RelayClient) {
		client.cancel.cancel();
		let closed = self.pool.release_owner(client.id).await;
		debug!(target = "droidplane.relay", client = client.id, closed, "client disconnected");
	}

	/// Closes every pooled agent connection.
	pub async fn shutdown(&self) {
		self.pool.close_all().await;
	}

	/// Handles one raw text frame from `client`.
	pub async fn handle_text(&self, client: &RelayClient, text: &str) -> RelayReply {
		let value: Value = match serde_json::from_str(text) {
			Ok(value) => value,
			Err(err) => return invalid_payload(new_request_id(), "", format!("message is not valid JSON: {err}")),
		};
		let request_id = value.get("requestId").and_then(Value::as_str).map(str::to_string).unwrap_or_else(new_request_id);
		let action = value.get("action").and_then(Value::as_str).unwrap_or_default().to_string();

		match serde_json::from_value::<ClientMessage>(value) {
			Ok(mut message) => {
				message.request_id = Some(request_id);
				self.handle(Some(client), message).await
			}
			Err(err) => invalid_payload(request_id, action, err.to_string()),
		}
	}

	/// Handles one decoded message. `client` is `None` for single-shot calls.
	pub async fn handle(&self, client: Option<&RelayClient>, message: ClientMessage) -> RelayReply {
		let ClientMessage {
			action: action_name,
			session_id,
			args,
			request_id,
		} = message;
		let request_id = request_id.filter(|id| !id.is_empty()).unwrap_or_else(new_request_id);

		let action = match Action::from_str(&action_name) {
			Ok(action) => action,
			Err(_) => {
				let err = Error::UnknownAction(action_name.clone());
				return RelayReply::failure(request_id, action_name, err.code(), err.to_string()).with_session(session_id);
			}
		};

		let outcome = match action {
			Action::CreateSession => self.relay_create(&request_id, session_id.clone(), args).await,
			Action::DeleteSession => self.relay_delete(&request_id, session_id.as_deref()).await,
			Action::Device(device) => match session_id.as_deref().filter(|id| !id.is_empty()) {
				None => Err(Error::MissingSession(action_name.clone())),
				Some(session) => self
					.dispatch_device(client, session, device, args)
					.await
					.map(|reply| RelayReply::from_agent(request_id.clone(), action_name.clone(), reply).with_session(session_id.clone())),
			},
		};

		outcome.unwrap_or_else(|err| {
			debug!(target = "droidplane.relay", %request_id, action = %action_name, code = %err.code(), error = %err, "request failed");
			let mut reply = RelayReply::failure(request_id, action_name, err.code(), err.to_string()).with_session(session_id);
			if let Some(details) = err.details() {
				reply = reply.with_data(details);
			}
			reply
		})
	}

	async fn relay_create(&self, request_id: &str, session_id: Option<String>, args: Option<Value>) -> Result<RelayReply> {
		let mut request = CreateSessionRequest::from_args(args)?;
		if session_id.is_some() {
			request.session_id = session_id;
		}
		let session = self.create_session(&request).await?;
		let data = json!({
			"sessionId": session.session_id,
			"workloadName": session.workload_name,
			"namespace": session.namespace,
			"profile": session.profile,
			"applied": session.applied,
		});
		Ok(RelayReply::new(request_id, Action::CreateSession.as_str(), ReplyStatus::Created)
			.with_session(Some(session.session_id))
			.with_data(data))
	}

	async fn relay_delete(&self, request_id: &str, session_id: Option<&str>) -> Result<RelayReply> {
		let session_id = session_id.filter(|id| !id.is_empty()).ok_or_else(|| Error::MissingSession(Action::DeleteSession.as_str().into()))?;
		let deleted = self.delete_session(session_id).await?;
		Ok(RelayReply::new(request_id, Action::DeleteSession.as_str(), ReplyStatus::Deleted)
			.with_session(Some(session_id.to_string()))
			.with_data(json!({ "deleted": deleted })))
	}

	pub async fn create_session(&self, request: &CreateSessionRequest) -> Result<ProvisionedSession> {
		let session = self.provisioner.create(request).await?;
		self.registry.invalidate_address(&session.session_id);
		Ok(session)
	}

	pub async fn delete_session(&self, session_id: &str) -> Result<Vec<ResourceId>> {
		validate_session_id(session_id)?;
		self.pool.invalidate(session_id).await;
		self.registry.delete(session_id).await
	}

	/// Changes the replica count of a session's workload. Scaling to zero
	/// also drops pooled agent connections.
	pub async fn scale_session(&self, session_id: &str, replicas: u32) -> Result<ScaledSession> {
		let scaled = self.provisioner.scale(session_id, replicas).await?;
		self.registry.invalidate_address(session_id);
		if replicas == 0 {
			self.pool.invalidate(session_id).await;
		}
		Ok(scaled)
	}

	/// Forwards a device action to the session's agent.
	///
	/// With `persist: true` and a client, the connection is pooled and owned
	/// by that client; otherwise it is opened for this request only.
	pub async fn dispatch_device(&self, client: Option<&RelayClient>, session_id: &str, action: DeviceAction, args: Option<Value>) -> Result<AgentReply> {
		validate_session_id(session_id)?;
		let DispatchArgs { forward, persist, timeout } = DispatchArgs::parse(args, &self.config)?;
		let cancel = client.map_or_else(CancellationToken::new, |client| client.cancel.child_token());
		let deadline = Deadline::with_cancel(timeout, cancel);

		match client.filter(|_| persist) {
			Some(client) => {
				let connection = self.cancellable(&deadline, self.pool.get_or_connect(session_id, client.id, || self.connect(session_id))).await?;
				let result = connection.request(action.as_str(), forward, &deadline).await;
				if let Err(err) = &result {
					if err.is_connection_fatal() {
						warn!(target = "droidplane.relay", %session_id, error = %err, "pooled agent connection failed");
						self.pool.evict(session_id, &connection).await;
						self.registry.invalidate_address(session_id);
					}
				}
				result.map(|reply| structured_reply(action, reply)).map_err(|err| Error::from_agent(session_id, err))
			}
			None => {
				let connection = EphemeralConnection(self.cancellable(&deadline, self.connect(session_id)).await?);
				let result = connection.0.request(action.as_str(), forward, &deadline).await;
				connection.0.close().await;
				if matches!(&result, Err(err) if err.is_connection_fatal()) {
					self.registry.invalidate_address(session_id);
				}
				result.map(|reply| structured_reply(action, reply)).map_err(|err| Error::from_agent(session_id, err))
			}
		}
	}

	async fn cancellable<T>(&self, deadline: &Deadline, work: impl Future<Output = Result<T>>) -> Result<T> {
		tokio::select! {
			biased;
			_ = deadline.cancel.cancelled() => Err(Error::Cancelled),
			result = work => result,
		}
	}

	/// Dials the session's agent. A cached address that refuses the
	/// connection is invalidated and resolved again, once.
	async fn connect(&self, session_id: &str) -> Result<Arc<AgentConnection>> {
		let resolved = self.registry.resolve_address(session_id).await?;
		match self.dialer.dial(&resolved.address).await {
			Ok(connection) => Ok(connection),
			Err(err) if resolved.cached => {
				warn!(target = "droidplane.relay", %session_id, address = %resolved.address, error = %err, "cached agent address failed, resolving again");
				self.registry.invalidate_address(session_id);
				let fresh = self.registry.resolve_address(session_id).await?;
				self.dialer.dial(&fresh.address).await.map_err(|err| Error::from_agent(session_id, err))
			}
			Err(err) => {
				self.registry.invalidate_address(session_id);
				Err(Error::from_agent(session_id, err))
			}
		}
	}
}

/// Single-use agent connection, closed even when the dispatch is dropped mid-flight.
struct EphemeralConnection(Arc<AgentConnection>);

impl Drop for EphemeralConnection {
	fn drop(&mut self) {
		if self.0.is_closed() {
			return;
		}
		self.0.stop();
		if let Ok(handle) = tokio::runtime::Handle::try_current() {
			let connection = Arc::clone(&self.0);
			handle.spawn(async move { connection.close().await });
		}
		debug!(target = "droidplane.relay", endpoint = %self.0.endpoint(), "abandoned ephemeral agent connection closed");
	}
}

/// Replaces raw `pm list packages` text with parsed entries.
fn structured_reply(action: DeviceAction, mut reply: AgentReply) -> AgentReply {
	if action != DeviceAction::ListInstalledApps {
		return reply;
	}
	let raw = match &reply.data {
		Some(Value::String(raw)) => Some(raw.as_str()),
		Some(Value::Object(data)) => data.get("output").and_then(Value::as_str),
		_ => None,
	};
	if let Some(raw) = raw {
		let packages: Vec<_> = parse_package_list(raw).collect();
		reply.data = Some(json!({ "packages": packages }));
	}
	reply
}

/// Request id for messages that arrive without one.
pub fn new_request_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

fn invalid_payload(request_id: String, action: impl Into<String>, message: String) -> RelayReply {
	let err = Error::InvalidPayload(message);
	RelayReply::failure(request_id, action, err.code(), err.to_string())
}
