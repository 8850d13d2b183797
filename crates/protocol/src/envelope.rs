//! Relay message envelopes.
//!
//! ```text
//! Client -> Relay: { action, sessionId?, args?, requestId? }
//! Relay -> Client: { requestId, action, sessionId?, status, data?, error?, code? }
//! Relay -> Agent:  { action, args, requestId }
//! Agent -> Relay:  { requestId, action?, status, data?, error? }
//! ```
//!
//! `action` in [`ClientMessage`] is kept as a plain string so that an
//! unrecognized action is reported as `UNKNOWN_ACTION` rather than as a
//! malformed payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ErrorCode;

/// Control message sent by a relay client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
	pub action: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub args: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
}

/// Status of a relay or agent reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
	Ok,
	Error,
	Created,
	Deleted,
}

/// Reply sent by the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayReply {
	pub request_id: String,
	pub action: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	pub status: ReplyStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	/// Present only on errors raised by the relay itself.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub code: Option<ErrorCode>,
}

impl RelayReply {
	pub fn new(request_id: impl Into<String>, action: impl Into<String>, status: ReplyStatus) -> Self {
		Self {
			request_id: request_id.into(),
			action: action.into(),
			session_id: None,
			status,
			data: None,
			error: None,
			code: None,
		}
	}

	pub fn failure(request_id: impl Into<String>, action: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
		Self {
			error: Some(message.into()),
			code: Some(code),
			..Self::new(request_id, action, ReplyStatus::Error)
		}
	}

	/// Relays an agent reply under the client's request id.
	pub fn from_agent(request_id: impl Into<String>, action: impl Into<String>, reply: AgentReply) -> Self {
		Self {
			data: reply.data,
			error: reply.error,
			..Self::new(request_id, action, reply.status)
		}
	}

	pub fn with_session(mut self, session_id: Option<String>) -> Self {
		self.session_id = session_id;
		self
	}

	pub fn with_data(mut self, data: Value) -> Self {
		self.data = Some(data);
		self
	}

	pub fn is_error(&self) -> bool {
		self.status == ReplyStatus::Error
	}
}

/// Request forwarded to a device agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
	pub action: String,
	pub args: Value,
	pub request_id: String,
}

/// Reply produced by a device agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReply {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub request_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub action: Option<String>,
	pub status: ReplyStatus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub data: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl AgentReply {
	pub fn ok(request_id: impl Into<String>, data: Value) -> Self {
		Self {
			request_id: Some(request_id.into()),
			action: None,
			status: ReplyStatus::Ok,
			data: Some(data),
			error: None,
		}
	}

	pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			request_id: Some(request_id.into()),
			action: None,
			status: ReplyStatus::Error,
			data: None,
			error: Some(message.into()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn client_message_accepts_minimal_form() {
		let msg: ClientMessage = serde_json::from_value(json!({"action": "screenshot", "sessionId": "s1"})).unwrap();
		assert_eq!(msg.action, "screenshot");
		assert_eq!(msg.session_id.as_deref(), Some("s1"));
		assert!(msg.args.is_none());
		assert!(msg.request_id.is_none());
	}

	#[test]
	fn client_message_requires_action() {
		assert!(serde_json::from_value::<ClientMessage>(json!({"sessionId": "s1"})).is_err());
	}

	#[test]
	fn relay_failure_carries_code() {
		let reply = RelayReply::failure("r1", "tap", ErrorCode::AgentTimeout, "agent did not reply within 15000ms");
		let value = serde_json::to_value(&reply).unwrap();
		assert_eq!(
			value,
			json!({
				"requestId": "r1",
				"action": "tap",
				"status": "error",
				"error": "agent did not reply within 15000ms",
				"code": "AGENT_TIMEOUT"
			})
		);
	}

	#[test]
	fn agent_reply_is_relayed_under_client_id() {
		let agent: AgentReply = serde_json::from_value(json!({"requestId": "w-7", "action": "tap", "status": "ok", "data": "tapped"})).unwrap();
		let reply = RelayReply::from_agent("client-1", "tap", agent).with_session(Some("s1".into()));
		assert_eq!(reply.request_id, "client-1");
		assert_eq!(reply.status, ReplyStatus::Ok);
		assert_eq!(reply.data, Some(json!("tapped")));
		assert_eq!(reply.session_id.as_deref(), Some("s1"));
	}
}
