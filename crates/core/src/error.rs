use std::path::PathBuf;
use std::time::Duration;

use droidplane_protocol::ErrorCode;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::apply::AppliedResource;
use crate::cluster::ClusterError;
use crate::manifest::ResourceId;
use crate::session::SessionPhase;

/// Partial-success payload of a failed apply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyFailure {
	/// Resources that are live after the failure.
	pub applied: Vec<AppliedResource>,
	pub failed: ResourceId,
	pub cause: String,
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("template for profile '{profile}' not found in {}", dir.display())]
	TemplateNotFound { profile: String, dir: PathBuf },
	#[error("render error: {0}")]
	Render(String),
	#[error("sanitizer rejected the batch: {}", violations.join("; "))]
	SanitizerRejected { violations: Vec<String> },
	#[error("unsupported resource kind: {0}")]
	UnsupportedKind(ResourceId),
	#[error("failed to apply {}: {} ({} resource(s) applied before the failure)", .0.failed, .0.cause, .0.applied.len())]
	ApplyFailed(Box<ApplyFailure>),
	#[error("session '{0}' not found")]
	SessionNotFound(String),
	#[error("session '{session_id}' is not ready (phase {phase})")]
	SessionNotReady { session_id: String, phase: SessionPhase },
	#[error("session '{session_id}' already runs profile '{current}'; delete it before creating it with '{requested}'")]
	SessionConflict { session_id: String, current: String, requested: String },
	#[error("agent for session '{session_id}' is unreachable: {message}")]
	AgentUnreachable { session_id: String, message: String },
	#[error("agent for session '{session_id}' did not reply within {}ms", after.as_millis())]
	AgentTimeout { session_id: String, after: Duration },
	#[error("stream endpoint for session '{session_id}' is unreachable: {message}")]
	StreamUnreachable { session_id: String, message: String },
	#[error("request cancelled")]
	Cancelled,
	#[error("invalid payload: {0}")]
	InvalidPayload(String),
	#[error("unknown action '{0}'")]
	UnknownAction(String),
	#[error("action '{0}' requires a sessionId")]
	MissingSession(String),
	#[error("missing or invalid access key")]
	Unauthorized,
	#[error(transparent)]
	Cluster(#[from] ClusterError),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl Error {
	pub fn code(&self) -> ErrorCode {
		match self {
			Error::Configuration(_) => ErrorCode::ConfigurationError,
			Error::TemplateNotFound { .. } => ErrorCode::TemplateNotFound,
			Error::Render(_) => ErrorCode::RenderError,
			Error::SanitizerRejected { .. } => ErrorCode::SanitizerRejected,
			Error::UnsupportedKind(_) => ErrorCode::UnsupportedKind,
			Error::ApplyFailed(_) => ErrorCode::ApplyFailed,
			Error::SessionNotFound(_) => ErrorCode::SessionNotFound,
			Error::SessionNotReady { .. } => ErrorCode::SessionNotReady,
			Error::SessionConflict { .. } => ErrorCode::SessionConflict,
			Error::AgentUnreachable { .. } => ErrorCode::AgentUnreachable,
			Error::AgentTimeout { .. } => ErrorCode::AgentTimeout,
			Error::StreamUnreachable { .. } => ErrorCode::StreamUnreachable,
			Error::Cancelled => ErrorCode::Cancelled,
			Error::InvalidPayload(_) | Error::Json(_) => ErrorCode::InvalidPayload,
			Error::UnknownAction(_) => ErrorCode::UnknownAction,
			Error::MissingSession(_) => ErrorCode::MissingSession,
			Error::Unauthorized => ErrorCode::Unauthorized,
			Error::Cluster(ClusterError::UnsupportedKind(_)) => ErrorCode::UnsupportedKind,
			Error::Cluster(_) => ErrorCode::ClusterError,
			Error::Io(_) => ErrorCode::InternalError,
		}
	}

	/// Structured payload for callers that need more than the message.
	pub fn details(&self) -> Option<Value> {
		match self {
			Error::SanitizerRejected { violations } => Some(json!({ "violations": violations })),
			Error::UnsupportedKind(id) => serde_json::to_value(id).ok(),
			Error::ApplyFailed(failure) => serde_json::to_value(failure.as_ref()).ok(),
			Error::SessionNotReady { phase, .. } => Some(json!({ "phase": phase })),
			Error::SessionConflict { current, requested, .. } => Some(json!({ "currentProfile": current, "requestedProfile": requested })),
			_ => None,
		}
	}

	/// Maps an agent transport error for `session_id` into the relay taxonomy.
	pub fn from_agent(session_id: &str, err: droidplane_runtime::Error) -> Self {
		use droidplane_runtime::Error as Agent;
		match err {
			Agent::Timeout { after, .. } => Error::AgentTimeout {
				session_id: session_id.to_string(),
				after,
			},
			Agent::Cancelled(_) => Error::Cancelled,
			Agent::Serialization(err) => Error::InvalidPayload(err.to_string()),
			other => Error::AgentUnreachable {
				session_id: session_id.to_string(),
				message: other.to_string(),
			},
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn agent_errors_map_to_relay_codes() {
		let timeout = Error::from_agent(
			"s1",
			droidplane_runtime::Error::Timeout {
				request_id: "4".into(),
				after: Duration::from_secs(15),
			},
		);
		assert_eq!(timeout.code(), ErrorCode::AgentTimeout);
		assert_eq!(timeout.to_string(), "agent for session 's1' did not reply within 15000ms");

		let closed = Error::from_agent("s1", droidplane_runtime::Error::ChannelClosed);
		assert_eq!(closed.code(), ErrorCode::AgentUnreachable);

		let handshake = Error::from_agent(
			"s1",
			droidplane_runtime::Error::HandshakeTimeout {
				url: "ws://10.0.0.4:8081/".into(),
				after: Duration::from_secs(5),
			},
		);
		assert_eq!(handshake.code(), ErrorCode::AgentUnreachable);
	}

	#[test]
	fn sanitizer_details_list_every_violation() {
		let err = Error::SanitizerRejected {
			violations: vec!["Deployment/a: hostNetwork is forbidden".into(), "Deployment/a: hostPID is forbidden".into()],
		};
		assert_eq!(err.code(), ErrorCode::SanitizerRejected);
		assert_eq!(err.details().unwrap()["violations"].as_array().unwrap().len(), 2);
	}
}
