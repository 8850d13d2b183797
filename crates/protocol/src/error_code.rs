use serde::{Deserialize, Serialize};

/// Standardized error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	ConfigurationError,
	TemplateNotFound,
	RenderError,
	SanitizerRejected,
	UnsupportedKind,
	ApplyFailed,
	SessionNotFound,
	SessionNotReady,
	SessionConflict,
	AgentUnreachable,
	AgentTimeout,
	StreamUnreachable,
	InvalidPayload,
	UnknownAction,
	MissingSession,
	Unauthorized,
	Cancelled,
	ClusterError,
	InternalError,
}

impl ErrorCode {
	pub fn as_str(self) -> &'static str {
		match self {
			ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
			ErrorCode::TemplateNotFound => "TEMPLATE_NOT_FOUND",
			ErrorCode::RenderError => "RENDER_ERROR",
			ErrorCode::SanitizerRejected => "SANITIZER_REJECTED",
			ErrorCode::UnsupportedKind => "UNSUPPORTED_KIND",
			ErrorCode::ApplyFailed => "APPLY_FAILED",
			ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
			ErrorCode::SessionNotReady => "SESSION_NOT_READY",
			ErrorCode::SessionConflict => "SESSION_CONFLICT",
			ErrorCode::AgentUnreachable => "AGENT_UNREACHABLE",
			ErrorCode::AgentTimeout => "AGENT_TIMEOUT",
			ErrorCode::StreamUnreachable => "STREAM_UNREACHABLE",
			ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
			ErrorCode::UnknownAction => "UNKNOWN_ACTION",
			ErrorCode::MissingSession => "MISSING_SESSION",
			ErrorCode::Unauthorized => "UNAUTHORIZED",
			ErrorCode::Cancelled => "CANCELLED",
			ErrorCode::ClusterError => "CLUSTER_ERROR",
			ErrorCode::InternalError => "INTERNAL_ERROR",
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Error body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
	pub ok: bool,
	pub error: ErrorInfo,
}

/// Error information for failed HTTP calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
	pub code: ErrorCode,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
	pub fn new(code: ErrorCode, message: impl Into<String>, details: Option<serde_json::Value>) -> Self {
		Self {
			ok: false,
			error: ErrorInfo {
				code,
				message: message.into(),
				details,
			},
		}
	}
}
