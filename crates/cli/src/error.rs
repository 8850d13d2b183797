//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use droidplane_protocol::{ErrorCode, ErrorEnvelope};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
	#[error(transparent)]
	Core(#[from] droidplane::Error),
	#[error("{message}")]
	Upstream { code: ErrorCode, status: StatusCode, message: String },
}

impl ApiError {
	pub fn code(&self) -> ErrorCode {
		match self {
			ApiError::Core(err) => err.code(),
			ApiError::Upstream { code, .. } => *code,
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ApiError::Core(_) => status_for(self.code()),
			ApiError::Upstream { status, .. } => *status,
		}
	}
}

/// HTTP status for each wire error code.
pub fn status_for(code: ErrorCode) -> StatusCode {
	match code {
		ErrorCode::InvalidPayload | ErrorCode::UnknownAction | ErrorCode::MissingSession | ErrorCode::RenderError | ErrorCode::TemplateNotFound => {
			StatusCode::BAD_REQUEST
		}
		ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
		ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
		ErrorCode::SessionNotReady | ErrorCode::SessionConflict => StatusCode::CONFLICT,
		ErrorCode::SanitizerRejected | ErrorCode::UnsupportedKind => StatusCode::UNPROCESSABLE_ENTITY,
		ErrorCode::ApplyFailed | ErrorCode::ClusterError | ErrorCode::AgentUnreachable | ErrorCode::StreamUnreachable => StatusCode::BAD_GATEWAY,
		ErrorCode::AgentTimeout => StatusCode::GATEWAY_TIMEOUT,
		ErrorCode::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
		ErrorCode::ConfigurationError | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let status = self.status();
		let details = match &self {
			ApiError::Core(err) => err.details(),
			ApiError::Upstream { .. } => None,
		};
		if status.is_server_error() {
			tracing::warn!(target = "droidplane.http", code = %self.code(), error = %self, "request failed");
		}
		(status, Json(ErrorEnvelope::new(self.code(), self.to_string(), details))).into_response()
	}
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
