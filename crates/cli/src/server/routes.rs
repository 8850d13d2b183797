//! REST handlers.

use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use droidplane::Error;
use droidplane::cluster::LogOptions;
use droidplane::provision::{CreateSessionRequest, ProvisionedSession, ScaledSession};
use droidplane::relay::new_request_id;
use droidplane::session::{SessionLogs, SessionStatus};
use droidplane_protocol::{DeviceAction, RelayReply};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::AppState;
use crate::error::ApiResult;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_LOG_LIMIT_BYTES: u64 = 1000;
const MAX_LOG_LIMIT_BYTES: u64 = 1 << 20;

fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, Error> {
	if body.iter().all(u8::is_ascii_whitespace) {
		return Ok(T::default());
	}
	serde_json::from_slice(body).map_err(|err| Error::InvalidPayload(err.to_string()))
}

pub(super) async fn health() -> Json<Value> {
	Json(json!({ "ok": true }))
}

pub(super) async fn create_session(State(state): State<AppState>, body: Bytes) -> ApiResult<(StatusCode, Json<ProvisionedSession>)> {
	let request: CreateSessionRequest = parse_body(&body)?;
	let session = state.relay.create_session(&request).await?;
	info!(target = "droidplane.http", session_id = %session.session_id, profile = %session.profile, "session created");
	Ok((StatusCode::CREATED, Json(session)))
}

pub(super) async fn delete_session(State(state): State<AppState>, Path(session_id): Path<String>) -> ApiResult<Json<Value>> {
	let deleted = state.relay.delete_session(&session_id).await?;
	info!(target = "droidplane.http", %session_id, deleted = deleted.len(), "session deleted");
	Ok(Json(json!({ "ok": true, "sessionId": session_id, "deleted": deleted })))
}

pub(super) async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
	let sessions = state.relay.registry().list().await?;
	Ok(Json(json!({ "namespace": state.relay.registry().namespace(), "sessions": sessions })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LogsQuery {
	pod_name: Option<String>,
	container: Option<String>,
	limit_bytes: Option<u64>,
	tail_lines: Option<u64>,
	timestamps: Option<bool>,
}

/// Recent log output of one of the session's pods.
pub(super) async fn session_logs(
	State(state): State<AppState>,
	Path(session_id): Path<String>,
	Query(query): Query<LogsQuery>,
) -> ApiResult<Json<SessionLogs>> {
	let options = LogOptions {
		container: query.container.filter(|name| !name.is_empty()),
		limit_bytes: Some(query.limit_bytes.unwrap_or(DEFAULT_LOG_LIMIT_BYTES).clamp(1, MAX_LOG_LIMIT_BYTES)),
		tail_lines: query.tail_lines,
		timestamps: query.timestamps.unwrap_or(true),
	};
	let logs = state.relay.registry().logs(&session_id, query.pod_name.as_deref(), &options).await?;
	Ok(Json(logs))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ScaleBody {
	replicas: Option<u32>,
}

pub(super) async fn scale_session(State(state): State<AppState>, Path(session_id): Path<String>, body: Bytes) -> ApiResult<Json<ScaledSession>> {
	let body: ScaleBody = parse_body(&body)?;
	let replicas = body.replicas.ok_or_else(|| Error::InvalidPayload("replicas is required".into()))?;
	let scaled = state.relay.scale_session(&session_id, replicas).await?;
	info!(target = "droidplane.http", %session_id, replicas, kind = scaled.kind, "session scaled");
	Ok(Json(scaled))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatusQuery {
	wait_ms: Option<u64>,
}

pub(super) async fn session_status(
	State(state): State<AppState>,
	Path(session_id): Path<String>,
	Query(query): Query<StatusQuery>,
) -> ApiResult<Json<SessionStatus>> {
	let registry = state.relay.registry();
	let status = match query.wait_ms.filter(|ms| *ms > 0) {
		Some(ms) => {
			let window = Duration::from_millis(ms).min(state.relay.config().max_request_timeout);
			registry.wait_until_ready(&session_id, window, READY_POLL_INTERVAL.min(window)).await?
		}
		None => registry.resolve(&session_id).await?,
	};
	Ok(Json(status))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ActionBody {
	#[serde(default)]
	action: String,
	#[serde(default)]
	args: Option<Value>,
	#[serde(default)]
	request_id: Option<String>,
}

/// One device action over a connection opened for this call only.
pub(super) async fn session_action(State(state): State<AppState>, Path(session_id): Path<String>, body: Bytes) -> ApiResult<Json<RelayReply>> {
	let body: ActionBody = parse_body(&body)?;
	let action = DeviceAction::parse(&body.action).ok_or_else(|| Error::UnknownAction(body.action.clone()))?;
	let reply = state.relay.dispatch_device(None, &session_id, action, body.args).await?;
	let request_id = body.request_id.filter(|id| !id.is_empty()).unwrap_or_else(new_request_id);
	Ok(Json(RelayReply::from_agent(request_id, action.as_str(), reply).with_session(Some(session_id))))
}
