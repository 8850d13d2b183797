//! `/session/{id}/stream`: upgrade passthrough to the pod's stream endpoint.
//!
//! The client's upgrade request is replayed against the upstream over a
//! fresh HTTP/1.1 connection. Only when the upstream answers `101` is the
//! client switched too; from then on bytes are spliced without inspection.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, HOST, UPGRADE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use droidplane::Error;
use droidplane::stream::splice;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tracing::{debug, info, warn};

use super::{AppState, KEY_HEADERS};
use crate::error::ApiResult;

fn unreachable(session_id: &str, message: impl std::fmt::Display) -> Error {
	Error::StreamUnreachable {
		session_id: session_id.to_string(),
		message: message.to_string(),
	}
}

/// Upstream path plus the client's query string without `authKey`.
fn upstream_uri(stream_path: &str, query: Option<&str>) -> String {
	let forwarded: Vec<&str> = query
		.unwrap_or_default()
		.split('&')
		.filter(|pair| !pair.is_empty() && !pair.starts_with("authKey="))
		.collect();
	if forwarded.is_empty() {
		stream_path.to_string()
	} else {
		format!("{stream_path}?{}", forwarded.join("&"))
	}
}

pub(super) async fn proxy_stream(State(state): State<AppState>, Path(session_id): Path<String>, mut request: Request) -> ApiResult<Response> {
	if !request.headers().contains_key(UPGRADE) {
		return Err(Error::InvalidPayload("stream endpoint requires an upgrade request".into()).into());
	}

	let (upstream, target) = state.stream.connect(&session_id).await?;
	let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(upstream))
		.await
		.map_err(|err| unreachable(&session_id, err))?;
	tokio::spawn(async move {
		if let Err(err) = connection.with_upgrades().await {
			debug!(target = "droidplane.stream", error = %err, "upstream connection ended");
		}
	});

	let mut builder = hyper::Request::builder()
		.method(request.method().clone())
		.uri(upstream_uri(&state.stream_path, request.uri().query()));
	for (name, value) in request.headers() {
		let credential = name == AUTHORIZATION || KEY_HEADERS.contains(&name.as_str());
		if name != HOST && !credential {
			builder = builder.header(name, value);
		}
	}
	let host = HeaderValue::from_str(&target).map_err(|err| unreachable(&session_id, err))?;
	let upstream_request = builder.header(HOST, host).body(Empty::<Bytes>::new()).map_err(|err| unreachable(&session_id, err))?;

	let mut upstream_response = sender.send_request(upstream_request).await.map_err(|err| unreachable(&session_id, err))?;
	if upstream_response.status() != StatusCode::SWITCHING_PROTOCOLS {
		return Err(unreachable(&session_id, format!("{target} answered {} instead of switching protocols", upstream_response.status())).into());
	}

	let client_upgrade = hyper::upgrade::on(&mut request);
	let upstream_upgrade = hyper::upgrade::on(&mut upstream_response);
	let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
	for (name, value) in upstream_response.headers() {
		response = response.header(name, value);
	}

	info!(target = "droidplane.stream", %session_id, %target, "stream upgraded");
	let task_session_id = session_id.clone();
	tokio::spawn(async move {
		let session_id = task_session_id;
		match tokio::try_join!(client_upgrade, upstream_upgrade) {
			Ok((client, upstream)) => {
				let outcome = splice(TokioIo::new(client), TokioIo::new(upstream)).await;
				debug!(target = "droidplane.stream", %session_id, ended_by = ?outcome.ended_by, bytes = outcome.bytes, "stream closed");
			}
			Err(err) => warn!(target = "droidplane.stream", %session_id, error = %err, "stream upgrade failed"),
		}
	});

	response.body(Body::empty()).map_err(|err| unreachable(&session_id, err).into())
}
