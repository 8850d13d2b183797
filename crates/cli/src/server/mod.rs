//! HTTP and WebSocket surface.
//!
//! Every route except `/health` requires the access key when one is
//! configured. WebSocket clients that cannot set headers pass it as
//! `?authKey=`.

mod relay_ws;
mod routes;
mod stream;

use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use droidplane::relay::CommandRelay;
use droidplane::stream::StreamProxy;
use serde::Deserialize;
use tracing::debug;

use crate::error::ApiError;

const KEY_HEADERS: &[&str] = &["x-auth-key", "authkey", "auth-key"];

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
	pub relay: Arc<CommandRelay>,
	pub stream: Arc<StreamProxy>,
	/// Upgrade path requested from the pod's stream endpoint.
	pub stream_path: Arc<str>,
	pub auth_key: Option<Arc<str>>,
}

pub fn router(state: AppState) -> Router {
	let protected = Router::new()
		.route("/sessions", get(routes::list_sessions))
		.route("/session", post(routes::create_session))
		.route("/session/{id}", delete(routes::delete_session))
		.route("/session/{id}/status", get(routes::session_status))
		.route("/session/{id}/logs", get(routes::session_logs))
		.route("/session/{id}/scale", post(routes::scale_session))
		.route("/session/{id}/action", post(routes::session_action))
		.route("/session/{id}/stream", get(stream::proxy_stream))
		.route("/relay", get(relay_ws::upgrade))
		.route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

	Router::new().route("/health", get(routes::health)).merge(protected).with_state(state)
}

#[derive(Deserialize)]
struct KeyQuery {
	#[serde(rename = "authKey")]
	auth_key: Option<String>,
}

fn presented_key(request: &Request) -> Option<String> {
	let headers = request.headers();
	for name in KEY_HEADERS {
		if let Some(value) = headers.get(*name).and_then(|value| value.to_str().ok()) {
			return Some(value.to_string());
		}
	}
	if let Some(token) = headers
		.get(AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
	{
		return Some(token.trim().to_string());
	}
	Query::<KeyQuery>::try_from_uri(request.uri()).ok().and_then(|Query(query)| query.auth_key)
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
	let Some(expected) = state.auth_key.as_deref() else {
		return next.run(request).await;
	};
	let presented = presented_key(&request);
	match presented {
		Some(key) if constant_time_eq(expected.as_bytes(), key.as_bytes()) => next.run(request).await,
		_ => {
			debug!(target = "droidplane.http", path = %request.uri().path(), "rejected unauthenticated request");
			ApiError::from(droidplane::Error::Unauthorized).into_response()
		}
	}
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	a.len() == b.len() && a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn constant_time_comparison() {
		assert!(constant_time_eq(b"secret", b"secret"));
		assert!(!constant_time_eq(b"secret", b"secreT"));
		assert!(!constant_time_eq(b"secret", b"secret-longer"));
		assert!(!constant_time_eq(b"secret", b""));
	}

	#[test]
	fn keys_are_read_from_headers_bearer_and_query() {
		let request = |uri: &str, header: Option<(&str, &str)>| {
			let mut builder = axum::http::Request::builder().uri(uri);
			if let Some((name, value)) = header {
				builder = builder.header(name, value);
			}
			builder.body(axum::body::Body::empty()).unwrap()
		};

		let r = request("/relay", Some(("x-auth-key", "k1")));
		assert_eq!(presented_key(&r).as_deref(), Some("k1"));
		let r = request("/relay", Some(("auth-key", "k2")));
		assert_eq!(presented_key(&r).as_deref(), Some("k2"));
		let r = request("/relay", Some(("authorization", "Bearer k3")));
		assert_eq!(presented_key(&r).as_deref(), Some("k3"));
		let r = request("/relay?authKey=k4", None);
		assert_eq!(presented_key(&r).as_deref(), Some("k4"));
		let r = request("/relay", None);
		assert!(presented_key(&r).is_none());
	}
}
