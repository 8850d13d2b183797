//! `/relay`: JSON command relay over WebSocket.
//!
//! Each text frame is handled on its own task so a slow agent does not block
//! other requests from the same client. Replies are written in completion
//! order; clients correlate them by `requestId`.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use droidplane::relay::{CommandRelay, RelayClient};
use droidplane_protocol::RelayReply;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::AppState;

const REPLY_BUFFER: usize = 256;

pub(super) async fn upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
	ws.on_upgrade(move |socket| handle_socket(socket, state.relay))
}

async fn handle_socket(socket: WebSocket, relay: Arc<CommandRelay>) {
	let client = relay.open_client();
	let (mut ws_sink, mut ws_stream) = socket.split();
	let (reply_tx, mut reply_rx) = mpsc::channel::<RelayReply>(REPLY_BUFFER);

	let send_task = tokio::spawn(async move {
		while let Some(reply) = reply_rx.recv().await {
			let text = match serde_json::to_string(&reply) {
				Ok(text) => text,
				Err(err) => {
					warn!(target = "droidplane.relay", error = %err, "failed to serialize reply");
					continue;
				}
			};
			if ws_sink.send(Message::Text(text.into())).await.is_err() {
				break;
			}
		}
	});

	while let Some(frame) = ws_stream.next().await {
		let text = match frame {
			Ok(Message::Text(text)) => text.as_str().to_string(),
			Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
			Ok(Message::Close(_)) => break,
			Ok(Message::Ping(_) | Message::Pong(_)) => continue,
			Err(err) => {
				debug!(target = "droidplane.relay", client = client.id(), error = %err, "relay socket read failed");
				break;
			}
		};
		tokio::spawn(dispatch(Arc::clone(&relay), client.clone(), text, reply_tx.clone()));
	}

	relay.close_client(&client).await;
	drop(reply_tx);
	send_task.abort();
}

async fn dispatch(relay: Arc<CommandRelay>, client: RelayClient, text: String, reply_tx: mpsc::Sender<RelayReply>) {
	let reply = relay.handle_text(&client, &text).await;
	// Results for a departed client are discarded.
	if client.is_closed() {
		return;
	}
	let _ = reply_tx.send(reply).await;
}
