//! Message transports between the relay and a device agent.
//!
//! A transport is split in two halves: a [`Transport`] that sends JSON
//! messages and a [`TransportReceiver`] whose `run` loop pushes every inbound
//! JSON message into an unbounded channel. [`AgentConnection`] owns both.
//!
//! [`AgentConnection`]: crate::AgentConnection

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default budget for establishing an agent connection.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sending half of a transport.
pub trait Transport: Send {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

	fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Receiving half of a transport.
pub trait TransportReceiver: Send {
	/// Reads until the peer closes or the transport fails.
	fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>;
}

/// Both transport halves plus the channel the receiver feeds.
pub struct TransportParts {
	pub sender: Box<dyn Transport>,
	pub receiver: Box<dyn TransportReceiver>,
	pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Options for dialing a device agent.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
	pub handshake_timeout: Duration,
	/// Sent as `x-api-key` when the agent requires a key.
	pub api_key: Option<String>,
}

impl Default for ConnectOptions {
	fn default() -> Self {
		Self {
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			api_key: None,
		}
	}
}

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport speaking JSON text frames.
pub struct WebSocketTransport {
	sink: SplitSink<AgentSocket, Message>,
	stream: SplitStream<AgentSocket>,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl WebSocketTransport {
	/// Dials `url`, failing if the handshake does not finish in time.
	pub async fn connect(url: &str, options: &ConnectOptions) -> Result<(Self, mpsc::UnboundedReceiver<Value>)> {
		let mut request = url.into_client_request().map_err(|err| Error::Unreachable {
			url: url.to_string(),
			message: err.to_string(),
		})?;
		if let Some(key) = &options.api_key {
			let value = HeaderValue::from_str(key).map_err(|_| Error::Transport("agent api key is not a valid header value".into()))?;
			request.headers_mut().insert("x-api-key", value);
		}

		let handshake = tokio_tungstenite::connect_async(request);
		let (socket, _) = match tokio::time::timeout(options.handshake_timeout, handshake).await {
			Ok(Ok(connected)) => connected,
			Ok(Err(err)) => {
				return Err(Error::Unreachable {
					url: url.to_string(),
					message: err.to_string(),
				});
			}
			Err(_) => {
				return Err(Error::HandshakeTimeout {
					url: url.to_string(),
					after: options.handshake_timeout,
				});
			}
		};
		debug!(target = "droidplane.agent", %url, "agent connection established");

		let (sink, stream) = socket.split();
		let (message_tx, message_rx) = mpsc::unbounded_channel();
		Ok((Self { sink, stream, message_tx }, message_rx))
	}

	pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
		TransportParts {
			sender: Box::new(WebSocketSender { sink: self.sink }),
			receiver: Box::new(WebSocketReceiver {
				stream: self.stream,
				message_tx: self.message_tx,
			}),
			message_rx,
		}
	}
}

struct WebSocketSender {
	sink: SplitSink<AgentSocket, Message>,
}

impl Transport for WebSocketSender {
	fn send(&mut self, message: Value) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move {
			let text = serde_json::to_string(&message)?;
			self.sink.send(Message::Text(text.into())).await.map_err(|err| Error::Transport(err.to_string()))
		})
	}

	fn close(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
		Box::pin(async move { self.sink.close().await.map_err(|err| Error::Transport(err.to_string())) })
	}
}

struct WebSocketReceiver {
	stream: SplitStream<AgentSocket>,
	message_tx: mpsc::UnboundedSender<Value>,
}

impl WebSocketReceiver {
	/// Returns false once nobody listens anymore.
	fn forward(&self, text: &str) -> bool {
		match serde_json::from_str::<Value>(text) {
			Ok(value) => self.message_tx.send(value).is_ok(),
			Err(err) => {
				warn!(target = "droidplane.agent", error = %err, "dropping non-JSON agent frame");
				true
			}
		}
	}
}

impl TransportReceiver for WebSocketReceiver {
	fn run(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
		Box::pin(async move {
			while let Some(frame) = self.stream.next().await {
				let keep_going = match frame {
					Ok(Message::Text(text)) => self.forward(text.as_str()),
					Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
						Ok(text) => self.forward(text),
						Err(_) => true,
					},
					Ok(Message::Close(_)) => false,
					Ok(_) => true,
					Err(err) => return Err(Error::Transport(err.to_string())),
				};
				if !keep_going {
					break;
				}
			}
			Ok(())
		})
	}
}
