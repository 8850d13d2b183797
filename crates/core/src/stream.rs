//! Byte-level proxy to a session's screen-stream endpoint.
//!
//! The proxy only locates and dials the upstream and splices bytes; the HTTP
//! upgrade handshake is forwarded by the server layer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::relay::host_port;
use crate::session::SessionRegistry;

pub const DEFAULT_STREAM_PORT: u16 = 8080;

/// Which side ended a splice first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
	Client,
	Upstream,
}

#[derive(Debug)]
pub struct SpliceOutcome {
	pub ended_by: SpliceEnd,
	/// Bytes copied in the direction that ended; the other direction is cut short.
	pub bytes: u64,
	pub error: Option<io::Error>,
}

pub struct StreamProxy {
	registry: Arc<SessionRegistry>,
	port: u16,
	connect_timeout: Duration,
}

impl StreamProxy {
	pub fn new(registry: Arc<SessionRegistry>, port: u16, connect_timeout: Duration) -> Self {
		Self {
			registry,
			port,
			connect_timeout,
		}
	}

	pub fn port(&self) -> u16 {
		self.port
	}

	/// Dials the stream endpoint of a Running session.
	///
	/// Returns the socket and the `host:port` it is connected to. A cached
	/// address that refuses the connection is invalidated and resolved again, once.
	pub async fn connect(&self, session_id: &str) -> Result<(TcpStream, String)> {
		let resolved = self.registry.resolve_address(session_id).await?;
		let target = host_port(&resolved.address, self.port);
		match self.dial(&target).await {
			Ok(stream) => Ok((stream, target)),
			Err(err) if resolved.cached => {
				warn!(target = "droidplane.stream", %session_id, %target, error = %err, "cached stream address failed, resolving again");
				self.registry.invalidate_address(session_id);
				let fresh = self.registry.resolve_address(session_id).await?;
				let target = host_port(&fresh.address, self.port);
				let stream = self.dial(&target).await.map_err(|err| Error::StreamUnreachable {
					session_id: session_id.to_string(),
					message: format!("{target}: {err}"),
				})?;
				Ok((stream, target))
			}
			Err(err) => {
				self.registry.invalidate_address(session_id);
				Err(Error::StreamUnreachable {
					session_id: session_id.to_string(),
					message: format!("{target}: {err}"),
				})
			}
		}
	}

	async fn dial(&self, target: &str) -> io::Result<TcpStream> {
		let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
			.await
			.map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect timed out after {}ms", self.connect_timeout.as_millis())))??;
		stream.set_nodelay(true)?;
		debug!(target = "droidplane.stream", %target, "stream upstream connected");
		Ok(stream)
	}
}

/// Copies bytes both ways until either direction finishes or fails, then
/// shuts down both write halves.
pub async fn splice<C, U>(client: C, upstream: U) -> SpliceOutcome
where
	C: AsyncRead + AsyncWrite + Unpin,
	U: AsyncRead + AsyncWrite + Unpin,
{
	let (mut client_read, mut client_write) = tokio::io::split(client);
	let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

	let (ended_by, result) = tokio::select! {
		result = tokio::io::copy(&mut client_read, &mut upstream_write) => (SpliceEnd::Client, result),
		result = tokio::io::copy(&mut upstream_read, &mut client_write) => (SpliceEnd::Upstream, result),
	};

	let _ = client_write.shutdown().await;
	let _ = upstream_write.shutdown().await;

	let (bytes, error) = match result {
		Ok(bytes) => (bytes, None),
		Err(err) => (0, Some(err)),
	};
	debug!(target = "droidplane.stream", ?ended_by, bytes, failed = error.is_some(), "splice finished");
	SpliceOutcome { ended_by, bytes, error }
}
