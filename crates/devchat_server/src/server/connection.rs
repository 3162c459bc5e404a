#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use devchat_protocol::{
	CodecError, DEFAULT_MAX_FRAME_SIZE, Envelope, Payload, decode_envelope, decode_envelope_bytes, encode_envelope,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::server::identity::{IdentityError, IdentityVerifier};
use crate::server::registry::ConnId;
use crate::server::router::{AuthOutcome, RouterEvent, RouterHandle};

/// Per-connection limits.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,
	/// Upper bound on one join token check.
	pub verify_timeout: Duration,
	/// How long the writer may keep flushing after the reader has stopped.
	pub writer_drain: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			verify_timeout: Duration::from_secs(5),
			writer_drain: Duration::from_secs(1),
		}
	}
}

/// Drive one WebSocket connection: attach it to the router, forward decoded frames, and detach on close.
pub async fn handle_connection(
	conn_id: ConnId,
	stream: TcpStream,
	remote: SocketAddr,
	router: RouterHandle,
	verifier: Option<Arc<dyn IdentityVerifier>>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("devchat_server_connections_active").decrement(1.0);
		}
	}

	metrics::gauge!("devchat_server_connections_active").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let ws = tokio_tungstenite::accept_async(stream)
		.await
		.context("websocket handshake")?;
	let (mut sink, mut source) = ws.split();

	let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
	if !router.send(RouterEvent::Attach {
		conn_id,
		remote: Some(remote),
		outbound: out_tx,
	}) {
		return Err(anyhow!("router stopped"));
	}
	info!(conn_id, %remote, "connection attached");

	let writer_router = router.clone();
	let max_frame_bytes = settings.max_frame_bytes;
	let mut writer = tokio::spawn(async move {
		while let Some(env) = out_rx.recv().await {
			let text = match encode_envelope(&env, max_frame_bytes) {
				Ok(text) => text,
				Err(e) => {
					warn!(conn_id, kind = %env.kind(), error = %e, "dropping unencodable envelope");
					continue;
				}
			};
			if let Err(e) = sink.send(Message::Text(text.into())).await {
				debug!(conn_id, error = %e, "write failed; detaching");
				writer_router.send(RouterEvent::Detach { conn_id });
				return;
			}
		}
		let _ = sink.close().await;
	});

	let result = read_loop(conn_id, &mut source, &router, verifier.as_deref(), &settings).await;

	// Detach drops the router's outbound sender, which ends the writer.
	router.send(RouterEvent::Detach { conn_id });
	if tokio::time::timeout(settings.writer_drain, &mut writer).await.is_err() {
		writer.abort();
	}

	info!(conn_id, %remote, "connection closed");
	result
}

async fn read_loop(
	conn_id: ConnId,
	source: &mut SplitStream<WebSocketStream<TcpStream>>,
	router: &RouterHandle,
	verifier: Option<&dyn IdentityVerifier>,
	settings: &ConnectionSettings,
) -> anyhow::Result<()> {
	while let Some(msg) = source.next().await {
		let msg = msg.map_err(|e| anyhow!(e).context("websocket read failed"))?;
		let frame = match msg {
			Message::Text(text) => decode_envelope(text.as_str(), settings.max_frame_bytes),
			Message::Binary(bytes) => decode_envelope_bytes(&bytes, settings.max_frame_bytes),
			Message::Close(_) => break,
			_ => continue,
		};

		let auth = match verifier {
			Some(verifier) => verify_join_token(verifier, &frame, settings.verify_timeout).await,
			None => None,
		};

		if !router.send(RouterEvent::Inbound { conn_id, frame, auth }) {
			return Err(anyhow!("router stopped"));
		}
	}
	Ok(())
}

/// Check the token carried by a join, if any. Other frames pass through untouched.
async fn verify_join_token(
	verifier: &dyn IdentityVerifier,
	frame: &Result<Envelope, CodecError>,
	timeout: Duration,
) -> Option<AuthOutcome> {
	let Ok(Envelope {
		payload: Payload::Join(join),
		..
	}) = frame
	else {
		return None;
	};
	let token = join.token.as_deref()?.trim();
	if token.is_empty() {
		return None;
	}

	Some(match tokio::time::timeout(timeout, verifier.verify(token)).await {
		Ok(outcome) => outcome,
		Err(_) => Err(IdentityError::Timeout),
	})
}
