#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use devchat_domain::Participant;
use devchat_protocol::{
	AuthUser, CodecError, DEFAULT_MAX_FRAME_SIZE, Envelope, Payload, decode_envelope, decode_envelope_bytes,
	encode_envelope,
};
use devchat_util::endpoint::WsEndpoint;
use devchat_util::invite::Invite;
use devchat_util::time::unix_ms_now;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

pub mod view;

/// Default endpoint for local rooms.
pub const DEFAULT_SERVER_ENDPOINT_WS: &str = "ws://127.0.0.1:8080";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Room endpoint.
	pub endpoint: WsEndpoint,

	/// Requested display name; the server may adjust it.
	pub nick: String,

	/// Optional identity token presented with the join.
	pub token: Option<String>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + join handshake.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	pub fn new(endpoint: WsEndpoint, nick: impl Into<String>) -> Self {
		Self {
			endpoint,
			nick: nick.into(),
			token: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(10),
		}
	}

	/// Convenience: create a config from `ws://host:port`.
	pub fn from_ws_endpoint(endpoint: &str, nick: impl Into<String>) -> Result<Self, ClientCoreError> {
		let endpoint = WsEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected ws://host:port): {msg}")))?;
		Ok(Self::new(endpoint, nick))
	}

	/// Create a config from an invite code handed out by the host.
	pub fn from_invite(code: &str, nick: impl Into<String>) -> Result<Self, ClientCoreError> {
		let invite = Invite::decode(code).map_err(ClientCoreError::Protocol)?;
		Ok(Self::new(invite.endpoint(), nick))
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Envelope encode/decode error.
	#[error(transparent)]
	Codec(#[from] CodecError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server refused the join (bad nick, already joined).
	#[error("join rejected: {0}")]
	JoinRejected(String),

	/// The server refused the identity token.
	#[error("authentication failed: {0}")]
	AuthRejected(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),

	/// Other error.
	#[error("error: {0}")]
	Other(String),
}

impl From<anyhow::Error> for ClientCoreError {
	fn from(e: anyhow::Error) -> Self {
		ClientCoreError::Other(format!("{e:#}"))
	}
}

/// Result of a successful join handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined {
	/// The participant as admitted, including the final display name.
	pub participant: Participant,
	/// Human-readable welcome line.
	pub welcome: String,
	/// Present when a token was verified.
	pub auth: Option<AuthUser>,
}

/// A joined room session.
pub struct Session {
	sender: SessionSender,
	events: SessionEvents,
	joined: Joined,
}

/// Sending half of a session.
pub struct SessionSender {
	sink: SplitSink<WsStream, Message>,
	nick: String,
	max_frame_bytes: usize,
}

/// Receiving half of a session.
pub struct SessionEvents {
	stream: SplitStream<WsStream>,
	pending: VecDeque<Envelope>,
	max_frame_bytes: usize,
}

impl Session {
	/// Connect and perform the join handshake.
	pub async fn connect(cfg: ClientConfig) -> Result<Self, ClientCoreError> {
		let url = cfg.endpoint.url();
		let connect_timeout = cfg.connect_timeout;

		let (ws, _resp) = tokio::time::timeout(connect_timeout, connect_async(url.as_str()))
			.await
			.map_err(|_| ClientCoreError::Connect(format!("connect timeout after {connect_timeout:?} ({url})")))?
			.map_err(|e| ClientCoreError::Connect(format!("{url}: {e}")))?;
		info!(%url, "connected");

		let (sink, stream) = ws.split();
		let mut sender = SessionSender {
			sink,
			nick: cfg.nick.clone(),
			max_frame_bytes: cfg.max_frame_bytes,
		};
		let mut events = SessionEvents {
			stream,
			pending: VecDeque::new(),
			max_frame_bytes: cfg.max_frame_bytes,
		};

		sender.send(&Envelope::join(cfg.nick, cfg.token, unix_ms_now())).await?;

		let joined = tokio::time::timeout(connect_timeout, events.await_welcome())
			.await
			.map_err(|_| ClientCoreError::Protocol(format!("timeout waiting for welcome after {connect_timeout:?}")))??;

		sender.nick = joined.participant.display_name.clone();
		debug!(
			participant = %joined.participant.display_name,
			participant_id = %joined.participant.id,
			authenticated = joined.auth.is_some(),
			"joined room"
		);

		Ok(Self { sender, events, joined })
	}

	pub fn joined(&self) -> &Joined {
		&self.joined
	}

	/// Confirmed display name.
	pub fn nick(&self) -> &str {
		&self.joined.participant.display_name
	}

	pub async fn send_chat(&mut self, message: impl Into<String>) -> Result<(), ClientCoreError> {
		self.sender.send_chat(message).await
	}

	pub async fn send_extension(&mut self, message: impl Into<String>) -> Result<(), ClientCoreError> {
		self.sender.send_extension(message).await
	}

	/// Next envelope from the room; `None` once the server closes the connection.
	pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, ClientCoreError> {
		self.events.next_envelope().await
	}

	pub async fn close(self) -> Result<(), ClientCoreError> {
		self.sender.close().await
	}

	/// Split into independently owned halves so sending and receiving can run in separate tasks.
	pub fn split(self) -> (SessionSender, SessionEvents, Joined) {
		(self.sender, self.events, self.joined)
	}
}

impl SessionSender {
	pub async fn send(&mut self, env: &Envelope) -> Result<(), ClientCoreError> {
		let text = encode_envelope(env, self.max_frame_bytes)?;
		self.sink
			.send(Message::Text(text.into()))
			.await
			.map_err(|e| ClientCoreError::Io(format!("send {} failed: {e}", env.kind())))
	}

	/// The sender field is informational; the server stamps the confirmed name.
	pub async fn send_chat(&mut self, message: impl Into<String>) -> Result<(), ClientCoreError> {
		let env = Envelope::chat(self.nick.clone(), message, unix_ms_now());
		self.send(&env).await
	}

	pub async fn send_extension(&mut self, message: impl Into<String>) -> Result<(), ClientCoreError> {
		let env = Envelope::extension(self.nick.clone(), message, unix_ms_now());
		self.send(&env).await
	}

	pub async fn close(mut self) -> Result<(), ClientCoreError> {
		self.sink
			.close()
			.await
			.map_err(|e| ClientCoreError::Io(format!("close failed: {e}")))
	}
}

impl SessionEvents {
	pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, ClientCoreError> {
		if let Some(env) = self.pending.pop_front() {
			return Ok(Some(env));
		}

		loop {
			let Some(msg) = self.stream.next().await else {
				return Ok(None);
			};
			let msg = msg.map_err(|e| ClientCoreError::Io(format!("read failed: {e}")))?;
			match msg {
				Message::Text(text) => return Ok(Some(decode_envelope(text.as_str(), self.max_frame_bytes)?)),
				Message::Binary(bytes) => return Ok(Some(decode_envelope_bytes(&bytes, self.max_frame_bytes)?)),
				Message::Close(frame) => {
					debug!(?frame, "server closed the connection");
					return Ok(None);
				}
				// Ping/pong is answered by the transport.
				Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
			}
		}
	}

	/// Read until the join acknowledgement; envelopes that arrive first are kept for the caller.
	async fn await_welcome(&mut self) -> Result<Joined, ClientCoreError> {
		let mut auth = None;
		let mut early = VecDeque::new();

		loop {
			let env = self
				.next_envelope()
				.await?
				.ok_or_else(|| ClientCoreError::Protocol("connection closed before welcome".to_string()))?;

			match env.payload {
				Payload::System(system) if system.assigned.is_some() => {
					let participant = system
						.assigned
						.ok_or_else(|| ClientCoreError::Protocol("welcome without participant".to_string()))?;
					self.pending = early;
					return Ok(Joined {
						participant,
						welcome: system.message,
						auth,
					});
				}
				Payload::AuthSuccess(success) => auth = Some(success.user),
				Payload::AuthError(err) => return Err(ClientCoreError::AuthRejected(err.message)),
				Payload::Error(err) => return Err(ClientCoreError::JoinRejected(err.message)),
				payload => early.push_back(Envelope::new(payload, env.timestamp)),
			}
		}
	}
}
