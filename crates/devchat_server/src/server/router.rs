#![forbid(unsafe_code)]

use std::net::SocketAddr;

use devchat_domain::{ExtensionStates, HistoryEntry, HistoryKind, Participant, SYSTEM_SENDER};
use devchat_protocol::{AuthUser, ChatPayload, CodecError, Envelope, ExtensionPayload, JoinPayload, Payload};
use devchat_util::time::unix_ms_now;
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::server::extensions::{Dispatch, ExtensionHost};
use crate::server::history::HistoryBuffer;
use crate::server::identity::{IdentityError, VerifiedIdentity};
use crate::server::registry::{ConnId, ConnectionRegistry, Outbound};
use crate::server::room::{MAX_NICK_CHARS, RoomState};

/// Token verification result, computed by the connection task before the join reaches the router.
pub type AuthOutcome = Result<VerifiedIdentity, IdentityError>;

/// Everything the router loop reacts to.
#[derive(Debug)]
pub enum RouterEvent {
	Attach {
		conn_id: ConnId,
		remote: Option<SocketAddr>,
		outbound: Outbound,
	},
	Inbound {
		conn_id: ConnId,
		frame: Result<Envelope, CodecError>,
		auth: Option<AuthOutcome>,
	},
	Detach {
		conn_id: ConnId,
	},
	/// A line typed by the host on the console.
	HostInput {
		line: String,
	},
	Capture {
		reply: oneshot::Sender<RoomCapture>,
	},
	/// Capture, run extension unload hooks, and stop the loop.
	Shutdown {
		reply: oneshot::Sender<RoomCapture>,
	},
}

/// Point-in-time copy of what a snapshot persists.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomCapture {
	pub room_name: String,
	pub host_name: String,
	pub history: Vec<HistoryEntry>,
	pub extension_states: ExtensionStates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
	Conn(ConnId),
	Host,
}

/// Room-wide state owned by the router loop.
///
/// Handlers are synchronous and run to completion, so roster, registry and history are never
/// observed mid-update. Fan-out only queues onto per-connection writers.
#[derive(Debug)]
pub struct RoomServer {
	registry: ConnectionRegistry,
	room: RoomState,
	history: HistoryBuffer,
	extensions: ExtensionHost,
	host_tx: Option<Outbound>,
}

impl RoomServer {
	pub fn new(room: RoomState, history: HistoryBuffer, extensions: ExtensionHost) -> Self {
		Self {
			registry: ConnectionRegistry::default(),
			room,
			history,
			extensions,
			host_tx: None,
		}
	}

	/// Mirror every broadcast to the host console.
	pub fn with_host_observer(mut self, tx: Outbound) -> Self {
		self.host_tx = Some(tx);
		self
	}

	pub fn room(&self) -> &RoomState {
		&self.room
	}

	pub fn history(&self) -> &HistoryBuffer {
		&self.history
	}

	pub fn history_mut(&mut self) -> &mut HistoryBuffer {
		&mut self.history
	}

	pub fn registry(&self) -> &ConnectionRegistry {
		&self.registry
	}

	pub fn extensions_mut(&mut self) -> &mut ExtensionHost {
		&mut self.extensions
	}

	/// Apply one event. Returns `false` once the loop should stop.
	pub fn handle(&mut self, event: RouterEvent) -> bool {
		match event {
			RouterEvent::Attach {
				conn_id,
				remote,
				outbound,
			} => self.attach(conn_id, remote, outbound),
			RouterEvent::Inbound { conn_id, frame, auth } => self.inbound(conn_id, frame, auth),
			RouterEvent::Detach { conn_id } => self.detach(conn_id),
			RouterEvent::HostInput { line } => self.host_input(&line),
			RouterEvent::Capture { reply } => {
				let _ = reply.send(self.capture());
			}
			RouterEvent::Shutdown { reply } => {
				let capture = self.capture();
				self.extensions.unload_all();
				let _ = reply.send(capture);
				return false;
			}
		}
		true
	}

	pub fn attach(&mut self, conn_id: ConnId, remote: Option<SocketAddr>, outbound: Outbound) {
		self.registry.attach(conn_id, remote, outbound);
	}

	pub fn inbound(&mut self, conn_id: ConnId, frame: Result<Envelope, CodecError>, auth: Option<AuthOutcome>) {
		if self.registry.get(conn_id).is_none() {
			debug!(conn_id, "inbound envelope for unknown connection; dropped");
			return;
		}

		let env = match frame {
			Ok(env) => env,
			Err(e) => {
				debug!(conn_id, error = %e, "undecodable envelope");
				self.protocol_error(conn_id, e.to_string());
				return;
			}
		};

		counter!("devchat_server_envelopes_in_total", "kind" => env.kind().as_str()).increment(1);

		let timestamp = env.timestamp;
		match env.payload {
			Payload::Join(join) => self.on_join(conn_id, join, auth),
			Payload::Chat(chat) => self.on_chat(conn_id, chat),
			Payload::Extension(ext) => self.on_extension(conn_id, ext, timestamp),
			other => self.protocol_error(conn_id, format!("unexpected {} envelope from client", other.kind())),
		}
	}

	fn on_join(&mut self, conn_id: ConnId, join: JoinPayload, auth: Option<AuthOutcome>) {
		let Some(entry) = self.registry.get(conn_id) else {
			return;
		};
		if entry.is_active() {
			self.protocol_error(conn_id, "already joined");
			return;
		}
		let participant_id = entry.participant_id.clone();

		let identity = match auth {
			Some(Err(e)) => {
				info!(conn_id, error = %e, "join token rejected");
				self.send_to(conn_id, Envelope::auth_error(e.to_string(), unix_ms_now()));
				return;
			}
			Some(Ok(identity)) => Some(identity),
			None => None,
		};

		let mut requested = join.nick.trim().to_string();
		if requested.is_empty()
			&& let Some(nick) = identity.as_ref().and_then(|i| i.nick.clone())
		{
			requested = nick;
		}
		if requested.is_empty() {
			self.protocol_error(conn_id, "nick must be non-empty");
			return;
		}
		if requested.chars().count() > MAX_NICK_CHARS || requested.chars().any(char::is_control) {
			self.protocol_error(
				conn_id,
				format!("nick must be at most {MAX_NICK_CHARS} printable characters"),
			);
			return;
		}

		let participant = self.room.admit(participant_id, &requested);
		self.registry.confirm(conn_id, participant.clone());
		let now = unix_ms_now();

		if let Some(identity) = identity {
			if let Some(states) = &identity.extension_states {
				self.extensions.restore_all(states);
			}
			let user = AuthUser {
				id: identity.user_id,
				nick: Some(participant.display_name.clone()),
			};
			self.send_to(conn_id, Envelope::auth_success(user, identity.extension_states, now));
		}

		self.send_to(conn_id, Envelope::welcome(self.room.name(), participant.clone(), now));

		let notice = self.history.record(
			HistoryKind::System,
			SYSTEM_SENDER,
			&format!("{} joined the room", participant.display_name),
			now,
		);
		self.broadcast(Envelope::system(notice.text, notice.at), Some(conn_id));
		self.broadcast_roster();

		info!(
			conn_id,
			participant = %participant.display_name,
			participant_id = %participant.id,
			requested = %requested,
			"participant joined"
		);
	}

	fn on_chat(&mut self, conn_id: ConnId, chat: ChatPayload) {
		let Some(author) = self.active_participant(conn_id) else {
			self.protocol_error(conn_id, "join before sending chat");
			return;
		};

		let entry = self
			.history
			.record(HistoryKind::Chat, &author.display_name, &chat.message, unix_ms_now());
		self.broadcast(Envelope::chat(entry.author, entry.text, entry.at), None);

		self.run_extension_command(Origin::Conn(conn_id), &author, &chat.message);
	}

	/// Relayed as received, including fields the server does not know about.
	fn on_extension(&mut self, conn_id: ConnId, ext: ExtensionPayload, timestamp: i64) {
		if self.active_participant(conn_id).is_none() {
			self.protocol_error(conn_id, "join before sending extension messages");
			return;
		}

		self.history
			.record(HistoryKind::Extension, &ext.sender, &ext.message, unix_ms_now());
		self.broadcast(Envelope::new(Payload::Extension(ext), timestamp), None);
	}

	/// Tear down a connection. Repeated calls are no-ops; a connection that never joined leaves no trace.
	pub fn detach(&mut self, conn_id: ConnId) {
		let Some(participant) = self.registry.detach(conn_id) else {
			return;
		};

		self.room.remove(&participant.id);
		let notice = self.history.record(
			HistoryKind::System,
			SYSTEM_SENDER,
			&format!("{} left the room", participant.display_name),
			unix_ms_now(),
		);
		self.broadcast(Envelope::system(notice.text, notice.at), None);
		self.broadcast_roster();

		info!(conn_id, participant = %participant.display_name, "participant left");
	}

	pub fn host_input(&mut self, line: &str) {
		let line = line.trim();
		if line.is_empty() {
			return;
		}

		let host = self.room.host().clone();
		let entry = self
			.history
			.record(HistoryKind::Chat, &host.display_name, line, unix_ms_now());
		self.broadcast(Envelope::chat(entry.author, entry.text, entry.at), None);

		self.run_extension_command(Origin::Host, &host, line);
	}

	pub fn capture(&self) -> RoomCapture {
		RoomCapture {
			room_name: self.room.name().to_string(),
			host_name: self.room.host().display_name.clone(),
			history: self.history.snapshot(None),
			extension_states: self.extensions.capture_all(),
		}
	}

	fn run_extension_command(&mut self, origin: Origin, invoker: &Participant, line: &str) {
		if !line.starts_with('/') {
			return;
		}

		match self
			.extensions
			.dispatch(line, invoker, self.room.roster(), self.room.name())
		{
			Dispatch::Unclaimed => {}
			Dispatch::Ran { extension, output } => {
				for message in output {
					let entry = self
						.history
						.record(HistoryKind::Extension, &extension, &message, unix_ms_now());
					self.broadcast(Envelope::extension(entry.author, entry.text, entry.at), None);
				}
			}
			Dispatch::Failed { extension, error } => {
				let reply = Envelope::error(format!("{extension}: {error}"), unix_ms_now());
				match origin {
					Origin::Conn(conn_id) => self.send_to(conn_id, reply),
					Origin::Host => {
						if let Some(host) = &self.host_tx {
							let _ = host.send(reply);
						}
					}
				}
			}
		}
	}

	fn active_participant(&self, conn_id: ConnId) -> Option<Participant> {
		self.registry.get(conn_id).and_then(|e| e.participant.clone())
	}

	fn protocol_error(&self, conn_id: ConnId, message: impl Into<String>) {
		counter!("devchat_server_protocol_errors_total").increment(1);
		self.send_to(conn_id, Envelope::error(message, unix_ms_now()));
	}

	fn send_to(&self, conn_id: ConnId, env: Envelope) {
		if let Some(entry) = self.registry.get(conn_id)
			&& !entry.send(env)
		{
			debug!(conn_id, "writer gone; unicast dropped");
		}
	}

	fn broadcast(&self, env: Envelope, except: Option<ConnId>) {
		let mut delivered = 0usize;
		self.registry.for_each(|conn_id, entry| {
			if entry.is_active() && Some(conn_id) != except && entry.send(env.clone()) {
				delivered += 1;
			}
		});
		if let Some(host) = &self.host_tx
			&& host.send(env.clone()).is_err()
		{
			warn!("host console closed; broadcast not mirrored");
		}
		counter!("devchat_server_broadcasts_total").increment(1);
		debug!(kind = %env.kind(), delivered, "broadcast");
	}

	fn broadcast_roster(&self) {
		let users = self.room.roster().to_vec();
		self.broadcast(Envelope::roster(users, unix_ms_now()), None);
	}
}

/// Run the router until every sender is gone or a shutdown is processed.
pub async fn run_router(mut server: RoomServer, mut events: mpsc::UnboundedReceiver<RouterEvent>) -> RoomServer {
	while let Some(event) = events.recv().await {
		if !server.handle(event) {
			break;
		}
	}
	debug!("router loop stopped");
	server
}

/// Cloneable sender side of the router queue.
#[derive(Debug, Clone)]
pub struct RouterHandle {
	tx: mpsc::UnboundedSender<RouterEvent>,
}

impl RouterHandle {
	/// Spawn `run_router` on the current runtime.
	pub fn spawn(server: RoomServer) -> (Self, tokio::task::JoinHandle<RoomServer>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let task = tokio::spawn(run_router(server, rx));
		(Self { tx }, task)
	}

	/// Queue an event. `false` when the router has stopped.
	pub fn send(&self, event: RouterEvent) -> bool {
		self.tx.send(event).is_ok()
	}

	pub fn host_input(&self, line: impl Into<String>) -> bool {
		self.send(RouterEvent::HostInput { line: line.into() })
	}

	pub async fn capture(&self) -> anyhow::Result<RoomCapture> {
		let (reply, rx) = oneshot::channel();
		if !self.send(RouterEvent::Capture { reply }) {
			anyhow::bail!("router stopped");
		}
		rx.await.map_err(|_| anyhow::anyhow!("router dropped capture request"))
	}

	pub async fn shutdown(&self) -> anyhow::Result<RoomCapture> {
		let (reply, rx) = oneshot::channel();
		if !self.send(RouterEvent::Shutdown { reply }) {
			anyhow::bail!("router stopped");
		}
		rx.await.map_err(|_| anyhow::anyhow!("router dropped shutdown request"))
	}
}
