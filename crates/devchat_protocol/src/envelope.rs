#![forbid(unsafe_code)]

use core::fmt;

use devchat_domain::{ExtensionStates, Participant, SYSTEM_SENDER};
use serde::{Deserialize, Serialize};

/// Wire `type` of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
	Join,
	Chat,
	System,
	Extension,
	Roster,
	Error,
	AuthSuccess,
	AuthError,
}

impl EnvelopeKind {
	pub const ALL: [EnvelopeKind; 8] = [
		EnvelopeKind::Join,
		EnvelopeKind::Chat,
		EnvelopeKind::System,
		EnvelopeKind::Extension,
		EnvelopeKind::Roster,
		EnvelopeKind::Error,
		EnvelopeKind::AuthSuccess,
		EnvelopeKind::AuthError,
	];

	/// Stable wire identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EnvelopeKind::Join => "join",
			EnvelopeKind::Chat => "chat",
			EnvelopeKind::System => "system",
			EnvelopeKind::Extension => "extension",
			EnvelopeKind::Roster => "roster",
			EnvelopeKind::Error => "error",
			EnvelopeKind::AuthSuccess => "auth-success",
			EnvelopeKind::AuthError => "auth-error",
		}
	}

	pub fn from_wire(s: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|k| k.as_str() == s)
	}
}

impl fmt::Display for EnvelopeKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPayload {
	pub nick: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
	pub message: String,
	#[serde(default)]
	pub sender: String,
}

/// Extension traffic is relayed untouched; fields beyond `message` and `sender` ride along in `extra`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPayload {
	pub message: String,
	#[serde(default)]
	pub sender: String,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemPayload {
	pub message: String,
	pub sender: String,
	/// Present only on the join acknowledgement: the participant as admitted.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub assigned: Option<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterPayload {
	pub users: Vec<Participant>,
}

/// Shared by `error` and `auth-error` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
	pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
	pub id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nick: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSuccessPayload {
	pub user: AuthUser,
	#[serde(rename = "extensionStates", default, skip_serializing_if = "Option::is_none")]
	pub extension_states: Option<ExtensionStates>,
}

/// Kind-specific envelope body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
	Join(JoinPayload),
	Chat(ChatPayload),
	System(SystemPayload),
	Extension(ExtensionPayload),
	Roster(RosterPayload),
	Error(ErrorPayload),
	AuthSuccess(AuthSuccessPayload),
	AuthError(ErrorPayload),
}

impl Payload {
	pub fn kind(&self) -> EnvelopeKind {
		match self {
			Payload::Join(_) => EnvelopeKind::Join,
			Payload::Chat(_) => EnvelopeKind::Chat,
			Payload::System(_) => EnvelopeKind::System,
			Payload::Extension(_) => EnvelopeKind::Extension,
			Payload::Roster(_) => EnvelopeKind::Roster,
			Payload::Error(_) => EnvelopeKind::Error,
			Payload::AuthSuccess(_) => EnvelopeKind::AuthSuccess,
			Payload::AuthError(_) => EnvelopeKind::AuthError,
		}
	}
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
	pub payload: Payload,
	/// Unix milliseconds at send time.
	pub timestamp: i64,
}

impl Envelope {
	pub fn new(payload: Payload, timestamp: i64) -> Self {
		Self { payload, timestamp }
	}

	pub fn kind(&self) -> EnvelopeKind {
		self.payload.kind()
	}

	pub fn join(nick: impl Into<String>, token: Option<String>, timestamp: i64) -> Self {
		Self::new(
			Payload::Join(JoinPayload {
				nick: nick.into(),
				token,
			}),
			timestamp,
		)
	}

	pub fn chat(sender: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
		Self::new(
			Payload::Chat(ChatPayload {
				message: message.into(),
				sender: sender.into(),
			}),
			timestamp,
		)
	}

	pub fn extension(sender: impl Into<String>, message: impl Into<String>, timestamp: i64) -> Self {
		Self::new(
			Payload::Extension(ExtensionPayload {
				message: message.into(),
				sender: sender.into(),
				extra: serde_json::Map::new(),
			}),
			timestamp,
		)
	}

	pub fn system(message: impl Into<String>, timestamp: i64) -> Self {
		Self::new(
			Payload::System(SystemPayload {
				message: message.into(),
				sender: SYSTEM_SENDER.to_string(),
				assigned: None,
			}),
			timestamp,
		)
	}

	/// Join acknowledgement carrying the admitted participant.
	pub fn welcome(room_name: &str, assigned: Participant, timestamp: i64) -> Self {
		Self::new(
			Payload::System(SystemPayload {
				message: format!("Welcome to {room_name}! You are: {}", assigned.display_name),
				sender: SYSTEM_SENDER.to_string(),
				assigned: Some(assigned),
			}),
			timestamp,
		)
	}

	pub fn roster(users: Vec<Participant>, timestamp: i64) -> Self {
		Self::new(Payload::Roster(RosterPayload { users }), timestamp)
	}

	pub fn error(message: impl Into<String>, timestamp: i64) -> Self {
		Self::new(
			Payload::Error(ErrorPayload {
				message: message.into(),
			}),
			timestamp,
		)
	}

	pub fn auth_error(message: impl Into<String>, timestamp: i64) -> Self {
		Self::new(
			Payload::AuthError(ErrorPayload {
				message: message.into(),
			}),
			timestamp,
		)
	}

	pub fn auth_success(user: AuthUser, extension_states: Option<ExtensionStates>, timestamp: i64) -> Self {
		Self::new(Payload::AuthSuccess(AuthSuccessPayload { user, extension_states }), timestamp)
	}
}

/// One-line console rendering.
impl fmt::Display for Envelope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.payload {
			Payload::Join(p) => write!(f, "-> join as {}", p.nick),
			Payload::Chat(p) => write!(f, "<{}> {}", p.sender, p.message),
			Payload::Extension(p) => write!(f, "[{}] {}", p.sender, p.message),
			Payload::System(p) => write!(f, "* {}", p.message),
			Payload::Roster(p) => {
				let names = p
					.users
					.iter()
					.map(|u| if u.is_host { format!("{} (host)", u.display_name) } else { u.display_name.clone() })
					.collect::<Vec<_>>()
					.join(", ");
				write!(f, "* online ({}): {names}", p.users.len())
			}
			Payload::Error(p) => write!(f, "! {}", p.message),
			Payload::AuthError(p) => write!(f, "! auth: {}", p.message),
			Payload::AuthSuccess(p) => write!(f, "* authenticated as {}", p.user.id),
		}
	}
}
