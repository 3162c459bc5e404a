#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sender name used for server-authored notices.
pub const SYSTEM_SENDER: &str = "System";

/// Opaque per-extension state, keyed by extension name.
pub type ExtensionStates = BTreeMap<String, serde_json::Value>;

/// Errors for parsing identifiers and kinds from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown history kind: {0}")]
	UnknownKind(String),
}

/// Participant identifier, generated once per connection and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
	/// Create a non-empty `ParticipantId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Fresh random id.
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ParticipantId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ParticipantId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ParticipantId::new(s.to_string())
	}
}

/// A connected identity within the room.
///
/// Serialized as the roster wire shape `{id, nick, isHost}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
	pub id: ParticipantId,
	#[serde(rename = "nick")]
	pub display_name: String,
	#[serde(rename = "isHost")]
	pub is_host: bool,
}

impl Participant {
	pub fn guest(id: ParticipantId, display_name: impl Into<String>) -> Self {
		Self {
			id,
			display_name: display_name.into(),
			is_host: false,
		}
	}

	pub fn host(id: ParticipantId, display_name: impl Into<String>) -> Self {
		Self {
			id,
			display_name: display_name.into(),
			is_host: true,
		}
	}
}

/// The single room hosted by a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Room {
	pub name: String,
	pub host: Participant,
	/// Admission-ordered; the host is always first.
	pub roster: Vec<Participant>,
	pub created_at: i64,
}

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
	Chat,
	System,
	#[serde(alias = "plugin")]
	Extension,
}

impl HistoryKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			HistoryKind::Chat => "chat",
			HistoryKind::System => "system",
			HistoryKind::Extension => "extension",
		}
	}
}

impl fmt::Display for HistoryKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for HistoryKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"chat" => Ok(HistoryKind::Chat),
			"system" => Ok(HistoryKind::System),
			"extension" | "plugin" => Ok(HistoryKind::Extension),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// History entry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().simple().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for EntryId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// One immutable line of room history.
///
/// Serialized as the snapshot record shape `{id, kind, sender, content, timestamp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub id: EntryId,
	pub kind: HistoryKind,
	#[serde(rename = "sender")]
	pub author: String,
	#[serde(rename = "content")]
	pub text: String,
	#[serde(rename = "timestamp")]
	pub at: i64,
}

impl HistoryEntry {
	pub fn new(kind: HistoryKind, author: impl Into<String>, text: impl Into<String>, at: i64) -> Self {
		Self {
			id: EntryId::generate(),
			kind,
			author: author.into(),
			text: text.into(),
			at,
		}
	}

	pub fn system(text: impl Into<String>, at: i64) -> Self {
		Self::new(HistoryKind::System, SYSTEM_SENDER, text, at)
	}
}
