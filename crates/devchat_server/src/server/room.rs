#![forbid(unsafe_code)]

use devchat_domain::{Participant, ParticipantId, Room};
use rand::Rng;
use rand::distr::Alphanumeric;
use tracing::debug;

/// Longest display name, in characters, including any collision suffix.
pub const MAX_NICK_CHARS: usize = 32;

/// Length of the random suffix appended on a name collision.
pub const NAME_SUFFIX_LEN: usize = 4;

/// Roster invariants for the single hosted room.
///
/// Constructing a `RoomState` is the room-creation step; a process holds exactly one, so the room
/// cannot be created twice.
#[derive(Debug)]
pub struct RoomState {
	room: Room,
}

impl RoomState {
	pub fn create(name: impl Into<String>, host_display_name: impl Into<String>, created_at: i64) -> Self {
		let host = Participant::host(ParticipantId::generate(), host_display_name);
		let room = Room {
			name: name.into(),
			host: host.clone(),
			roster: vec![host],
			created_at,
		};
		debug!(room = %room.name, host = %room.host.display_name, "room created");
		Self { room }
	}

	pub fn room(&self) -> &Room {
		&self.room
	}

	pub fn name(&self) -> &str {
		&self.room.name
	}

	pub fn host(&self) -> &Participant {
		&self.room.host
	}

	pub fn roster(&self) -> &[Participant] {
		&self.room.roster
	}

	pub fn is_name_taken(&self, name: &str) -> bool {
		self.room.roster.iter().any(|p| p.display_name == name)
	}

	/// Admit a guest under `requested`, or under `requested_XXXX` when that name is taken.
	///
	/// On a collision `requested` is shortened so the suffixed name stays within `MAX_NICK_CHARS`.
	pub fn admit(&mut self, id: ParticipantId, requested: &str) -> Participant {
		let mut display_name = requested.to_string();
		if self.is_name_taken(&display_name) {
			let base: String = requested.chars().take(MAX_NICK_CHARS - NAME_SUFFIX_LEN - 1).collect();
			while self.is_name_taken(&display_name) {
				display_name = format!("{base}_{}", random_suffix());
			}
		}

		if display_name != requested {
			debug!(requested, assigned = %display_name, "nick collision resolved");
		}

		let participant = Participant::guest(id, display_name);
		self.room.roster.push(participant.clone());
		participant
	}

	/// Remove a guest. The host is never removed.
	pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
		if *id == self.room.host.id {
			return None;
		}
		let idx = self.room.roster.iter().position(|p| p.id == *id)?;
		Some(self.room.roster.remove(idx))
	}
}

fn random_suffix() -> String {
	rand::rng()
		.sample_iter(Alphanumeric)
		.take(NAME_SUFFIX_LEN)
		.map(char::from)
		.collect()
}
