#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;

use devchat_domain::{Participant, ParticipantId};
use devchat_protocol::Envelope;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection identifier assigned by the accept loop.
pub type ConnId = u64;

/// Per-connection outbound queue, drained by the connection's writer task.
pub type Outbound = mpsc::UnboundedSender<Envelope>;

/// One live transport connection.
#[derive(Debug)]
pub struct ConnectionEntry {
	/// Generated at attach; becomes the participant id on confirm.
	pub participant_id: ParticipantId,
	/// `None` while the connection is still joining.
	pub participant: Option<Participant>,
	pub remote: Option<SocketAddr>,
	outbound: Outbound,
}

impl ConnectionEntry {
	pub fn is_active(&self) -> bool {
		self.participant.is_some()
	}

	/// Queue an envelope; `false` when the writer is already gone.
	pub fn send(&self, env: Envelope) -> bool {
		self.outbound.send(env).is_ok()
	}
}

/// Live connections keyed by connection id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
	entries: BTreeMap<ConnId, ConnectionEntry>,
}

impl ConnectionRegistry {
	/// Register a connection with a provisional participant id.
	pub fn attach(&mut self, conn_id: ConnId, remote: Option<SocketAddr>, outbound: Outbound) -> ParticipantId {
		let entry = self.entries.entry(conn_id).or_insert_with(|| ConnectionEntry {
			participant_id: ParticipantId::generate(),
			participant: None,
			remote,
			outbound,
		});
		debug!(conn_id, participant_id = %entry.participant_id, "registry: attached");
		entry.participant_id.clone()
	}

	/// Bind the admitted participant. Returns `false` if the connection is gone.
	pub fn confirm(&mut self, conn_id: ConnId, participant: Participant) -> bool {
		match self.entries.get_mut(&conn_id) {
			Some(entry) => {
				entry.participant = Some(participant);
				true
			}
			None => false,
		}
	}

	/// Drop the mapping. Safe to call repeatedly; only the first call for a confirmed connection
	/// yields the participant.
	pub fn detach(&mut self, conn_id: ConnId) -> Option<Participant> {
		let entry = self.entries.remove(&conn_id)?;
		debug!(conn_id, active = entry.is_active(), "registry: detached");
		entry.participant
	}

	pub fn get(&self, conn_id: ConnId) -> Option<&ConnectionEntry> {
		self.entries.get(&conn_id)
	}

	pub fn for_each(&self, mut f: impl FnMut(ConnId, &ConnectionEntry)) {
		for (conn_id, entry) in &self.entries {
			f(*conn_id, entry);
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn active_count(&self) -> usize {
		self.entries.values().filter(|e| e.is_active()).count()
	}
}
