#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use devchat_util::time::unix_ms_now;
use tracing::info;

use crate::server::extensions::ExtensionHost;
use crate::server::history::HistoryBuffer;
use crate::server::room::RoomState;
use crate::server::router::RoomServer;
use crate::server::snapshot::SnapshotStore;

/// Room parameters used when nothing is resumed.
#[derive(Debug, Clone)]
pub struct RoomSeed {
	pub name: String,
	pub host_nick: String,
	pub history_capacity: usize,
}

#[derive(Debug)]
pub struct PreparedRoom {
	pub server: RoomServer,
	/// Id to save under on shutdown; `None` until the first save assigns one.
	pub snapshot_id: Option<String>,
}

/// Build the room, re-seeding history and extension state from a snapshot when `resume` is set.
///
/// A failed or missing resume is an error: continuing would silently drop the prior room.
pub async fn prepare_room(
	seed: RoomSeed,
	mut extensions: ExtensionHost,
	store: Option<&SnapshotStore>,
	resume: Option<&str>,
) -> anyhow::Result<PreparedRoom> {
	let mut history = HistoryBuffer::new(seed.history_capacity);

	let Some(resume_id) = resume else {
		let room = RoomState::create(seed.name, seed.host_nick, unix_ms_now());
		info!(room = %room.name(), host = %room.host().display_name, "room created");
		return Ok(PreparedRoom {
			server: RoomServer::new(room, history, extensions),
			snapshot_id: None,
		});
	};

	let store = store.ok_or_else(|| anyhow!("cannot resume room {resume_id}: persistence is disabled"))?;
	let snapshot = store
		.load(resume_id)
		.await
		.with_context(|| format!("load room {resume_id}"))?
		.ok_or_else(|| anyhow!("no saved room with id {resume_id}"))?;

	history.replace(snapshot.history);
	extensions.restore_all(&snapshot.extension_states);
	store.touch(&snapshot.id).await.with_context(|| format!("touch room {resume_id}"))?;

	let room = RoomState::create(snapshot.name, snapshot.host_name, snapshot.created_at);
	info!(
		room_id = %snapshot.id,
		room = %room.name(),
		history = history.len(),
		extensions = snapshot.extension_states.len(),
		"room resumed"
	);

	Ok(PreparedRoom {
		server: RoomServer::new(room, history, extensions),
		snapshot_id: Some(snapshot.id),
	})
}
