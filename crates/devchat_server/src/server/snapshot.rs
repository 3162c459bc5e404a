#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use devchat_domain::{ExtensionStates, HistoryEntry};
use devchat_util::time::unix_ms_now;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Length of generated room identifiers.
const ROOM_ID_LEN: usize = 12;

/// Everything that outlives the hosting process.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
	pub id: String,
	pub name: String,
	pub host_name: String,
	pub port: u16,
	pub created_at: i64,
	pub last_opened_at: i64,
	pub history: Vec<HistoryEntry>,
	pub extension_states: ExtensionStates,
}

/// Listing row; history is reduced to a count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
	pub id: String,
	pub name: String,
	pub host_name: String,
	pub port: u16,
	pub created_at: i64,
	pub last_opened_at: i64,
	pub message_count: usize,
}

/// Fields supplied by the caller on save; timestamps and id are the store's business.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDraft {
	pub name: String,
	pub host_name: String,
	pub port: u16,
	pub history: Vec<HistoryEntry>,
	pub extension_states: ExtensionStates,
}

impl RoomSnapshot {
	pub fn summary(&self) -> RoomSummary {
		RoomSummary {
			id: self.id.clone(),
			name: self.name.clone(),
			host_name: self.host_name.clone(),
			port: self.port,
			created_at: self.created_at,
			last_opened_at: self.last_opened_at,
			message_count: self.history.len(),
		}
	}
}

pub fn generate_room_id() -> String {
	let mut id = uuid::Uuid::new_v4().simple().to_string();
	id.truncate(ROOM_ID_LEN);
	id
}

#[async_trait::async_trait]
pub trait SnapshotBackend: Send + Sync {
	/// Insert or update. A missing `id` creates a new record; an existing record keeps its `created_at`.
	async fn save(&self, id: Option<&str>, draft: SnapshotDraft) -> anyhow::Result<RoomSnapshot>;

	async fn load(&self, id: &str) -> anyhow::Result<Option<RoomSnapshot>>;

	/// Most recently opened first.
	async fn list(&self) -> anyhow::Result<Vec<RoomSummary>>;

	async fn delete(&self, id: &str) -> anyhow::Result<bool>;

	/// Refresh `last_opened_at` only.
	async fn touch(&self, id: &str) -> anyhow::Result<bool>;
}

#[derive(Default)]
pub struct InMemorySnapshotBackend {
	inner: Mutex<BTreeMap<String, RoomSnapshot>>,
}

#[async_trait::async_trait]
impl SnapshotBackend for InMemorySnapshotBackend {
	async fn save(&self, id: Option<&str>, draft: SnapshotDraft) -> anyhow::Result<RoomSnapshot> {
		let mut guard = self.inner.lock().await;
		let id = id.map(str::to_string).unwrap_or_else(generate_room_id);
		let now = unix_ms_now();
		let created_at = guard.get(&id).map(|s| s.created_at).unwrap_or(now);

		let snapshot = RoomSnapshot {
			id: id.clone(),
			name: draft.name,
			host_name: draft.host_name,
			port: draft.port,
			created_at,
			last_opened_at: now,
			history: draft.history,
			extension_states: draft.extension_states,
		};
		guard.insert(id, snapshot.clone());
		Ok(snapshot)
	}

	async fn load(&self, id: &str) -> anyhow::Result<Option<RoomSnapshot>> {
		Ok(self.inner.lock().await.get(id).cloned())
	}

	async fn list(&self) -> anyhow::Result<Vec<RoomSummary>> {
		let guard = self.inner.lock().await;
		let mut out: Vec<RoomSummary> = guard.values().map(RoomSnapshot::summary).collect();
		out.sort_by(|a, b| b.last_opened_at.cmp(&a.last_opened_at));
		Ok(out)
	}

	async fn delete(&self, id: &str) -> anyhow::Result<bool> {
		Ok(self.inner.lock().await.remove(id).is_some())
	}

	async fn touch(&self, id: &str) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		match guard.get_mut(id) {
			Some(s) => {
				s.last_opened_at = unix_ms_now().max(s.last_opened_at);
				Ok(true)
			}
			None => Ok(false),
		}
	}
}

type SnapshotRow = (String, String, String, i64, i64, i64, String, String);
type SummaryRow = (String, String, String, i64, i64, i64, i64);

/// Snapshots in a SQLite database; histories and extension states are stored as JSON text.
#[derive(Clone)]
pub struct SqliteSnapshotBackend {
	pool: sqlx::SqlitePool,
}

impl SqliteSnapshotBackend {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if !database_url.starts_with("sqlite:") {
			return Err(anyhow!("unsupported database_url (use sqlite:)"));
		}

		let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
		let mut opts = SqliteConnectOptions::from_str(database_url)
			.context("parse sqlite url")?
			.create_if_missing(true);

		let pool_opts = if in_memory {
			// Every connection to `:memory:` is its own database; keep exactly one alive.
			SqlitePoolOptions::new()
				.max_connections(1)
				.idle_timeout(None)
				.max_lifetime(None)
		} else {
			if let Some(parent) = opts.get_filename().parent()
				&& !parent.as_os_str().is_empty()
			{
				std::fs::create_dir_all(parent)
					.with_context(|| format!("create database directory {}", parent.display()))?;
			}
			opts = opts
				.journal_mode(SqliteJournalMode::Wal)
				.synchronous(SqliteSynchronous::Full);
			SqlitePoolOptions::new().max_connections(4)
		};

		let pool = pool_opts.connect_with(opts).await.context("connect sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		info!(database_url, "snapshot store ready");
		Ok(Self { pool })
	}
}

fn snapshot_from_row(row: SnapshotRow) -> anyhow::Result<RoomSnapshot> {
	let (id, name, host_name, port, created_at, last_opened_at, messages, extension_states) = row;
	let history: Vec<HistoryEntry> =
		serde_json::from_str(&messages).with_context(|| format!("decode history of room {id}"))?;
	let extension_states: ExtensionStates = serde_json::from_str(&extension_states)
		.with_context(|| format!("decode extension states of room {id}"))?;
	Ok(RoomSnapshot {
		port: u16::try_from(port).with_context(|| format!("room {id} has invalid port {port}"))?,
		id,
		name,
		host_name,
		created_at,
		last_opened_at,
		history,
		extension_states,
	})
}

#[async_trait::async_trait]
impl SnapshotBackend for SqliteSnapshotBackend {
	async fn save(&self, id: Option<&str>, draft: SnapshotDraft) -> anyhow::Result<RoomSnapshot> {
		let id = id.map(str::to_string).unwrap_or_else(generate_room_id);
		let messages = serde_json::to_string(&draft.history).context("encode history")?;
		let states = serde_json::to_string(&draft.extension_states).context("encode extension states")?;
		let now = unix_ms_now();

		let mut tx = self.pool.begin().await.context("begin sqlite tx")?;
		let existing: Option<(i64,)> = sqlx::query_as("SELECT created_at FROM room_snapshots WHERE id = ?")
			.bind(&id)
			.fetch_optional(&mut *tx)
			.await
			.context("select created_at (sqlite)")?;
		let created_at = existing.map(|(c,)| c).unwrap_or(now);

		sqlx::query(
			"INSERT INTO room_snapshots (id, name, host_name, port, created_at, last_opened_at, messages, extension_states) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
			ON CONFLICT(id) DO UPDATE SET name = excluded.name, host_name = excluded.host_name, port = excluded.port, \
			last_opened_at = excluded.last_opened_at, messages = excluded.messages, extension_states = excluded.extension_states",
		)
		.bind(&id)
		.bind(&draft.name)
		.bind(&draft.host_name)
		.bind(i64::from(draft.port))
		.bind(created_at)
		.bind(now)
		.bind(messages)
		.bind(states)
		.execute(&mut *tx)
		.await
		.context("upsert room snapshot (sqlite)")?;

		tx.commit().await.context("commit sqlite tx")?;
		debug!(room_id = %id, messages = draft.history.len(), "room snapshot written");

		Ok(RoomSnapshot {
			id,
			name: draft.name,
			host_name: draft.host_name,
			port: draft.port,
			created_at,
			last_opened_at: now,
			history: draft.history,
			extension_states: draft.extension_states,
		})
	}

	async fn load(&self, id: &str) -> anyhow::Result<Option<RoomSnapshot>> {
		let row: Option<SnapshotRow> = sqlx::query_as(
			"SELECT id, name, host_name, port, created_at, last_opened_at, messages, extension_states \
			FROM room_snapshots WHERE id = ?",
		)
		.bind(id)
		.fetch_optional(&self.pool)
		.await
		.context("select room snapshot (sqlite)")?;

		row.map(snapshot_from_row).transpose()
	}

	async fn list(&self) -> anyhow::Result<Vec<RoomSummary>> {
		let rows: Vec<SummaryRow> = sqlx::query_as(
			"SELECT id, name, host_name, port, created_at, last_opened_at, json_array_length(messages) \
			FROM room_snapshots ORDER BY last_opened_at DESC, id ASC",
		)
		.fetch_all(&self.pool)
		.await
		.context("list room snapshots (sqlite)")?;

		Ok(rows
			.into_iter()
			.map(|(id, name, host_name, port, created_at, last_opened_at, count)| RoomSummary {
				id,
				name,
				host_name,
				port: u16::try_from(port).unwrap_or_default(),
				created_at,
				last_opened_at,
				message_count: usize::try_from(count).unwrap_or_default(),
			})
			.collect())
	}

	async fn delete(&self, id: &str) -> anyhow::Result<bool> {
		let res = sqlx::query("DELETE FROM room_snapshots WHERE id = ?")
			.bind(id)
			.execute(&self.pool)
			.await
			.context("delete room snapshot (sqlite)")?;
		Ok(res.rows_affected() > 0)
	}

	async fn touch(&self, id: &str) -> anyhow::Result<bool> {
		let res = sqlx::query("UPDATE room_snapshots SET last_opened_at = MAX(last_opened_at, ?) WHERE id = ?")
			.bind(unix_ms_now())
			.bind(id)
			.execute(&self.pool)
			.await
			.context("touch room snapshot (sqlite)")?;
		Ok(res.rows_affected() > 0)
	}
}

/// Snapshot operations over whichever backend is configured.
#[derive(Clone)]
pub struct SnapshotStore {
	backend: Arc<dyn SnapshotBackend>,
}

impl std::fmt::Debug for SnapshotStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SnapshotStore").finish_non_exhaustive()
	}
}

impl SnapshotStore {
	pub fn new(backend: Arc<dyn SnapshotBackend>) -> Self {
		Self { backend }
	}

	pub fn in_memory() -> Self {
		Self::new(Arc::new(InMemorySnapshotBackend::default()))
	}

	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		Ok(Self::new(Arc::new(SqliteSnapshotBackend::connect(database_url).await?)))
	}

	pub async fn save(&self, id: Option<&str>, draft: SnapshotDraft) -> anyhow::Result<RoomSnapshot> {
		let snapshot = self.backend.save(id, draft).await?;
		metrics::counter!("devchat_server_snapshot_saves_total").increment(1);
		info!(
			room_id = %snapshot.id,
			room = %snapshot.name,
			messages = snapshot.history.len(),
			extensions = snapshot.extension_states.len(),
			"room snapshot saved"
		);
		Ok(snapshot)
	}

	pub async fn load(&self, id: &str) -> anyhow::Result<Option<RoomSnapshot>> {
		self.backend.load(id).await
	}

	pub async fn list(&self) -> anyhow::Result<Vec<RoomSummary>> {
		self.backend.list().await
	}

	pub async fn delete(&self, id: &str) -> anyhow::Result<bool> {
		self.backend.delete(id).await
	}

	pub async fn touch(&self, id: &str) -> anyhow::Result<bool> {
		self.backend.touch(id).await
	}
}
