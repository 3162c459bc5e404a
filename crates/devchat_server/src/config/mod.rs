#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use devchat_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::server::history::DEFAULT_HISTORY_CAPACITY;

pub const DEFAULT_ROOM_NAME: &str = "DevChat Room";
pub const DEFAULT_HOST_NICK: &str = "host";
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3000;

/// `~/.devchat`.
pub fn default_data_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".devchat"))
}

/// Default config path: `~/.devchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_data_dir()?.join("config.toml"))
}

/// Default snapshot database: `sqlite://~/.devchat/rooms.db`.
pub fn default_database_url() -> anyhow::Result<String> {
	Ok(format!("sqlite://{}", default_data_dir()?.join("rooms.db").display()))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub room: RoomSettings,
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct RoomSettings {
	pub name: String,
	pub host_nick: String,
	pub history_capacity: usize,
}

impl Default for RoomSettings {
	fn default() -> Self {
		Self {
			name: DEFAULT_ROOM_NAME.to_string(),
			host_nick: DEFAULT_HOST_NICK.to_string(),
			history_capacity: DEFAULT_HISTORY_CAPACITY,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen endpoint, `ws://host:port`.
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Upper bound on saving the final snapshot.
	pub shutdown_grace: Duration,
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
			shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
			max_frame_bytes: devchat_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// Shared secret for join tokens. Without it, tokens are ignored.
	pub hmac_secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	pub enabled: bool,
	/// `sqlite:` URL; `None` means the default database.
	pub database_url: Option<String>,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			database_url: None,
		}
	}
}

impl PersistenceSettings {
	pub fn resolved_database_url(&self) -> anyhow::Result<String> {
		match &self.database_url {
			Some(url) => Ok(url.clone()),
			None => default_database_url(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	room: FileRoomSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRoomSettings {
	name: Option<String>,
	host_nick: Option<String>,
	history_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	shutdown_grace_ms: Option<u64>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let room_defaults = RoomSettings::default();
		let server_defaults = ServerSettings::default();

		let history_capacity = match file.room.history_capacity {
			Some(0) => {
				warn!("room config: history_capacity must be positive; using default");
				room_defaults.history_capacity
			}
			Some(n) => n,
			None => room_defaults.history_capacity,
		};

		Self {
			room: RoomSettings {
				name: non_blank(file.room.name).unwrap_or(room_defaults.name),
				host_nick: non_blank(file.room.host_nick).unwrap_or(room_defaults.host_nick),
				history_capacity,
			},
			server: ServerSettings {
				bind: non_blank(file.server.bind).unwrap_or(server_defaults.bind),
				metrics_bind: non_blank(file.server.metrics_bind),
				shutdown_grace: file
					.server
					.shutdown_grace_ms
					.map(Duration::from_millis)
					.unwrap_or(server_defaults.shutdown_grace),
				max_frame_bytes: file
					.server
					.max_frame_bytes
					.filter(|n| *n > 0)
					.unwrap_or(server_defaults.max_frame_bytes),
			},
			auth: AuthSettings {
				hmac_secret: non_blank(file.auth.hmac_secret).map(SecretString::new),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(true),
				database_url: non_blank(file.persistence.database_url),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("DEVCHAT_ROOM_NAME") {
		cfg.room.name = v;
		info!("room config: name overridden by env");
	}

	if let Some(v) = var("DEVCHAT_HOST_NICK") {
		cfg.room.host_nick = v;
		info!("room config: host_nick overridden by env");
	}

	if let Some(v) = var("DEVCHAT_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
		&& capacity > 0
	{
		cfg.room.history_capacity = capacity;
		info!(capacity, "room config: history_capacity overridden by env");
	}

	if let Some(v) = var("DEVCHAT_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = var("DEVCHAT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("DEVCHAT_SHUTDOWN_GRACE_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.shutdown_grace = Duration::from_millis(ms);
		info!(ms, "server config: shutdown_grace overridden by env");
	}

	if let Some(v) = var("DEVCHAT_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(v) = var("DEVCHAT_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = var("DEVCHAT_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}
}
