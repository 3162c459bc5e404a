#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use devchat_protocol::Envelope;
use devchat_server::builtin::default_extensions;
use devchat_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use devchat_server::server::connection::ConnectionSettings;
use devchat_server::server::identity::{HmacIdentityVerifier, IdentityVerifier};
use devchat_server::server::listener::accept_loop;
use devchat_server::server::router::RouterHandle;
use devchat_server::server::shutdown::{save_on_shutdown, wait_for_signal};
use devchat_server::server::snapshot::SnapshotStore;
use devchat_server::server::startup::{RoomSeed, prepare_room};
use devchat_util::endpoint::WsEndpoint;
use devchat_util::invite::Invite;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: devchat_server [--config PATH] [--bind ws://host:port] [--name NAME] [--nick NICK] [--resume ID]\n\
\x20      devchat_server rooms [list | info <id> | delete <id> | path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.devchat/config.toml)\n\
\t--bind    Listen endpoint (default: ws://127.0.0.1:8080)\n\
\t--name    Room name\n\
\t--nick    Host display name\n\
\t--resume  Reopen a saved room by id\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct ServeArgs {
	bind: Option<String>,
	name: Option<String>,
	nick: Option<String>,
	resume: Option<String>,
}

#[derive(Debug)]
enum RoomsAction {
	List,
	Info(String),
	Delete(String),
	Path,
}

#[derive(Debug)]
enum Command {
	Serve(ServeArgs),
	Rooms(RoomsAction),
}

fn parse_args() -> (Option<PathBuf>, Command) {
	let mut config_path = None;
	let mut serve = ServeArgs::default();
	let mut positional = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = |flag: &str| {
			let v = it.next().unwrap_or_else(|| usage_and_exit());
			if v.trim().is_empty() {
				eprintln!("{flag} must be non-empty");
				usage_and_exit();
			}
			v
		};
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" => config_path = Some(PathBuf::from(value("--config"))),
			"--bind" | "--listen" => serve.bind = Some(value("--bind")),
			"--name" => serve.name = Some(value("--name")),
			"--nick" => serve.nick = Some(value("--nick")),
			"--resume" => serve.resume = Some(value("--resume")),
			other if other.starts_with('-') => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
			other => positional.push(other.to_string()),
		}
	}

	let command = match positional.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
		[] => Command::Serve(serve),
		["rooms"] | ["rooms", "list"] => Command::Rooms(RoomsAction::List),
		["rooms", "info", id] => Command::Rooms(RoomsAction::Info(id.to_string())),
		["rooms", "delete", id] => Command::Rooms(RoomsAction::Delete(id.to_string())),
		["rooms", "path"] => Command::Rooms(RoomsAction::Path),
		other => {
			eprintln!("Unknown command: {}", other.join(" "));
			usage_and_exit();
		}
	};

	(config_path, command)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,devchat_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	// stdout carries the room transcript; logs go to stderr.
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("devchat_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn format_age(at_ms: i64) -> String {
	let secs = (devchat_util::time::unix_ms_now() - at_ms).max(0) / 1000;
	match secs {
		0..60 => format!("{secs}s ago"),
		60..3600 => format!("{}m ago", secs / 60),
		3600..86_400 => format!("{}h ago", secs / 3600),
		_ => format!("{}d ago", secs / 86_400),
	}
}

async fn run_rooms(cfg: &ServerConfig, action: RoomsAction) -> anyhow::Result<()> {
	let database_url = cfg.persistence.resolved_database_url()?;
	if let RoomsAction::Path = action {
		println!("{database_url}");
		return Ok(());
	}

	let store = SnapshotStore::connect(&database_url).await?;
	match action {
		RoomsAction::List => {
			let rooms = store.list().await?;
			if rooms.is_empty() {
				println!("No saved rooms.");
			}
			for r in rooms {
				println!(
					"{}  {}  host={}  port={}  messages={}  last opened {}",
					r.id,
					r.name,
					r.host_name,
					r.port,
					r.message_count,
					format_age(r.last_opened_at)
				);
			}
		}
		RoomsAction::Info(id) => {
			let snapshot = store.load(&id).await?.ok_or_else(|| anyhow!("no saved room with id {id}"))?;
			println!("id:           {}", snapshot.id);
			println!("name:         {}", snapshot.name);
			println!("host:         {}", snapshot.host_name);
			println!("port:         {}", snapshot.port);
			println!("created:      {}", format_age(snapshot.created_at));
			println!("last opened:  {}", format_age(snapshot.last_opened_at));
			println!("messages:     {}", snapshot.history.len());
			let names = snapshot.extension_states.keys().cloned().collect::<Vec<_>>();
			println!("extensions:   {}", if names.is_empty() { "-".to_string() } else { names.join(", ") });
		}
		RoomsAction::Delete(id) => {
			if store.delete(&id).await? {
				println!("Deleted room {id}.");
			} else {
				return Err(anyhow!("no saved room with id {id}"));
			}
		}
		RoomsAction::Path => {}
	}
	Ok(())
}

async fn serve(cfg: ServerConfig, args: ServeArgs) -> anyhow::Result<()> {
	init_metrics(cfg.server.metrics_bind.as_deref());

	let bind = WsEndpoint::parse(args.bind.as_deref().unwrap_or(&cfg.server.bind)).map_err(|e| anyhow!(e))?;

	let store = if cfg.persistence.enabled {
		let database_url = cfg.persistence.resolved_database_url()?;
		Some(SnapshotStore::connect(&database_url).await?)
	} else {
		info!("persistence disabled; room will not be saved");
		None
	};

	let seed = RoomSeed {
		name: args.name.unwrap_or_else(|| cfg.room.name.clone()),
		host_nick: args.nick.unwrap_or_else(|| cfg.room.host_nick.clone()),
		history_capacity: cfg.room.history_capacity,
	};
	let extensions = default_extensions().context("register builtin extensions")?;
	let prepared = prepare_room(seed, extensions, store.as_ref(), args.resume.as_deref()).await?;
	let snapshot_id = prepared.snapshot_id;

	let (host_tx, mut host_rx) = mpsc::unbounded_channel::<Envelope>();
	let server = prepared.server.with_host_observer(host_tx);
	let room_name = server.room().name().to_string();
	let (router, _router_task) = RouterHandle::spawn(server);

	tokio::spawn(async move {
		while let Some(env) = host_rx.recv().await {
			println!("{env}");
		}
	});

	let console = router.clone();
	tokio::spawn(async move {
		let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
		loop {
			match lines.next_line().await {
				Ok(Some(line)) => {
					if !console.host_input(line) {
						break;
					}
				}
				Ok(None) => break,
				Err(e) => {
					warn!(error = %e, "host console read failed");
					break;
				}
			}
		}
	});

	let listener = TcpListener::bind(bind.hostport())
		.await
		.with_context(|| format!("bind {}", bind.url()))?;
	let local = listener.local_addr().context("listener local address")?;
	let invite = Invite {
		host: bind.host.clone(),
		port: local.port(),
		room_name: Some(room_name.clone()),
	};
	info!(room = %room_name, bind = %local, invite = %invite.encode(), "devchat_server: listening");

	let verifier = cfg
		.auth
		.hmac_secret
		.clone()
		.map(|secret| Arc::new(HmacIdentityVerifier::new(secret)) as Arc<dyn IdentityVerifier>);
	let settings = ConnectionSettings {
		max_frame_bytes: cfg.server.max_frame_bytes,
		..ConnectionSettings::default()
	};

	tokio::select! {
		res = accept_loop(listener, router.clone(), verifier, settings) => res?,
		sig = wait_for_signal() => {
			sig?;
		}
	}

	match &store {
		Some(store) => {
			save_on_shutdown(&router, store, snapshot_id.as_deref(), local.port(), cfg.server.shutdown_grace).await;
		}
		None => {
			let _ = tokio::time::timeout(cfg.server.shutdown_grace, router.shutdown()).await;
		}
	}

	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let (config_path, command) = parse_args();
	let config_path = match config_path {
		Some(p) => p,
		None => default_config_path()?,
	};
	let cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	match command {
		Command::Rooms(action) => run_rooms(&cfg, action).await,
		Command::Serve(args) => {
			let res = serve(cfg, args).await;
			if let Err(e) = &res {
				tracing::error!(error = %format!("{e:#}"), "devchat_server: fatal");
				std::process::exit(1);
			}
			// The stdin reader sits on a blocking thread that would hold the runtime open.
			std::process::exit(0)
		}
	}
}
