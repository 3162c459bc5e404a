#![forbid(unsafe_code)]

use std::time::Duration;

use devchat_client_core::view::{DEFAULT_REVEAL_EXPIRY, ViewMode, spawn_view_toggle};
use devchat_client_core::{ClientConfig, DEFAULT_SERVER_ENDPOINT_WS, Session};
use devchat_protocol::Envelope;
use tokio::io::AsyncBufReadExt as _;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: devchat_client [--connect ws://host:port | --invite CODE] --nick NICK [--token TOKEN] [--disguise]\n\
\n\
Options:\n\
	--connect   Room endpoint (alias: --endpoint) (default: {DEFAULT_SERVER_ENDPOINT_WS})\n\
	--invite    Invite code printed by the host (overrides --connect)\n\
	--nick      Display name to request\n\
	--token     Identity token (default: $DEVCHAT_CLIENT_TOKEN)\n\
	--disguise  Hide the room until the reveal key (an empty line) is pressed\n\
	--reveal-ms Reveal window in milliseconds (default: 200)\n\
	--help      Show this help\n\
\n\
Notes:\n\
	Every other stdin line is sent as chat; lines starting with / run room commands.\n\
\n\
Examples:\n\
	devchat_client --connect ws://127.0.0.1:8080 --nick Bob\n\
	devchat_client --invite eyJob3N0Ijo... --nick Bob --disguise\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,devchat_client_core=info".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

struct Args {
	cfg: ClientConfig,
	disguise: bool,
	reveal: Duration,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT_WS.to_string();
	let mut invite: Option<String> = None;
	let mut nick: Option<String> = None;
	let mut token: Option<String> = std::env::var("DEVCHAT_CLIENT_TOKEN").ok().and_then(|v| {
		let v = v.trim().to_string();
		(!v.is_empty()).then_some(v)
	});
	let mut disguise = false;
	let mut reveal = DEFAULT_REVEAL_EXPIRY;

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
			"--connect" | "--endpoint" => endpoint = value("--connect"),
			"--invite" => invite = Some(value("--invite")),
			"--nick" => nick = Some(value("--nick")),
			"--token" => token = Some(value("--token")),
			"--disguise" => disguise = true,
			"--reveal-ms" => {
				let v = value("--reveal-ms");
				let ms: u64 = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --reveal-ms value: {v}");
					usage_and_exit()
				});
				reveal = Duration::from_millis(ms.max(1));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let nick = nick.unwrap_or_else(|| {
		eprintln!("--nick is required");
		usage_and_exit()
	});

	let cfg = match &invite {
		Some(code) => ClientConfig::from_invite(code, nick),
		None => ClientConfig::from_ws_endpoint(&endpoint, nick),
	};
	let mut cfg = cfg.unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit()
	});
	cfg.token = token;

	Args { cfg, disguise, reveal }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let session = Session::connect(args.cfg).await?;
	let (mut sender, mut events, joined) = session.split();
	println!("{}", joined.welcome);
	if let Some(user) = &joined.auth {
		info!(user_id = %user.id, "authenticated");
	}

	let (env_tx, mut env_rx) = mpsc::unbounded_channel::<Envelope>();
	tokio::spawn(async move {
		loop {
			match events.next_envelope().await {
				Ok(Some(env)) => {
					if env_tx.send(env).is_err() {
						break;
					}
				}
				Ok(None) => break,
				Err(e) => {
					warn!(error = %e, "dropping unreadable envelope");
				}
			}
		}
	});

	let (toggle, mut mode) = spawn_view_toggle(args.reveal);
	let mut held: Vec<Envelope> = Vec::new();
	let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

	if args.disguise {
		println!("(disguised: press Enter to peek)");
	}

	loop {
		tokio::select! {
			env = env_rx.recv() => {
				let Some(env) = env else {
					println!("* disconnected");
					break;
				};
				if args.disguise && *mode.borrow() == ViewMode::Hidden {
					held.push(env);
				} else {
					println!("{env}");
				}
			}
			changed = mode.changed(), if args.disguise => {
				if changed.is_err() {
					break;
				}
				if *mode.borrow_and_update() == ViewMode::Revealed {
					for env in held.drain(..) {
						println!("{env}");
					}
				}
			}
			line = lines.next_line() => {
				match line {
					Ok(Some(line)) if line.trim().is_empty() => {
						if args.disguise {
							toggle.press();
						}
					}
					Ok(Some(line)) => {
						if let Err(e) = sender.send_chat(line).await {
							warn!(error = %e, "send failed");
							break;
						}
					}
					Ok(None) => break,
					Err(e) => {
						warn!(error = %e, "stdin read failed");
						break;
					}
				}
			}
		}
	}

	let _ = sender.close().await;
	// The stdin reader sits on a blocking thread that would hold the runtime open.
	std::process::exit(0)
}
