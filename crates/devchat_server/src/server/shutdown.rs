#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::{error, info};

use crate::server::router::RouterHandle;
use crate::server::snapshot::{RoomSnapshot, SnapshotDraft, SnapshotStore};

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere). Returns the signal name.
pub async fn wait_for_signal() -> anyhow::Result<&'static str> {
	let name = recv_signal().await?;
	info!(signal = name, "shutdown signal received");
	Ok(name)
}

#[cfg(unix)]
async fn recv_signal() -> anyhow::Result<&'static str> {
	use tokio::signal::unix::{SignalKind, signal};

	let mut sigint = signal(SignalKind::interrupt())?;
	let mut sigterm = signal(SignalKind::terminate())?;

	Ok(tokio::select! {
		_ = sigint.recv() => "SIGINT",
		_ = sigterm.recv() => "SIGTERM",
	})
}

#[cfg(not(unix))]
async fn recv_signal() -> anyhow::Result<&'static str> {
	tokio::signal::ctrl_c().await?;
	Ok("ctrl-c")
}

/// Stop the router and persist its final state within `grace`.
///
/// Failures are logged and reported as `None`; the caller exits either way.
pub async fn save_on_shutdown(
	router: &RouterHandle,
	store: &SnapshotStore,
	snapshot_id: Option<&str>,
	port: u16,
	grace: Duration,
) -> Option<RoomSnapshot> {
	let work = async {
		let capture = router.shutdown().await?;
		store
			.save(
				snapshot_id,
				SnapshotDraft {
					name: capture.room_name,
					host_name: capture.host_name,
					port,
					history: capture.history,
					extension_states: capture.extension_states,
				},
			)
			.await
	};

	match tokio::time::timeout(grace, work).await {
		Ok(Ok(snapshot)) => {
			info!(room_id = %snapshot.id, "resume later with --resume {}", snapshot.id);
			Some(snapshot)
		}
		Ok(Err(e)) => {
			error!(error = %e, "failed to save room snapshot");
			None
		}
		Err(_) => {
			error!(grace_ms = grace.as_millis() as u64, "room snapshot save timed out");
			None
		}
	}
}
