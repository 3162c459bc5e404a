#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::identity::IdentityVerifier;
use crate::server::router::RouterHandle;

/// Accept connections forever, one task per connection.
pub async fn accept_loop(
	listener: TcpListener,
	router: RouterHandle,
	verifier: Option<Arc<dyn IdentityVerifier>>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let mut next_conn_id: u64 = 1;

	loop {
		let (stream, remote) = match listener.accept().await {
			Ok(accepted) => accepted,
			Err(e) => {
				warn!(error = %e, "accept failed");
				tokio::time::sleep(Duration::from_millis(50)).await;
				continue;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("devchat_server_connections_total").increment(1);
		debug!(conn_id, %remote, "accepted tcp connection");

		let router = router.clone();
		let verifier = verifier.clone();
		let settings = settings.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(conn_id, stream, remote, router, verifier, settings).await {
				debug!(conn_id, error = %e, "connection ended with error");
			}
		});
	}
}
