use std::{net::SocketAddr, sync::Arc, time::Duration};

use asmux_core::{Result, debug, info};
use asmux_service::Services;
use axum::Router;
use axum_server::{Handle as ServerHandle, bind};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub(super) async fn serve(
	services: &Arc<Services>,
	router: Router,
	addr: SocketAddr,
) -> Result {
	let handle = ServerHandle::new();

	let server = services.server.clone();
	let watcher = handle.clone();
	services.server.runtime().spawn(async move {
		server.until_shutdown().await;
		debug!("Signaling graceful shutdown to the listener");
		watcher.graceful_shutdown(Some(SHUTDOWN_GRACE));
	});

	info!("Listening on {addr}");
	bind(addr)
		.handle(handle)
		.serve(router.into_make_service())
		.await?;

	info!("Stopped listening on {addr}");
	Ok(())
}
