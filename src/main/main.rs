mod args;
mod logging;
mod registration;

use std::{path::PathBuf, sync::Arc};

use asmux_core::{Config, Result, Server, debug, info};
use asmux_service::Services;
use clap::Parser;

fn main() -> Result {
	let args = args::Args::parse();
	let config = Config::load(args.config.iter().map(PathBuf::as_path))?;

	if args.generate_registration {
		return registration::generate(&config, &args.registration);
	}

	config.check()?;
	logging::init(&config)?;

	let runtime = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.thread_name("asmux:worker")
		.build()?;

	let server = Arc::new(Server::new(config, Some(runtime.handle().clone())));
	runtime.block_on(run(server))?;

	debug!("Exit");
	Ok(())
}

async fn run(server: Arc<Server>) -> Result {
	info!("asmux {} starting up", env!("CARGO_PKG_VERSION"));

	let services = Services::build(server.clone()).await?;
	services.start().await?;

	let signal_server = server.clone();
	tokio::spawn(async move {
		wait_for_signal().await;
		info!("Shutdown signal received");
		signal_server.shutdown().ok();
	});

	asmux_router::serve(&services).await?;
	services.stop().await;

	Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler installs");
	tokio::select! {
		_ = tokio::signal::ctrl_c() => {},
		_ = terminate.recv() => {},
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() { tokio::signal::ctrl_c().await.ok(); }
