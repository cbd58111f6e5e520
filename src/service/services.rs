use std::sync::{Arc, Mutex};

use asmux_core::{Result, Server, debug, info};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio::task::JoinSet;

use crate::{
	Args, OnceServices, Service, client, directory, queue, replication, routing, sending,
	status, syncproxy, wakeup, websocket,
};

/// The service registry: one instance of every service, plus the shared
/// store handles they were built around.
pub struct Services {
	pub server: Arc<Server>,
	pub db: PgPool,

	pub client: Arc<client::Service>,
	pub directory: Arc<directory::Service>,
	pub queue: Arc<queue::Service>,
	pub replication: Arc<replication::Service>,
	pub routing: Arc<routing::Service>,
	pub sending: Arc<sending::Service>,
	pub status: Arc<status::Service>,
	pub syncproxy: Arc<syncproxy::Service>,
	pub wakeup: Arc<wakeup::Service>,
	pub websocket: Arc<websocket::Service>,

	service: Vec<Arc<dyn Service>>,
	workers: Mutex<Option<JoinSet<Result>>>,
}

impl Services {
	pub async fn build(server: Arc<Server>) -> Result<Arc<Self>> {
		let db = PgPoolOptions::new()
			.max_connections(8)
			.connect_lazy(&server.config.database)?;

		let redis = redis::Client::open(server.config.redis.as_str())?;
		let redis_conn = redis.get_connection_manager().await?;
		let services = Arc::new(OnceServices::default());

		macro_rules! build {
			($module:ident) => {{
				let args = Args {
					server: &server,
					db: &db,
					redis: &redis,
					redis_conn: &redis_conn,
					services: &services,
				};

				let built = $module::Service::build(&args)?;
				assert!(
					services.$module.set(built.clone()).is_ok(),
					"service built more than once"
				);

				built
			}};
		}

		let client = build!(client);
		let directory = build!(directory);
		let status = build!(status);
		let syncproxy = build!(syncproxy);
		let queue = build!(queue);
		let wakeup = build!(wakeup);
		let websocket = build!(websocket);
		let sending = build!(sending);
		let routing = build!(routing);
		let replication = build!(replication);

		let service: Vec<Arc<dyn Service>> = vec![
			client.clone(),
			directory.clone(),
			status.clone(),
			syncproxy.clone(),
			queue.clone(),
			wakeup.clone(),
			websocket.clone(),
			sending.clone(),
			routing.clone(),
			replication.clone(),
		];

		Ok(Arc::new(Self {
			server,
			db,
			client,
			directory,
			queue,
			replication,
			routing,
			sending,
			status,
			syncproxy,
			wakeup,
			websocket,
			service,
			workers: Mutex::new(None),
		}))
	}

	pub async fn start(self: &Arc<Self>) -> Result {
		debug!("Starting services...");

		let mut workers = JoinSet::new();
		for service in &self.service {
			let service = service.clone();
			workers.spawn_on(service.worker(), self.server.runtime());
		}

		self.workers
			.lock()
			.expect("locked for worker spawn")
			.replace(workers);

		info!("Services startup complete.");
		Ok(())
	}

	pub async fn stop(&self) {
		info!("Shutting down services...");

		for service in &self.service {
			service.interrupt().await;
		}

		self.websocket.close_all().await;

		let workers = self
			.workers
			.lock()
			.expect("locked for worker join")
			.take();
		if let Some(mut workers) = workers {
			while let Some(result) = workers.join_next().await {
				if let Ok(Err(e)) = result {
					debug!("worker finished with error: {e}");
				}
			}
		}

		info!("Services shutdown complete.");
	}
}
