use std::sync::Arc;

use asmux_core::{Result, Server};
use async_trait::async_trait;
use sqlx::PgPool;

use crate::OnceServices;

/// Inputs to a service's constructor.
pub(crate) struct Args<'a> {
	pub(crate) server: &'a Arc<Server>,
	pub(crate) db: &'a PgPool,
	pub(crate) redis: &'a redis::Client,
	pub(crate) redis_conn: &'a redis::aio::ConnectionManager,
	pub(crate) services: &'a Arc<OnceServices>,
}

#[async_trait]
pub(crate) trait Service: Send + Sync {
	/// Implement the construction of the service instance.
	fn build(args: &Args<'_>) -> Result<Arc<Self>>
	where
		Self: Sized;

	/// Implement the service's worker loop. Spawned at startup for
	/// services with background work; the default does nothing.
	async fn worker(self: Arc<Self>) -> Result { Ok(()) }

	/// Signal the worker to shut down.
	async fn interrupt(&self) {}

	/// Name of the service for logging.
	fn name(&self) -> &str;
}

pub(crate) fn make_name(module_path: &str) -> &str {
	module_path
		.rsplit("::")
		.next()
		.expect("module path has at least one segment")
}
