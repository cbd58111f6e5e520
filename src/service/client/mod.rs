use std::{sync::Arc, time::Duration};

use asmux_core::Result;

use crate::service;

/// One place to build the outbound HTTP clients so each delivery concern
/// gets its own connection pool and timeout policy.
pub struct Service {
	/// Transaction delivery to push-mode appservices. No total timeout;
	/// the retry loop owns pacing.
	pub appservice: reqwest::Client,

	/// Bridge state and checkpoint posts.
	pub status: reqwest::Client,

	/// HTTP pings to push-mode appservices.
	pub ping: reqwest::Client,

	/// Sync proxy RPC; deliberately has no timeout.
	pub syncproxy: reqwest::Client,

	/// Wakeup push notifications.
	pub push: reqwest::Client,
}

const PING_TIMEOUT: Duration = Duration::from_secs(45);
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

impl crate::Service for Service {
	fn build(_args: &crate::Args<'_>) -> Result<Arc<Self>> {
		let base = || {
			reqwest::Client::builder()
				.user_agent(concat!("asmux/", env!("CARGO_PKG_VERSION")))
				.connect_timeout(Duration::from_secs(10))
		};

		Ok(Arc::new(Self {
			appservice: base().build()?,
			status: base().timeout(STATUS_TIMEOUT).build()?,
			ping: base().timeout(PING_TIMEOUT).build()?,
			syncproxy: base().build()?,
			push: base().timeout(PUSH_TIMEOUT).build()?,
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}
