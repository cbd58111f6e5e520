use std::sync::{Arc, OnceLock};

use crate::{
	client, directory, queue, replication, routing, sending, status, syncproxy, wakeup,
	websocket,
};

/// Deferred cross-service references. Services are constructed one by one
/// but freely reference each other at runtime; each slot is filled as its
/// service is built and must not be read before `Services::build` returns.
#[derive(Default)]
pub(crate) struct OnceServices {
	pub(crate) client: OnceLock<Arc<client::Service>>,
	pub(crate) directory: OnceLock<Arc<directory::Service>>,
	pub(crate) queue: OnceLock<Arc<queue::Service>>,
	pub(crate) replication: OnceLock<Arc<replication::Service>>,
	pub(crate) routing: OnceLock<Arc<routing::Service>>,
	pub(crate) sending: OnceLock<Arc<sending::Service>>,
	pub(crate) status: OnceLock<Arc<status::Service>>,
	pub(crate) syncproxy: OnceLock<Arc<syncproxy::Service>>,
	pub(crate) wakeup: OnceLock<Arc<wakeup::Service>>,
	pub(crate) websocket: OnceLock<Arc<websocket::Service>>,
}

macro_rules! accessor {
	($name:ident) => {
		pub(crate) fn $name(&self) -> &Arc<$name::Service> {
			self.$name
				.get()
				.expect("service initialized before use")
		}
	};
}

impl OnceServices {
	accessor!(client);

	accessor!(directory);

	accessor!(queue);

	accessor!(replication);

	accessor!(routing);

	accessor!(sending);

	accessor!(status);

	accessor!(syncproxy);

	accessor!(wakeup);

	accessor!(websocket);
}
