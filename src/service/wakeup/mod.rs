use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use asmux_core::{Result, Server, debug, warn};
use serde_json::json;
use uuid::Uuid;

use crate::{directory::Appservice, service};

/// Successive pushes for one appservice are at least this far apart.
pub const MIN_WAKEUP_PUSH_DELAY: Duration = Duration::from_secs(3);

/// An open websocket only permits a wakeup once it has been silent this
/// long.
const WS_IDLE_BEFORE_WAKEUP: Duration = Duration::from_secs(30);

/// Wakes dormant bridge clients with an out-of-band push notification so
/// they reconnect their websocket.
pub struct Service {
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
	debounce: Debounce,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			server: args.server.clone(),
			services: args.services.clone(),
			debounce: Debounce::default(),
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	/// Pushes a wakeup notification if every gate passes; returns whether
	/// a push was sent.
	#[tracing::instrument(level = "debug", skip_all, fields(appservice = %appservice.name()))]
	pub async fn wakeup(&self, appservice: &Arc<Appservice>, only_if_ws_timeout: bool) -> bool {
		let Some(push_key) = appservice.push_key() else {
			return false;
		};

		let websocket = self
			.services
			.websocket()
			.connection_state(appservice.id);
		if !permits(websocket, only_if_ws_timeout) {
			return false;
		}

		// a backlog of nothing but ephemeral events is not worth waking
		// anyone up for
		let queue = self.services.queue().open(appservice);
		match queue.contains_pdus().await {
			| Ok(true) => {},
			| Ok(false) => return false,
			| Err(e) => {
				warn!("Failed to check queue before wakeup: {e}");
				return false;
			},
		}

		if !self
			.debounce
			.try_acquire(appservice.id, MIN_WAKEUP_PUSH_DELAY)
		{
			return false;
		}

		self.push(appservice, push_key).await
	}

	async fn push(&self, appservice: &Appservice, push_key: &crate::directory::PushKey) -> bool {
		debug!("Sending wakeup push for {}", appservice.name());

		let body = json!({
			"notification": {
				"app_id": push_key.app_id,
				"pushkey": push_key.pushkey,
				"counts": { "unread": 1 },
				"data": push_key.data,
			},
		});

		let result = self
			.services
			.client()
			.push
			.post(&push_key.url)
			.json(&body)
			.send()
			.await;

		match result {
			| Ok(response) if response.status().is_success() => {
				self.server.metrics.wakeup_pushes.inc();
				true
			},
			| Ok(response) => {
				warn!(
					"Wakeup push for {} returned HTTP {}",
					appservice.name(),
					response.status(),
				);

				false
			},
			| Err(e) => {
				warn!("Wakeup push for {} failed: {e}", appservice.name());
				false
			},
		}
	}
}

/// Observed state of an open websocket, as far as the wakeup gate cares.
#[derive(Clone, Copy, Debug)]
pub struct WebsocketState {
	pub timeouts: u32,
	pub idle: Duration,
}

/// Gate (b): with a socket open, only wake when the socket has already
/// timed out (if required) and has been idle a while; without one, always
/// permitted.
fn permits(websocket: Option<WebsocketState>, only_if_ws_timeout: bool) -> bool {
	match websocket {
		| None => true,
		| Some(state) => {
			if only_if_ws_timeout && state.timeouts == 0 {
				return false;
			}

			state.idle >= WS_IDLE_BEFORE_WAKEUP
		},
	}
}

/// Gate (c): check-and-set of the last wakeup time, atomic per appservice.
#[derive(Default)]
struct Debounce {
	last: Mutex<HashMap<Uuid, Instant>>,
}

impl Debounce {
	fn try_acquire(&self, id: Uuid, min_delay: Duration) -> bool {
		let mut last = self.last.lock().expect("wakeup debounce lock poisoned");
		if let Some(previous) = last.get(&id) {
			if previous.elapsed() < min_delay {
				return false;
			}
		}

		last.insert(id, Instant::now());
		true
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use uuid::Uuid;

	use super::{Debounce, WebsocketState, permits};

	#[test]
	fn no_socket_permits_wakeup() {
		assert!(permits(None, false));
		assert!(permits(None, true));
	}

	#[test]
	fn idle_socket_without_timeouts_blocks_when_required() {
		let state = WebsocketState { timeouts: 0, idle: Duration::from_secs(60) };
		assert!(!permits(Some(state), true));
		assert!(permits(Some(state), false));
	}

	#[test]
	fn busy_socket_blocks_wakeup() {
		let state = WebsocketState { timeouts: 3, idle: Duration::from_secs(1) };
		assert!(!permits(Some(state), true));
	}

	#[test]
	fn timed_out_idle_socket_permits_wakeup() {
		let state = WebsocketState { timeouts: 1, idle: Duration::from_secs(31) };
		assert!(permits(Some(state), true));
	}

	#[test]
	fn debounce_allows_one_push_per_window() {
		let debounce = Debounce::default();
		let id = Uuid::new_v4();

		assert!(debounce.try_acquire(id, Duration::from_secs(3)));
		assert!(!debounce.try_acquire(id, Duration::from_secs(3)));
		assert!(debounce.try_acquire(Uuid::new_v4(), Duration::from_secs(3)));
	}

	#[test]
	fn debounce_reopens_after_the_window() {
		let debounce = Debounce::default();
		let id = Uuid::new_v4();

		assert!(debounce.try_acquire(id, Duration::ZERO));
		assert!(debounce.try_acquire(id, Duration::ZERO));
	}
}
