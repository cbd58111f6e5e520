mod http;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use asmux_core::{Events, Result, Server, debug, error, warn};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::{directory::Appservice, service, status::BridgeState};

pub use self::http::{next_backoff, retry_budget};

/// Entry point for delivering one envelope to one appservice, over
/// whichever transport it is configured for.
pub struct Service {
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,

	// serializes deliveries per appservice so racing inbound transactions
	// keep their metrics and delivery order coherent
	locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			server: args.server.clone(),
			services: args.services.clone(),
			locks: Mutex::new(HashMap::new()),
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	/// Delivers the envelope, returning whether delivery (or, for
	/// pull-mode appservices, queueing plus acknowledgement) succeeded.
	/// Failures are recorded in metrics and never propagate.
	#[tracing::instrument(
		level = "debug",
		skip_all,
		fields(appservice = %appservice.name(), txn_id = %events.txn_id),
	)]
	pub async fn post_events(&self, appservice: &Arc<Appservice>, events: Events) -> bool {
		let lock = self.lock_for(appservice.id);
		let _guard = lock.lock().await;

		let metrics = &self.server.metrics;
		for event_type in &events.types {
			metrics
				.accepted_events
				.with_label_values(&[
					appservice.owner.as_str(),
					appservice.prefix.as_str(),
					event_type.as_str(),
				])
				.inc();
		}

		let mut gave_up = None;
		let ok = if !appservice.push {
			match self
				.services
				.websocket()
				.post_events(appservice, &events)
				.await
			{
				| Ok(ok) => ok,
				| Err(e) => {
					error!(
						"Fatal error sending transaction {} to {}: {e}",
						events.txn_id,
						appservice.name(),
					);

					false
				},
			}
		} else if !appservice.address.is_empty() {
			let status = self.post_transaction(appservice, &events).await;
			if status != "ok" {
				gave_up = Some(status);
			}

			status == "ok"
		} else {
			warn!(
				"Not sending transaction {} to {}: no address configured",
				events.txn_id,
				appservice.name(),
			);

			false
		};

		if ok {
			debug!("Successfully sent {} to {}", events.txn_id, appservice.name());
		}

		// failed HTTP deliveries surface as a bridge state update too
		if let Some(error) = gave_up {
			let services = self.services.clone();
			let az = appservice.clone();
			tokio::spawn(async move {
				let state = BridgeState::unreachable(error);
				services.status().send_bridge_status(&az, &state).await;
			});
		}

		// websocket deliveries are counted by the queue consumer when the
		// frame is actually acknowledged
		if appservice.push {
			let metric = if ok { &metrics.successful_events } else { &metrics.failed_events };
			for event_type in &events.types {
				metric
					.with_label_values(&[
						appservice.owner.as_str(),
						appservice.prefix.as_str(),
						event_type.as_str(),
					])
					.inc();
			}
		}

		ok
	}

	fn lock_for(&self, id: Uuid) -> Arc<AsyncMutex<()>> {
		self.locks
			.lock()
			.expect("appservice lock table poisoned")
			.entry(id)
			.or_default()
			.clone()
	}
}
