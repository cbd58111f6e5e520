use std::{collections::BTreeMap, sync::Arc};

use asmux_core::{
	Events, Result, Server, debug,
	matrix::{DeviceLists, ghost},
};
use ruma::{OwnedUserId, RoomId};
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{directory::Room, service};

/// Splits one inbound homeserver transaction into per-owner
/// sub-transactions and hands them to sending.
pub struct Service {
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			server: args.server.clone(),
			services: args.services.clone(),
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	/// Routes a transaction. Every owner's sub-transaction is dispatched;
	/// only ids in `synchronous_to` are awaited, and the returned map
	/// covers exactly those.
	#[tracing::instrument(level = "debug", skip_all, fields(%txn_id))]
	pub async fn handle_transaction(
		&self,
		txn_id: &str,
		events: Vec<Value>,
		ephemeral: Vec<Value>,
		otk_counts: BTreeMap<OwnedUserId, Value>,
		_device_lists: DeviceLists,
		synchronous_to: Vec<String>,
	) -> Result<BTreeMap<String, bool>> {
		debug!(
			"Received transaction {txn_id} with {} PDUs and {} EDUs",
			events.len(),
			ephemeral.len(),
		);

		let mut output: BTreeMap<Uuid, Events> = BTreeMap::new();

		self.collect_events(txn_id, &mut output, events, false)
			.await?;
		self.collect_events(txn_id, &mut output, ephemeral, true)
			.await?;
		self.collect_otk_counts(txn_id, &mut output, otk_counts)
			.await?;
		// TODO: fan device list changes out to every appservice bridging
		// the affected users

		self.send_transactions(output, &synchronous_to).await
	}

	async fn collect_events(
		&self,
		txn_id: &str,
		output: &mut BTreeMap<Uuid, Events>,
		events: Vec<Value>,
		ephemeral: bool,
	) -> Result {
		let metrics = &self.server.metrics;
		for event in events {
			let event_type = event
				.get("type")
				.and_then(Value::as_str)
				.unwrap_or("")
				.to_owned();
			metrics
				.received_events
				.with_label_values(&[event_type.as_str()])
				.inc();

			let Some(room_id) = event
				.get("room_id")
				.and_then(Value::as_str)
				.and_then(|raw| RoomId::parse(raw).ok())
			else {
				continue;
			};

			let mut room = self.services.directory().get_room(&room_id).await?;
			if room.is_none() && !ephemeral {
				room = self.register_room(&event, &room_id).await?;
			}

			let Some(room) = room else {
				debug!("No target found for event in {room_id}");
				metrics
					.dropped_events
					.with_label_values(&[event_type.as_str()])
					.inc();
				continue;
			};

			let bucket = output
				.entry(room.owner)
				.or_insert_with(|| Events::new(txn_id));
			if ephemeral {
				bucket.edu.push(event);
			} else {
				bucket.pdu.push(event);
			}

			bucket.types.push(event_type);
		}

		Ok(())
	}

	/// Lazily maps a room to an appservice the first time a membership
	/// event for one of its ghosts shows up. Anything malformed drops the
	/// event silently instead of failing the transaction.
	async fn register_room(&self, event: &Value, room_id: &RoomId) -> Result<Option<Room>> {
		if event.get("type").and_then(Value::as_str) != Some("m.room.member") {
			return Ok(None);
		}

		let Some(state_key) = event.get("state_key").and_then(Value::as_str) else {
			return Ok(None);
		};

		let Some(appservice) = self.appservice_for_ghost(state_key).await? else {
			return Ok(None);
		};

		self.services
			.directory()
			.register_room(room_id, &appservice)
			.await
	}

	async fn collect_otk_counts(
		&self,
		txn_id: &str,
		output: &mut BTreeMap<Uuid, Events>,
		otk_counts: BTreeMap<OwnedUserId, Value>,
	) -> Result {
		for (user_id, otk_count) in otk_counts {
			let Some(appservice) = self.appservice_for_ghost(user_id.as_str()).await? else {
				continue;
			};

			output
				.entry(appservice.id)
				.or_insert_with(|| Events::new(txn_id))
				.otk_count
				.insert(user_id, otk_count);
		}

		Ok(())
	}

	async fn appservice_for_ghost(
		&self,
		user_id: &str,
	) -> Result<Option<Arc<crate::directory::Appservice>>> {
		let config = &self.server.config;
		let Some((owner, prefix)) =
			ghost::parse(user_id, &config.mxid_prefix(), &config.mxid_suffix())
		else {
			return Ok(None);
		};

		self.services
			.directory()
			.find_appservice(owner, prefix)
			.await
	}

	async fn send_transactions(
		&self,
		output: BTreeMap<Uuid, Events>,
		synchronous_to: &[String],
	) -> Result<BTreeMap<String, bool>> {
		let mut wait_for: Vec<(String, JoinHandle<bool>)> = Vec::new();

		for (appservice_id, events) in output {
			let Some(appservice) = self
				.services
				.directory()
				.get_appservice(appservice_id)
				.await?
			else {
				continue;
			};

			debug!(
				"Preparing to send {} PDUs and {} EDUs from transaction {} to {}",
				events.pdu.len(),
				events.edu.len(),
				events.txn_id,
				appservice.name(),
			);

			let sending = self.services.sending().clone();
			let task = tokio::spawn(async move {
				sending.post_events(&appservice, events).await
			});

			let id = appservice_id.to_string();
			if synchronous_to.contains(&id) {
				wait_for.push((id, task));
			}
		}

		let mut results = BTreeMap::new();
		for (id, task) in wait_for {
			results.insert(id, task.await.unwrap_or(false));
		}

		Ok(results)
	}
}
