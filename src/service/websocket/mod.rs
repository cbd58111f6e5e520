mod connection;
pub mod proto;

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
	time::Duration,
};

use asmux_core::{Err, Events, Result, Server, debug, info, warn};
use axum::extract::ws::WebSocket;
use futures::StreamExt;
use serde_json::{Value, json};
use uuid::Uuid;

use self::connection::{Connection, RequestError};
use crate::{
	directory::Appservice,
	service,
	status::BridgeState,
	wakeup::WebsocketState,
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the live bridge websockets of this replica. The fleet-wide
/// single-active-connection invariant is kept eventually: the local slot
/// is replaced synchronously, peers are asked to drop theirs over pub/sub.
pub struct Service {
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
	websockets: Mutex<HashMap<Uuid, Arc<Connection>>>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			server: args.server.clone(),
			services: args.services.clone(),
			websockets: Mutex::new(HashMap::new()),
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	/// Takes over a freshly upgraded socket: installs it as the one
	/// connection for the appservice, runs it to completion, tears it
	/// down. The api layer has already authenticated and vetted the
	/// handshake.
	pub async fn handle_socket(
		&self,
		appservice: Arc<Appservice>,
		version: u32,
		process_id: String,
		socket: WebSocket,
	) {
		let (sink, stream) = socket.split();
		let conn = Connection::new(
			appservice.clone(),
			version,
			process_id,
			self.server.clone(),
			self.services.clone(),
			sink,
		);

		let previous = self
			.lock_table()
			.insert(appservice.id, conn.clone());
		if let Some(previous) = previous {
			debug!("New websocket connection coming in, closing old one");
			previous
				.close(proto::CLOSE_CONN_REPLACED, proto::STATUS_CONN_REPLACED)
				.await;
		} else {
			self.server.metrics.connected_websockets.inc();
		}

		// ask the rest of the fleet to drop their connection too
		self.services
			.replication()
			.request_websocket_close(appservice.id)
			.await;

		info!(
			appservice = %appservice.name(),
			version = conn.version,
			process_id = %conn.process_id,
			"Websocket transaction connection opened",
		);

		if conn
			.send_command("connect", json!({ "status": "connected" }))
			.await
			.is_ok()
		{
			conn.run(stream).await;
		}

		self.teardown(&conn).await;
	}

	/// Queues the envelope and, with a live local connection, waits for
	/// its delivery result. Without one the bridge gets a wakeup push and
	/// the envelope waits on the stream.
	pub async fn post_events(&self, appservice: &Arc<Appservice>, events: &Events) -> Result<bool> {
		let conn = self.get(appservice.id);
		let waiter = conn
			.as_ref()
			.map(|conn| conn.register_txn_waiter(&events.txn_id));

		self.services
			.queue()
			.open(appservice)
			.push(events)
			.await?;

		match waiter {
			| Some(receiver) => Ok(receiver.await.unwrap_or(false)),
			| None => {
				warn!(
					"Not sending transaction {} to {} directly: websocket not connected",
					events.txn_id,
					appservice.name(),
				);

				self.services.wakeup().wakeup(appservice, false).await;
				Ok(false)
			},
		}
	}

	/// Pings the bridge over whichever transport is available.
	pub async fn ping(&self, appservice: &Arc<Appservice>, remote_id: &str) -> BridgeState {
		if let Some(conn) = self.get(appservice.id) {
			return match conn.ping(remote_id).await {
				| Ok(raw) => BridgeState::from_remote(raw),
				| Err(RequestError::Timeout) => BridgeState::ping_error("io-timeout", None),
				| Err(RequestError::Closed) =>
					BridgeState::ping_error("websocket-not-connected", None),
				| Err(RequestError::Failed(e)) =>
					BridgeState::ping_error("websocket-fatal-error", Some(e)),
			};
		}

		if !appservice.address.is_empty() {
			return self.services.sending().ping(appservice).await;
		}

		BridgeState::ping_error("websocket-not-connected", None)
	}

	/// Round trip of an arbitrary command over the bridge's websocket.
	pub async fn post_command(
		&self,
		appservice_id: Uuid,
		command: &str,
		data: Value,
	) -> Result<Value> {
		let Some(conn) = self.get(appservice_id) else {
			return Err!("websocket-not-connected: no websocket for {appservice_id}");
		};

		match conn.request(command, data, COMMAND_TIMEOUT).await {
			| Ok(data) => Ok(data),
			| Err(RequestError::Timeout) => Err!("io-timeout: {command} round trip timed out"),
			| Err(RequestError::Closed) => Err!("websocket-not-connected: connection closed"),
			| Err(RequestError::Failed(e)) => Err!("{e}"),
		}
	}

	/// Closes the local connection for an appservice after a peer replica
	/// took over.
	pub async fn close_replaced(&self, appservice_id: Uuid) {
		let conn = self.get(appservice_id);
		if let Some(conn) = conn {
			conn.close(proto::CLOSE_CONN_REPLACED, proto::STATUS_CONN_REPLACED)
				.await;
		}
	}

	/// Closes every connection; used on shutdown.
	pub async fn close_all(&self) {
		let conns: Vec<_> = self.lock_table().values().cloned().collect();
		if conns.is_empty() {
			return;
		}

		debug!("Disconnecting {} websockets", conns.len());
		for conn in conns {
			conn.close(proto::CLOSE_SERVICE_RESTART, proto::STATUS_SERVER_SHUTTING_DOWN)
				.await;
		}
	}

	/// Whether this exact connection is still the registered one.
	pub(crate) fn is_active(&self, appservice_id: Uuid, conn: &Arc<Connection>) -> bool {
		self.get(appservice_id)
			.is_some_and(|current| Arc::ptr_eq(&current, conn))
	}

	/// Observed socket state for the wakeup gate.
	pub(crate) fn connection_state(&self, appservice_id: Uuid) -> Option<WebsocketState> {
		self.get(appservice_id)
			.map(|conn| WebsocketState { timeouts: conn.timeouts(), idle: conn.idle() })
	}

	fn get(&self, appservice_id: Uuid) -> Option<Arc<Connection>> {
		self.lock_table().get(&appservice_id).cloned()
	}

	async fn teardown(&self, conn: &Arc<Connection>) {
		conn.mark_dead();
		conn.resolve_all_waiters(false);

		let appservice = &conn.appservice;
		let removed = {
			let mut table = self.lock_table();
			let still_ours = table
				.get(&appservice.id)
				.is_some_and(|current| Arc::ptr_eq(current, conn));
			if still_ours {
				table.remove(&appservice.id);
			}

			still_ours
		};

		info!(
			appservice = %appservice.name(),
			"Websocket transaction connection closed",
		);

		// a replacement connection owns the slot now; nothing to clean up
		if !removed {
			return;
		}

		self.server.metrics.connected_websockets.dec();

		let services = self.services.clone();
		let az = appservice.clone();
		tokio::spawn(async move {
			services.syncproxy().stop(&az).await;
		});

		if !self.server.is_stopping() {
			let services = self.services.clone();
			let az = appservice.clone();
			tokio::spawn(async move {
				let state = services.websocket().ping(&az, "").await;
				if state.is_unreachable() {
					services.status().send_bridge_status(&az, &state).await;
				}
			});
		}
	}

	fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Connection>>> {
		self.websockets
			.lock()
			.expect("websocket table poisoned")
	}
}
