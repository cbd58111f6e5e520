use std::{sync::Arc, time::Duration};

use asmux_core::{Err, Result, Server, debug, error, warn};
use futures::StreamExt;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::service;

pub const AS_CACHE_CHANNEL: &str = "appservice-cache-invalidation";
pub const ROOM_CACHE_CHANNEL: &str = "room-cache-invalidation";
pub const USER_CACHE_CHANNEL: &str = "user-cache-invalidation";
pub const WS_CLOSE_CHANNEL: &str = "websocket-close-requests";

/// Cross-replica pub/sub: cache invalidation fan-out plus the best-effort
/// "please close your websocket" channel. Messages are advisory; the
/// store stays authoritative and a lost close request cannot cause double
/// delivery because batches commit only on ack.
pub struct Service {
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
	redis: redis::Client,
	conn: ConnectionManager,
}

#[derive(Debug, Deserialize, Serialize)]
struct CloseRequest {
	appservice_id: Uuid,
	instance_id: String,
}

#[async_trait::async_trait]
impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			server: args.server.clone(),
			services: args.services.clone(),
			redis: args.redis.clone(),
			conn: args.redis_conn.clone(),
		}))
	}

	async fn worker(self: Arc<Self>) -> Result {
		while self.server.running() {
			match self.listen().await {
				| Ok(()) => break,
				| Err(e) => {
					error!("Redis pub/sub failure, throwing caches: {e}");
					self.services.directory().clear_caches();
					tokio::time::sleep(Duration::from_secs(1)).await;
				},
			}
		}

		Ok(())
	}

	async fn interrupt(&self) {
		// listen() exits through the shutdown signal
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	async fn listen(&self) -> Result {
		let mut pubsub = self.redis.get_async_pubsub().await?;
		pubsub.subscribe(AS_CACHE_CHANNEL).await?;
		pubsub.subscribe(ROOM_CACHE_CHANNEL).await?;
		pubsub.subscribe(USER_CACHE_CHANNEL).await?;
		pubsub.subscribe(WS_CLOSE_CHANNEL).await?;

		let mut messages = pubsub.on_message();
		loop {
			tokio::select! {
				() = self.server.until_shutdown() => return Ok(()),
				message = messages.next() => match message {
					| Some(message) => self.handle(&message).await,
					| None => return Err!("pub/sub stream ended"),
				},
			}
		}
	}

	async fn handle(&self, message: &redis::Msg) {
		let channel = message.get_channel_name();
		let Ok(payload) = message.get_payload::<String>() else {
			warn!("Unreadable pub/sub payload on {channel}");
			return;
		};

		match channel {
			| AS_CACHE_CHANNEL => match payload.parse::<Uuid>() {
				| Ok(id) => self.services.directory().invalidate_appservice(id),
				| Err(e) => warn!("Bad appservice invalidation key {payload:?}: {e}"),
			},
			| ROOM_CACHE_CHANNEL => self.services.directory().invalidate_room(&payload),
			| USER_CACHE_CHANNEL => self.services.directory().invalidate_user(&payload),
			| WS_CLOSE_CHANNEL => self.handle_close_request(&payload).await,
			| _ => warn!("Unexpected pub/sub message on {channel}"),
		}
	}

	async fn handle_close_request(&self, payload: &str) {
		let request: CloseRequest = match serde_json::from_str(payload) {
			| Ok(request) => request,
			| Err(e) => {
				warn!("Bad websocket close request {payload:?}: {e}");
				return;
			},
		};

		// our own broadcast; the local slot was already replaced
		if request.instance_id == self.server.instance_id {
			return;
		}

		debug!(
			"Peer {} took over websocket for {}, closing ours",
			request.instance_id, request.appservice_id,
		);

		self.services
			.websocket()
			.close_replaced(request.appservice_id)
			.await;
	}

	pub async fn publish_appservice_invalidation(&self, id: Uuid) {
		self.publish(AS_CACHE_CHANNEL, id.to_string()).await;
	}

	pub async fn publish_room_invalidation(&self, room_id: &str) {
		self.publish(ROOM_CACHE_CHANNEL, room_id.to_owned()).await;
	}

	pub async fn publish_user_invalidation(&self, user_id: &str) {
		self.publish(USER_CACHE_CHANNEL, user_id.to_owned()).await;
	}

	/// Asks every replica to close its websocket for this appservice.
	pub async fn request_websocket_close(&self, appservice_id: Uuid) {
		let request = CloseRequest {
			appservice_id,
			instance_id: self.server.instance_id.clone(),
		};

		let payload = serde_json::to_string(&request).expect("close request serializes");
		self.publish(WS_CLOSE_CHANNEL, payload).await;
	}

	/// Publishes best-effort; a pub/sub failure must never fail the write
	/// that triggered it.
	async fn publish(&self, channel: &str, payload: String) {
		let mut conn = self.conn.clone();
		let result: Result<i64, _> = conn.publish(channel, payload).await;
		if let Err(e) = result {
			warn!("Failed to publish on {channel}: {e}");
		}
	}
}
