use std::{
	collections::{HashMap, HashSet},
	sync::{
		Arc, Mutex, Weak,
		atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
	},
	time::Duration,
};

use asmux_core::{
	Events, Result, Server, debug, error,
	utils::time::now_millis,
	warn,
};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{
	SinkExt, StreamExt,
	stream::{SplitSink, SplitStream},
};
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, Notify, oneshot};

use super::proto;
use crate::{directory::Appservice, queue::QueueBatch};

/// Ack timeout for the first send on a connection.
const FIRST_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Ack timeout once the connection has already timed out.
const RETRY_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Consecutive ack timeouts before the connection is closed with 4002.
const MAX_TIMEOUTS: u32 = 7;

const PING_TIMEOUT: Duration = Duration::from_secs(45);

pub(super) enum RequestError {
	Timeout,
	Closed,
	Failed(String),
}

/// One live bridge websocket: the write half, request/response
/// correlation, and the queue consumer feeding it.
pub struct Connection {
	pub(super) appservice: Arc<Appservice>,
	pub(super) version: u32,
	pub(super) process_id: String,

	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
	weak: Weak<Self>,
	sink: AsyncMutex<SplitSink<WebSocket, Message>>,
	pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, RequestError>>>>,
	txn_waiters: Mutex<Vec<(String, oneshot::Sender<bool>)>>,
	next_req_id: AtomicU64,
	timeouts: AtomicU32,
	last_received: AtomicU64,
	dead: AtomicBool,
	closed: Notify,
}

impl Connection {
	pub(super) fn new(
		appservice: Arc<Appservice>,
		version: u32,
		process_id: String,
		server: Arc<Server>,
		services: Arc<crate::OnceServices>,
		sink: SplitSink<WebSocket, Message>,
	) -> Arc<Self> {
		Arc::new_cyclic(|weak| Self {
			appservice,
			version,
			process_id,
			server,
			services,
			weak: weak.clone(),
			sink: AsyncMutex::new(sink),
			pending: Mutex::new(HashMap::new()),
			txn_waiters: Mutex::new(Vec::new()),
			next_req_id: AtomicU64::new(0),
			timeouts: AtomicU32::new(0),
			last_received: AtomicU64::new(now_millis()),
			dead: AtomicBool::new(false),
			closed: Notify::new(),
		})
	}

	/// Runs the connection to completion: spawns the queue consumer and
	/// reads frames until the socket closes.
	pub(super) async fn run(&self, mut stream: SplitStream<WebSocket>) {
		let consumer = tokio::spawn(self.arc().consumer_main());

		self.read_loop(&mut stream).await;

		// a cancelled consumer leaves its current batch uncommitted; the
		// entries stay on the stream for the next connection
		self.mark_dead();
		consumer.abort();
		consumer.await.ok();
	}

	async fn read_loop(&self, stream: &mut SplitStream<WebSocket>) {
		while let Some(message) = stream.next().await {
			self.last_received.store(now_millis(), Ordering::Relaxed);

			match message {
				| Ok(Message::Text(text)) => self.handle_frame(text.as_str()),
				| Ok(Message::Close(_)) => break,
				| Ok(_) => {}, // ping/pong handled by the transport
				| Err(e) => {
					debug!("Websocket read for {} failed: {e}", self.appservice.name());
					break;
				},
			}
		}
	}

	fn handle_frame(&self, raw: &str) {
		let frame: proto::IncomingFrame = match serde_json::from_str(raw) {
			| Ok(frame) => frame,
			| Err(e) => {
				debug!("Malformed websocket frame from {}: {e}", self.appservice.name());
				return;
			},
		};

		match frame.command.as_str() {
			| "response" | "error" => self.resolve_pending(frame),
			| _ => {
				let conn = self.arc();
				tokio::spawn(async move { conn.handle_command(frame).await });
			},
		}
	}

	fn resolve_pending(&self, frame: proto::IncomingFrame) {
		let Some(id) = frame.id else {
			debug!("Response frame without id from {}", self.appservice.name());
			return;
		};

		let sender = self
			.pending
			.lock()
			.expect("pending request table poisoned")
			.remove(&id);
		let Some(sender) = sender else {
			debug!("Stale response {id} from {}", self.appservice.name());
			return;
		};

		let result = if frame.command == "error" {
			let code = frame
				.data
				.get("code")
				.and_then(Value::as_str)
				.unwrap_or("websocket-unknown-error");
			let message = frame
				.data
				.get("message")
				.and_then(Value::as_str)
				.unwrap_or("");

			Err(RequestError::Failed(format!("{code}: {message}")))
		} else {
			Ok(frame.data)
		};

		sender.send(result).ok();
	}

	async fn handle_command(self: Arc<Self>, frame: proto::IncomingFrame) {
		let services = &self.services;
		let appservice = &self.appservice;

		let result: Result<Value, String> = match frame.command.as_str() {
			| "bridge_status" => {
				services
					.status()
					.send_remote_status(appservice, frame.data)
					.await;

				Ok(json!({}))
			},
			| "message_checkpoint" => {
				services
					.status()
					.send_message_checkpoints(appservice, frame.data)
					.await;

				Ok(json!({}))
			},
			| "push_key" => {
				let push_key = if frame.data.is_null() {
					Ok(None)
				} else {
					serde_json::from_value(frame.data).map(Some)
				};

				match push_key {
					| Ok(push_key) => services
						.directory()
						.set_push_key(appservice, push_key)
						.await
						.map(|()| json!({}))
						.map_err(|e| format!("push_key_failed: {e}")),
					| Err(e) => Err(format!("bad_request: invalid push key: {e}")),
				}
			},
			| "start_sync" => services
				.syncproxy()
				.start(appservice, &frame.data)
				.await
				.map_err(|e| format!("start_sync_failed: {e}")),
			| "ping" => {
				// a stale connection must learn it was replaced so the
				// client reconnects
				if services.websocket().is_active(appservice.id, &self) {
					Ok(json!({ "timestamp": now_millis() }))
				} else {
					Err(format!("{}: connection is no longer active", proto::STATUS_CONN_REPLACED))
				}
			},
			| command => Err(format!("unknown-command: unknown command {command}")),
		};

		let Some(id) = frame.id else {
			return;
		};

		let outcome = match result {
			| Ok(data) => self.send_response(id, data).await,
			| Err(message) => self.send_error(id, &message).await,
		};

		if let Err(e) = outcome {
			debug!("Failed to respond to command from {}: {e}", appservice.name());
		}
	}

	/// Ships one merged batch and handles the ack per protocol version.
	pub(super) async fn deliver(&self, batch: QueueBatch) -> Result {
		let mut frame = batch.events.to_wire();
		let object = frame
			.as_object_mut()
			.expect("envelope serializes to an object");
		object.insert("status".to_owned(), json!("ok"));

		debug!(
			"Sending transaction {} to {} via websocket",
			batch.events.txn_id,
			self.appservice.name(),
		);

		// v1 clients never ack
		if self.version < proto::VERSION_ACKS {
			object.insert("command".to_owned(), json!("transaction"));
			if self.send_json(&frame).await.is_err() {
				return Ok(());
			}

			self.count_delivery(&batch.events, true);
			self.resolve_txn_waiters(&batch.events.txn_id, true);
			batch.commit().await?;
			return Ok(());
		}

		let timeout = if self.timeouts.load(Ordering::Relaxed) == 0 {
			FIRST_SEND_TIMEOUT
		} else {
			RETRY_SEND_TIMEOUT
		};

		match self.request("transaction", frame, timeout).await {
			| Ok(_) => {
				self.timeouts.store(0, Ordering::Relaxed);
				self.count_delivery(&batch.events, true);
				self.resolve_txn_waiters(&batch.events.txn_id, true);
				batch.commit().await?;
			},
			| Err(RequestError::Timeout) => {
				let timeouts = self
					.timeouts
					.fetch_add(1, Ordering::Relaxed)
					.saturating_add(1);
				warn!(
					"Transaction {} to {} not acknowledged in time (timeouts: {timeouts})",
					batch.events.txn_id,
					self.appservice.name(),
				);

				if self.version >= proto::VERSION_IDEMPOTENT_RETRY {
					// the batch stays on the stream for retry
					drop(batch);
					if timeouts >= MAX_TIMEOUTS {
						self.close(
							proto::CLOSE_NOT_ACKNOWLEDGED,
							proto::STATUS_NOT_ACKNOWLEDGED,
						)
						.await;
					} else {
						self.services
							.wakeup()
							.wakeup(&self.appservice, true)
							.await;
					}
				} else {
					// a v2 client cannot dedupe a resend
					warn!(
						"Dropping transaction {} for v{} client after ack timeout",
						batch.events.txn_id, self.version,
					);

					self.count_delivery(&batch.events, false);
					self.resolve_txn_waiters(&batch.events.txn_id, false);
					batch.commit().await?;
				}
			},
			| Err(RequestError::Closed) => {
				drop(batch);
			},
			| Err(RequestError::Failed(e)) => {
				warn!(
					"Failed to send transaction {} to {}: {e}",
					batch.events.txn_id,
					self.appservice.name(),
				);

				self.count_delivery(&batch.events, false);
				self.resolve_txn_waiters(&batch.events.txn_id, false);
				batch.commit().await?;
			},
		}

		Ok(())
	}

	async fn consumer_main(self: Arc<Self>) {
		match self.consume().await {
			| Ok(()) => {},
			| Err(e) => {
				error!("Queue consumer for {} died: {e}", self.appservice.name());
				if !self.is_dead() {
					self.close(proto::CLOSE_INTERNAL_ERROR, proto::STATUS_CONSUMER_FAILED)
						.await;
				}
			},
		}
	}

	async fn consume(&self) -> Result {
		let mut queue = self.services.queue().open(&self.appservice);
		loop {
			if self.is_dead() {
				return Ok(());
			}

			let batch = tokio::select! {
				() = self.closed.notified() => return Ok(()),
				batch = queue.next() => batch?,
			};

			self.deliver(batch).await?;
		}
	}

	pub(super) async fn ping(&self, remote_id: &str) -> Result<Value, RequestError> {
		self.request("ping", json!({ "remote_id": remote_id }), PING_TIMEOUT)
			.await
	}

	/// One request/response round trip. `data` must serialize to an
	/// object; the command and request id are written into it.
	pub(super) async fn request(
		&self,
		command: &str,
		mut data: Value,
		timeout: Duration,
	) -> Result<Value, RequestError> {
		if self.is_dead() {
			return Err(RequestError::Closed);
		}

		let id = self
			.next_req_id
			.fetch_add(1, Ordering::Relaxed)
			.saturating_add(1);
		let object = data
			.as_object_mut()
			.expect("request data serializes to an object");
		object.insert("command".to_owned(), json!(command));
		object.insert("id".to_owned(), json!(id));

		let (sender, receiver) = oneshot::channel();
		self.pending
			.lock()
			.expect("pending request table poisoned")
			.insert(id, sender);

		if let Err(e) = self.send_json(&data).await {
			self.forget_pending(id);
			return Err(RequestError::Failed(format!("websocket-send-fail: {e}")));
		}

		match tokio::time::timeout(timeout, receiver).await {
			| Ok(Ok(result)) => result,
			| Ok(Err(_)) => Err(RequestError::Closed),
			| Err(_) => {
				self.forget_pending(id);
				Err(RequestError::Timeout)
			},
		}
	}

	pub(super) async fn send_command(&self, command: &str, mut data: Value) -> Result {
		let object = data
			.as_object_mut()
			.expect("command data serializes to an object");
		object.insert("command".to_owned(), json!(command));

		self.send_json(&data).await
	}

	async fn send_response(&self, id: u64, data: Value) -> Result {
		self.send_json(&json!({ "id": id, "command": "response", "data": data }))
			.await
	}

	async fn send_error(&self, id: u64, message: &str) -> Result {
		let (code, message) = message
			.split_once(": ")
			.unwrap_or(("websocket-unknown-error", message));

		self.send_json(&json!({
			"id": id,
			"command": "error",
			"data": { "code": code, "message": message },
		}))
		.await
	}

	async fn send_json(&self, frame: &Value) -> Result {
		let text = serde_json::to_string(frame)?;
		let mut sink = self.sink.lock().await;
		sink.send(Message::Text(text.into()))
			.await
			.map_err(|e| asmux_core::err!("websocket-send-fail: {e}"))
	}

	/// Closes the connection with the given code; the read loop observes
	/// the closed socket and tears the connection down.
	pub(super) async fn close(&self, code: u16, reason: &str) {
		if self.dead.swap(true, Ordering::SeqCst) {
			return;
		}

		debug!("Closing websocket to {}: {code} {reason}", self.appservice.name());
		self.closed.notify_waiters();
		self.fail_pending();

		let mut sink = self.sink.lock().await;
		sink.send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
			.await
			.ok();
	}

	pub(super) fn mark_dead(&self) {
		if self.dead.swap(true, Ordering::SeqCst) {
			return;
		}

		self.closed.notify_waiters();
		self.fail_pending();
	}

	#[inline]
	pub(super) fn is_dead(&self) -> bool { self.dead.load(Ordering::SeqCst) }

	#[inline]
	pub(super) fn timeouts(&self) -> u32 { self.timeouts.load(Ordering::Relaxed) }

	pub(super) fn idle(&self) -> Duration {
		let last = self.last_received.load(Ordering::Relaxed);
		Duration::from_millis(now_millis().saturating_sub(last))
	}

	/// Registers interest in the delivery result of one txn id. Resolved
	/// true on ack, false when the batch is dropped or the connection
	/// dies.
	pub(super) fn register_txn_waiter(&self, txn_id: &str) -> oneshot::Receiver<bool> {
		let (sender, receiver) = oneshot::channel();
		if self.is_dead() {
			sender.send(false).ok();
			return receiver;
		}

		self.txn_waiters
			.lock()
			.expect("txn waiter table poisoned")
			.push((txn_id.to_owned(), sender));

		receiver
	}

	fn resolve_txn_waiters(&self, combined_txn_id: &str, ok: bool) {
		let delivered: HashSet<&str> = combined_txn_id.split(',').collect();
		let mut waiters = self
			.txn_waiters
			.lock()
			.expect("txn waiter table poisoned");

		let mut index = 0;
		while index < waiters.len() {
			if delivered.contains(waiters[index].0.as_str()) {
				let (_, sender) = waiters.swap_remove(index);
				sender.send(ok).ok();
			} else {
				index = index.saturating_add(1);
			}
		}
	}

	pub(super) fn resolve_all_waiters(&self, ok: bool) {
		let waiters = std::mem::take(
			&mut *self
				.txn_waiters
				.lock()
				.expect("txn waiter table poisoned"),
		);
		for (_, sender) in waiters {
			sender.send(ok).ok();
		}
	}

	fn count_delivery(&self, events: &Events, ok: bool) {
		let metrics = &self.server.metrics;
		let metric = if ok { &metrics.successful_events } else { &metrics.failed_events };
		for event_type in &events.types {
			metric
				.with_label_values(&[
					self.appservice.owner.as_str(),
					self.appservice.prefix.as_str(),
					event_type.as_str(),
				])
				.inc();
		}
	}

	fn forget_pending(&self, id: u64) {
		self.pending
			.lock()
			.expect("pending request table poisoned")
			.remove(&id);
	}

	fn fail_pending(&self) {
		let pending = std::mem::take(
			&mut *self
				.pending
				.lock()
				.expect("pending request table poisoned"),
		);
		for (_, sender) in pending {
			sender.send(Err(RequestError::Closed)).ok();
		}
	}

	fn arc(&self) -> Arc<Self> {
		self.weak
			.upgrade()
			.expect("connection alive while in use")
	}
}
