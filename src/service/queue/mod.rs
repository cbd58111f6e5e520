use std::sync::Arc;

use asmux_core::{
	Events, Result, Server, debug,
	matrix::MAX_PDU_AGE_MS,
	warn,
};
use redis::{
	AsyncCommands,
	aio::{ConnectionManager, MultiplexedConnection},
	streams::{StreamReadOptions, StreamReadReply, StreamRangeReply},
};

use crate::{directory::Appservice, service};

/// Whole-stream safety TTL; orphaned queues expire after a week.
const QUEUE_TTL_SECS: i64 = 86_400 * 7;

/// One blocking read waits this long before being re-issued.
const READ_BLOCK_MS: usize = 30_000;

/// Entries combined into a single delivery attempt.
const READ_COUNT: usize = 10;

/// Durable per-appservice transaction buffer on a shared redis stream, so
/// every replica sees the same queue.
pub struct Service {
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
	redis: redis::Client,
	conn: ConnectionManager,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			server: args.server.clone(),
			services: args.services.clone(),
			redis: args.redis.clone(),
			conn: args.redis_conn.clone(),
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	/// Opens the queue of one appservice.
	#[must_use]
	pub fn open(&self, appservice: &Arc<Appservice>) -> AppserviceQueue {
		AppserviceQueue {
			stream: format!("bridge-txns-{}", appservice.id),
			owner_mxid: appservice.owner_mxid(&self.server.config.mxid_suffix()),
			appservice: appservice.clone(),
			server: self.server.clone(),
			services: self.services.clone(),
			redis: self.redis.clone(),
			conn: self.conn.clone(),
			blocking: None,
		}
	}
}

pub struct AppserviceQueue {
	stream: String,
	owner_mxid: String,
	appservice: Arc<Appservice>,
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,
	redis: redis::Client,
	conn: ConnectionManager,

	// dedicated connection for blocking reads; a blocking XREAD on the
	// shared manager would stall every other command behind it
	blocking: Option<MultiplexedConnection>,
}

impl AppserviceQueue {
	/// Appends one serialized envelope and refreshes the stream TTL in a
	/// single transaction.
	#[tracing::instrument(level = "debug", skip_all, fields(stream = %self.stream))]
	pub async fn push(&self, events: &Events) -> Result {
		let payload = serde_json::to_string(events)?;
		let mut conn = self.conn.clone();

		redis::pipe()
			.atomic()
			.xadd(&self.stream, "*", &[("txn", payload.as_str())])
			.ignore()
			.expire(&self.stream, QUEUE_TTL_SECS)
			.ignore()
			.query_async::<()>(&mut conn)
			.await?;

		Ok(())
	}

	/// Blocks until the stream holds a deliverable batch and returns it as
	/// one combined envelope. Stale PDUs are evicted (and reported) before
	/// combining; batches that end up empty are deleted and the read is
	/// re-issued. Entries are only removed from the stream through
	/// [`QueueBatch::commit`] — a dropped handle leaves them for the next
	/// read.
	#[tracing::instrument(level = "debug", skip_all, fields(stream = %self.stream))]
	pub async fn next(&mut self) -> Result<QueueBatch> {
		debug!("Waiting for next txn in stream: {}", self.stream);

		let stream = self.stream.clone();
		loop {
			let options = StreamReadOptions::default()
				.count(READ_COUNT)
				.block(READ_BLOCK_MS);

			let reply: StreamReadReply = self
				.blocking_conn()
				.await?
				.xread_options(&[stream.as_str()], &[0], &options)
				.await?;

			let Some(key) = reply.keys.into_iter().next() else {
				// block timeout; wait again
				continue;
			};

			let mut ids = Vec::with_capacity(key.ids.len());
			let mut combined = Events::default();
			for entry in &key.ids {
				ids.push(entry.id.clone());
				let Some(raw) = entry.get::<Vec<u8>>("txn") else {
					warn!("Dropping malformed queue entry {}", entry.id);
					continue;
				};

				let mut txn: Events = match serde_json::from_slice(&raw) {
					| Ok(txn) => txn,
					| Err(e) => {
						warn!("Dropping unparseable queue entry {}: {e}", entry.id);
						continue;
					},
				};

				self.evict_expired(&mut txn);
				combined.merge(txn);
			}

			if combined.is_empty() {
				let mut conn = self.conn.clone();
				let _: usize = conn.xdel(&self.stream, &ids).await?;
				continue;
			}

			return Ok(QueueBatch {
				stream: self.stream.clone(),
				ids,
				events: combined,
				conn: self.conn.clone(),
			});
		}
	}

	/// Whether any buffered entry would still carry a PDU after eviction.
	/// The check is read-only; eviction is actually applied in `next()`.
	pub async fn contains_pdus(&self) -> Result<bool> {
		debug!("Checking stream for PDUs: {}", self.stream);

		let mut conn = self.conn.clone();
		let reply: StreamRangeReply = conn.xrange_all(&self.stream).await?;
		for entry in reply.ids {
			let Some(raw) = entry.get::<Vec<u8>>("txn") else {
				continue;
			};

			let Ok(mut txn) = serde_json::from_slice::<Events>(&raw) else {
				continue;
			};

			txn.pop_expired_pdu(&self.owner_mxid, MAX_PDU_AGE_MS);
			if !txn.pdu.is_empty() {
				return Ok(true);
			}
		}

		Ok(false)
	}

	fn evict_expired(&self, txn: &mut Events) {
		let expired = txn.pop_expired_pdu(&self.owner_mxid, MAX_PDU_AGE_MS);
		if expired.is_empty() {
			return;
		}

		warn!(
			appservice = %self.appservice.name(),
			"Dropped {} expired PDUs",
			expired.len(),
		);

		self.server
			.metrics
			.expired_pdus
			.inc_by(expired.len() as u64);

		let status = self.services.status().clone();
		let appservice = self.appservice.clone();
		tokio::spawn(async move {
			status.report_expired_pdu(&appservice, expired).await;
		});
	}

	async fn blocking_conn(&mut self) -> Result<&mut MultiplexedConnection> {
		if self.blocking.is_none() {
			self.blocking = Some(self.redis.get_multiplexed_async_connection().await?);
		}

		Ok(self.blocking.as_mut().expect("connection just created"))
	}
}

/// A borrowed batch: the merged envelope plus the stream ids backing it.
/// Committing deletes the entries; dropping the handle re-exposes them to
/// the next reader.
pub struct QueueBatch {
	stream: String,
	ids: Vec<String>,
	pub events: Events,
	conn: ConnectionManager,
}

impl QueueBatch {
	pub async fn commit(mut self) -> Result {
		let _: usize = self.conn.xdel(&self.stream, &self.ids).await?;
		Ok(())
	}
}
