use std::{
	sync::atomic::{AtomicBool, Ordering},
	time::SystemTime,
};

use tokio::{runtime, sync::broadcast};

use crate::{Err, Result, config::Config, metrics::Metrics, utils};

/// Server runtime state; shared by every service.
pub struct Server {
	/// Server-wide configuration instance
	pub config: Config,

	/// Timestamp server was started; used for uptime.
	pub started: SystemTime,

	/// Shutdown pending indicator. This is an observable used on shutdown
	/// and should not be modified.
	pub stopping: AtomicBool,

	/// Random id distinguishing this process from other replicas on the
	/// shared pub/sub channels.
	pub instance_id: String,

	/// Handle to the runtime
	pub runtime: Option<runtime::Handle>,

	/// Shutdown signal
	pub signal: broadcast::Sender<&'static str>,

	/// Metrics subsystem state
	pub metrics: Metrics,
}

impl Server {
	#[must_use]
	pub fn new(config: Config, runtime: Option<runtime::Handle>) -> Self {
		Self {
			config,
			started: SystemTime::now(),
			stopping: AtomicBool::new(false),
			instance_id: utils::random_string(8),
			runtime,
			signal: broadcast::channel::<&'static str>(1).0,
			metrics: Metrics::new(),
		}
	}

	pub fn shutdown(&self) -> Result {
		if self.stopping.swap(true, Ordering::AcqRel) {
			return Err!("Shutdown already in progress");
		}

		self.signal("SIGTERM")
	}

	pub fn signal(&self, sig: &'static str) -> Result {
		self.signal.send(sig).ok();
		Ok(())
	}

	#[inline]
	pub async fn until_shutdown(&self) {
		while self.running() {
			self.signal.subscribe().recv().await.ok();
		}
	}

	#[inline]
	pub fn runtime(&self) -> &runtime::Handle {
		self.runtime
			.as_ref()
			.expect("runtime handle available in Server")
	}

	#[inline]
	pub fn check_running(&self) -> Result {
		use std::{io, io::ErrorKind::Interrupted};

		self.running()
			.then_some(())
			.ok_or_else(|| io::Error::new(Interrupted, "Server shutting down"))
			.map_err(Into::into)
	}

	#[inline]
	pub fn running(&self) -> bool { !self.is_stopping() }

	#[inline]
	pub fn is_stopping(&self) -> bool { self.stopping.load(Ordering::Relaxed) }
}
