use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Event and delivery counters, registered on an owned registry so tests
/// and exporters can read them back.
pub struct Metrics {
	registry: Registry,

	pub received_events: IntCounterVec,
	pub dropped_events: IntCounterVec,
	pub accepted_events: IntCounterVec,
	pub successful_events: IntCounterVec,
	pub failed_events: IntCounterVec,
	pub expired_pdus: IntCounter,
	pub connected_websockets: IntGauge,
	pub wakeup_pushes: IntCounter,
}

impl Metrics {
	#[must_use]
	pub fn new() -> Self {
		let registry = Registry::new();

		let received_events = counter_vec(
			&registry,
			"asmux_received_events",
			"Number of incoming events",
			&["type"],
		);
		let dropped_events = counter_vec(
			&registry,
			"asmux_dropped_events",
			"Number of events with no target appservice",
			&["type"],
		);
		let accepted_events = counter_vec(
			&registry,
			"asmux_accepted_events",
			"Number of events that have a target appservice",
			&["owner", "bridge", "type"],
		);
		let successful_events = counter_vec(
			&registry,
			"asmux_successful_events",
			"Number of events that were successfully sent to the target appservice",
			&["owner", "bridge", "type"],
		);
		let failed_events = counter_vec(
			&registry,
			"asmux_failed_events",
			"Number of events that could not be sent to the target appservice",
			&["owner", "bridge", "type"],
		);

		let expired_pdus =
			IntCounter::new("asmux_expired_pdus", "Number of PDUs dropped by the stale policy")
				.expect("valid counter opts");
		registry
			.register(Box::new(expired_pdus.clone()))
			.expect("unique counter name");

		let connected_websockets =
			IntGauge::new("asmux_connected_websockets", "Number of open bridge websockets")
				.expect("valid gauge opts");
		registry
			.register(Box::new(connected_websockets.clone()))
			.expect("unique gauge name");

		let wakeup_pushes =
			IntCounter::new("asmux_wakeup_pushes", "Number of wakeup push notifications sent")
				.expect("valid counter opts");
		registry
			.register(Box::new(wakeup_pushes.clone()))
			.expect("unique counter name");

		Self {
			registry,
			received_events,
			dropped_events,
			accepted_events,
			successful_events,
			failed_events,
			expired_pdus,
			connected_websockets,
			wakeup_pushes,
		}
	}

	#[inline]
	#[must_use]
	pub fn registry(&self) -> &Registry { &self.registry }
}

impl Default for Metrics {
	fn default() -> Self { Self::new() }
}

fn counter_vec(
	registry: &Registry,
	name: &str,
	help: &str,
	labels: &[&str],
) -> IntCounterVec {
	let counter =
		IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");

	registry
		.register(Box::new(counter.clone()))
		.expect("unique counter name");

	counter
}
