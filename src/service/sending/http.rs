use std::time::Duration;

use asmux_core::{Events, debug, warn};
use serde_json::Value;

use crate::{directory::Appservice, status::BridgeState};

/// Maximum delivery attempts: transactions carrying PDUs are worth a long
/// retry; ephemeral-only traffic is cheap to drop.
#[must_use]
pub fn retry_budget(pdu_count: usize) -> u32 {
	if pdu_count > 0 { 10 } else { 2 }
}

#[must_use]
pub fn next_backoff(backoff: Duration) -> Duration { backoff.mul_f64(1.5) }

impl super::Service {
	/// `PUT {address}/_matrix/app/v1/transactions/{txn_id}` with bounded
	/// retries. Returns `"ok"` or `"http-gave-up"`.
	pub(super) async fn post_transaction(
		&self,
		appservice: &Appservice,
		events: &Events,
	) -> &'static str {
		let url = format!(
			"{}/_matrix/app/v1/transactions/{}",
			appservice.address.trim_end_matches('/'),
			events.txn_id,
		);
		let body = events.to_wire();

		let retries = retry_budget(events.pdu.len());
		let mut backoff = Duration::from_secs(1);
		let mut last_error = String::new();
		for attempt in 1..=retries {
			debug!(
				"Sending transaction {} to {} via HTTP, attempt #{attempt}",
				events.txn_id,
				appservice.name(),
			);

			let result = self
				.services
				.client()
				.appservice
				.put(&url)
				.query(&[("access_token", &appservice.hs_token)])
				.json(&body)
				.send()
				.await;

			match result {
				| Ok(response) if response.status().as_u16() < 400 => return "ok",
				| Ok(response) => {
					let status = response.status();
					let text = response.text().await.unwrap_or_default();
					last_error = format!("HTTP {status}: {text:?}");
					debug!(
						"Failed to send transaction {} to {}: {last_error}",
						events.txn_id,
						appservice.name(),
					);
				},
				| Err(e) => {
					last_error = e.to_string();
					debug!(
						"Failed to send transaction {} to {}: {last_error}",
						events.txn_id,
						appservice.name(),
					);
				},
			}

			// don't sleep after the last attempt
			if attempt < retries {
				tokio::time::sleep(backoff).await;
				backoff = next_backoff(backoff);
			}
		}

		warn!(
			"Gave up trying to send {} to {} (last error: {last_error})",
			events.txn_id,
			appservice.name(),
		);

		"http-gave-up"
	}

	/// Pings a push-mode appservice over HTTP, mapping every failure mode
	/// to a bridge state the caller can report.
	pub async fn ping(&self, appservice: &Appservice) -> BridgeState {
		let url = format!(
			"{}/_matrix/app/com.beeper.bridge_state",
			appservice.address.trim_end_matches('/'),
		);
		let owner_mxid = appservice.owner_mxid(&self.server.config.mxid_suffix());

		let result = self
			.services
			.client()
			.ping
			.post(&url)
			.query(&[("user_id", owner_mxid.as_str()), ("remote_id", "")])
			.bearer_auth(&appservice.hs_token)
			.send()
			.await;

		let response = match result {
			| Ok(response) => response,
			| Err(e) if e.is_timeout() => return BridgeState::ping_error("io-timeout", None),
			| Err(e) if e.is_connect() =>
				return BridgeState::ping_error("http-connection-error", Some(e.to_string())),
			| Err(e) => {
				warn!("Failed to ping {} ({}) via HTTP: {e}", appservice.name(), appservice.id);
				return BridgeState::ping_error("http-fatal-error", Some(e.to_string()));
			},
		};

		let status = response.status();
		match response.json::<Value>().await {
			| Ok(raw) => BridgeState::from_remote(raw),
			| Err(_) if status.as_u16() >= 300 => BridgeState::ping_error(
				&format!("ping-http-{}", status.as_u16()),
				Some("Ping returned non-JSON body".to_owned()),
			),
			| Err(_) => BridgeState::ping_error("http-not-json", None),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::{next_backoff, retry_budget};

	#[test]
	fn pdu_transactions_get_the_long_budget() {
		assert_eq!(retry_budget(1), 10);
		assert_eq!(retry_budget(25), 10);
	}

	#[test]
	fn ephemeral_only_gets_two_attempts() {
		assert_eq!(retry_budget(0), 2);
	}

	#[test]
	fn backoff_multiplies_by_three_halves() {
		let first = Duration::from_secs(1);
		let second = next_backoff(first);
		let third = next_backoff(second);

		assert_eq!(second, Duration::from_millis(1_500));
		assert_eq!(third, Duration::from_millis(2_250));
	}
}
