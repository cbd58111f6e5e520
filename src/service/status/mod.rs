use std::sync::Arc;

use asmux_core::{Result, Server, debug, utils::time::now_millis, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{directory::Appservice, service};

pub const BRIDGE_UNREACHABLE: &str = "BRIDGE_UNREACHABLE";

/// A bridge's self-reported (or asmux-synthesized) connection state.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BridgeState {
	#[serde(rename = "stateEvent")]
	pub state_event: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message: Option<String>,

	#[serde(default = "now_millis")]
	pub timestamp: u64,
}

impl BridgeState {
	#[must_use]
	pub fn unreachable(error: &str) -> Self {
		Self {
			state_event: BRIDGE_UNREACHABLE.to_owned(),
			error: Some(error.to_owned()),
			message: None,
			timestamp: now_millis(),
		}
	}

	/// The state reported when a ping could not reach the bridge at all.
	#[must_use]
	pub fn ping_error(error: &str, message: Option<String>) -> Self {
		Self {
			state_event: BRIDGE_UNREACHABLE.to_owned(),
			error: Some(error.to_owned()),
			message,
			timestamp: now_millis(),
		}
	}

	/// Interprets a ping response body; anything that does not carry a
	/// usable state counts as unreachable.
	#[must_use]
	pub fn from_remote(raw: Value) -> Self {
		serde_json::from_value(raw)
			.unwrap_or_else(|_| Self::ping_error("http-not-json", None))
	}

	#[must_use]
	pub fn is_unreachable(&self) -> bool {
		self.state_event == BRIDGE_UNREACHABLE || self.error.is_some()
	}
}

/// Relays bridge state, ping results and message checkpoints to the
/// configured reporting endpoints. Every post is fire-and-forget; a
/// failure is worth a warning and nothing more.
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
	/// Forwards a bridge-supplied state object to the remote status
	/// endpoint.
	pub async fn send_remote_status(&self, appservice: &Appservice, state: Value) {
		let Some(endpoint) = &self.server.config.remote_status_endpoint else {
			debug!("No remote status endpoint configured, dropping status update");
			return;
		};

		debug!("Sending remote status for {} to API server", appservice.name());
		self.post(appservice, endpoint, state).await;
	}

	/// Posts an asmux-generated state event for the bridge.
	pub async fn send_bridge_status(&self, appservice: &Appservice, state: &BridgeState) {
		let Some(endpoint) = &self.server.config.bridge_status_endpoint else {
			debug!("No bridge status endpoint configured, dropping state event");
			return;
		};

		debug!(
			appservice = %appservice.name(),
			state = %state.state_event,
			"Sending bridge state event",
		);

		let body = serde_json::to_value(state).expect("bridge state serializes");
		self.post(appservice, endpoint, body).await;
	}

	/// Forwards a `{"checkpoints": [...]}` blob to the checkpoint
	/// endpoint.
	pub async fn send_message_checkpoints(&self, appservice: &Appservice, blob: Value) {
		let Some(endpoint) = &self.server.config.checkpoint_endpoint else {
			debug!("No checkpoint endpoint configured, dropping checkpoints");
			return;
		};

		self.post(appservice, endpoint, blob).await;
	}

	/// Synthesizes delivery checkpoints for PDUs evicted by the stale
	/// policy.
	pub async fn report_expired_pdu(&self, appservice: &Appservice, expired: Vec<Value>) {
		let checkpoints: Vec<Value> = expired
			.iter()
			.map(|event| {
				json!({
					"event_id": event.get("event_id"),
					"room_id": event.get("room_id"),
					"step": "BRIDGE",
					"status": "TIMEOUT",
					"reported_by": "ASMUX",
					"retry_num": 0,
					"message_type": event.get("type"),
					"timestamp": now_millis(),
					"info": "dropped old event",
				})
			})
			.collect();

		self.send_message_checkpoints(appservice, json!({ "checkpoints": checkpoints }))
			.await;
	}

	async fn post(&self, appservice: &Appservice, endpoint: &str, body: Value) {
		let url = template(endpoint, appservice);
		let result = self
			.services
			.client()
			.status
			.post(&url)
			.bearer_auth(appservice.real_as_token())
			.json(&body)
			.send()
			.await;

		match result {
			| Ok(response) if response.status().is_success() => {},
			| Ok(response) => {
				warn!(
					"Status post for {} to {url} returned HTTP {}",
					appservice.name(),
					response.status(),
				);
			},
			| Err(e) => {
				warn!("Status post for {} to {url} failed: {e}", appservice.name());
			},
		}
	}
}

fn template(endpoint: &str, appservice: &Appservice) -> String {
	endpoint
		.replace("{owner}", &appservice.owner)
		.replace("{prefix}", &appservice.prefix)
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use uuid::Uuid;

	use super::{BridgeState, template};
	use crate::directory::Appservice;

	fn appservice() -> Appservice {
		Appservice {
			id: Uuid::nil(),
			owner: "acme".to_owned(),
			prefix: "telegram".to_owned(),
			bot: "bot".to_owned(),
			address: String::new(),
			hs_token: "hs".to_owned(),
			as_token: "as".to_owned(),
			push: false,
			push_key: None,
			config_password_hash: None,
			config_password_expiry: None,
			login_token: None,
		}
	}

	#[test]
	fn endpoint_templating() {
		let url = template("https://api.example.com/bridge/{owner}/{prefix}/state", &appservice());
		assert_eq!(url, "https://api.example.com/bridge/acme/telegram/state");
	}

	#[test]
	fn ping_errors_are_unreachable() {
		let state = BridgeState::ping_error("io-timeout", None);
		assert!(state.is_unreachable());
		assert_eq!(state.error.as_deref(), Some("io-timeout"));
	}

	#[test]
	fn remote_state_round_trips() {
		let state = BridgeState::from_remote(json!({
			"stateEvent": "RUNNING",
			"timestamp": 5,
		}));
		assert!(!state.is_unreachable());
		assert_eq!(state.state_event, "RUNNING");
	}

	#[test]
	fn real_as_token_shape() {
		let az = appservice();
		assert_eq!(
			az.real_as_token(),
			"00000000-0000-0000-0000-000000000000-as",
		);
	}
}
