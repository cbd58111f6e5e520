use std::sync::Arc;

use asmux_core::{Err, Result, Server, debug, trace, warn};
use serde_json::{Value, json};

use crate::{directory::Appservice, service};

/// RPC client towards the sibling sync proxy, which acts as a Matrix
/// client on behalf of each bridge.
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
	/// Asks the sync proxy to start syncing for an appservice. `data` is
	/// the bridge-supplied `start_sync` payload carrying the bot's access
	/// token and device id.
	pub async fn start(&self, appservice: &Appservice, data: &Value) -> Result<Value> {
		let config = &self.server.config;
		let url = self.endpoint(appservice)?;
		let user_id = format!(
			"{}{}_{}_{}{}",
			config.mxid_prefix(),
			appservice.owner,
			appservice.prefix,
			appservice.bot,
			config.mxid_suffix(),
		);

		let body = json!({
			"appservice_id": appservice.id,
			"user_id": user_id,
			"bot_access_token": data.get("access_token"),
			"device_id": data.get("device_id"),
			"hs_token": config.hs_token,
			"address": config.sync_proxy_own_address,
			"is_proxy": true,
		});

		debug!("Requesting sync proxy start for {}", appservice.id);
		trace!("Sync proxy data: {body:?}");

		let response = self
			.services
			.client()
			.syncproxy
			.put(&url)
			.bearer_auth(self.token()?)
			.json(&body)
			.send()
			.await?;

		Self::read_response(response).await
	}

	/// Asks the sync proxy to stop syncing for an appservice. Failures are
	/// logged and swallowed; this runs on teardown paths.
	pub async fn stop(&self, appservice: &Appservice) {
		let result = self.try_stop(appservice).await;
		match result {
			| Ok(()) => debug!("Stopped sync proxy for {}", appservice.id),
			| Err(e) => {
				warn!("Failed to request sync proxy stop for {}: {e}", appservice.id);
			},
		}
	}

	async fn try_stop(&self, appservice: &Appservice) -> Result {
		let url = self.endpoint(appservice)?;

		debug!("Requesting sync proxy stop for {}", appservice.id);
		let response = self
			.services
			.client()
			.syncproxy
			.delete(&url)
			.bearer_auth(self.token()?)
			.send()
			.await?;

		Self::read_response(response).await?;
		Ok(())
	}

	fn endpoint(&self, appservice: &Appservice) -> Result<String> {
		let Some(base) = &self.server.config.sync_proxy_url else {
			return Err!("Sync proxy is not configured");
		};

		Ok(format!(
			"{}/_matrix/client/unstable/fi.mau.syncproxy/{}",
			base.trim_end_matches('/'),
			appservice.id,
		))
	}

	fn token(&self) -> Result<&str> {
		self.server
			.config
			.sync_proxy_token
			.as_deref()
			.ok_or_else(|| asmux_core::err!("Sync proxy token is not configured"))
	}

	async fn read_response(response: reqwest::Response) -> Result<Value> {
		let status = response.status();
		let body: Value = response.json().await.unwrap_or(Value::Null);
		if status.as_u16() >= 400 {
			let errcode = body
				.get("errcode")
				.and_then(Value::as_str)
				.unwrap_or("M_UNKNOWN");
			let error = body
				.get("error")
				.and_then(Value::as_str)
				.unwrap_or("Sync proxy request failed");

			return Err!(Request(BAD_GATEWAY, "{errcode}: {error}"));
		}

		Ok(body)
	}
}
