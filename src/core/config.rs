use std::{net::SocketAddr, path::Path};

use figment::{
	Figment,
	providers::{Env, Format, Toml},
};
use serde::Deserialize;

use crate::{Err, Result, err};

/// All of asmux's configuration, deserialized from the config file with
/// `ASMUX_*` environment overrides layered on top.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
	/// Address clients use to reach the homeserver.
	#[serde(default = "default_homeserver_address")]
	pub homeserver_address: String,

	/// The server_name of the homeserver; the part after `:` in MXIDs.
	pub homeserver_domain: String,

	/// Appservice id in the generated registration.
	#[serde(default = "default_appservice_id")]
	pub appservice_id: String,

	/// Publicly reachable address of this proxy, written into the
	/// registration as the appservice url.
	#[serde(default)]
	pub appservice_address: String,

	/// Localpart of the proxy-level appservice bot.
	#[serde(default = "default_bot_username")]
	pub bot_username: String,

	/// Token the proxy uses towards the homeserver.
	#[serde(default = "default_unconfigured_token")]
	pub as_token: String,

	/// Token the homeserver uses towards the proxy.
	#[serde(default = "default_unconfigured_token")]
	pub hs_token: String,

	/// Localpart prefix of the user namespace, i.e. the part between `@`
	/// and the owner in ghost MXIDs.
	#[serde(default)]
	pub namespace_prefix: String,

	#[serde(default = "true_fn")]
	pub namespace_exclusive: bool,

	#[serde(default = "default_listen_host")]
	pub listen_host: String,

	#[serde(default = "default_listen_port")]
	pub listen_port: u16,

	/// Postgres URL of the appservice/user/room store.
	#[serde(default = "default_database")]
	pub database: String,

	/// Redis URL backing the transaction streams and the cache
	/// invalidation pub/sub.
	#[serde(default = "default_redis")]
	pub redis: String,

	/// Per-bridge remote state endpoint; `{owner}` and `{prefix}` are
	/// substituted.
	pub remote_status_endpoint: Option<String>,

	/// Bridge state-event endpoint; `{owner}` and `{prefix}` are
	/// substituted.
	pub bridge_status_endpoint: Option<String>,

	/// Message checkpoint endpoint; `{owner}` and `{prefix}` are
	/// substituted.
	pub checkpoint_endpoint: Option<String>,

	pub sync_proxy_url: Option<String>,

	pub sync_proxy_token: Option<String>,

	/// Address the sync proxy should call back to reach this asmux.
	pub sync_proxy_own_address: Option<String>,

	#[serde(default = "default_log")]
	pub log: String,

	#[serde(default = "true_fn")]
	pub log_colors: bool,
}

impl Config {
	pub fn load<'a, I>(paths: I) -> Result<Self>
	where
		I: Iterator<Item = &'a Path>,
	{
		let mut figment = Figment::new();
		for path in paths {
			figment = figment.merge(Toml::file(path));
		}

		let config = figment
			.merge(Env::prefixed("ASMUX_").split("__"))
			.extract::<Self>()?;

		Ok(config)
	}

	pub fn check(&self) -> Result {
		if self.homeserver_domain.is_empty() || self.homeserver_domain == "example.com" {
			return Err!(Config(
				"homeserver_domain",
				"You must set the homeserver domain to your real server name.",
			));
		}

		if self.tokens_are_placeholders() {
			return Err!(Config(
				"as_token",
				"Tokens are unconfigured. Did you forget to generate the registration?",
			));
		}

		if !self.database.starts_with("postgres://")
			&& !self.database.starts_with("postgresql://")
		{
			return Err!(Config("database", "Only postgres database URLs are supported."));
		}

		Ok(())
	}

	pub fn listen_addr(&self) -> Result<SocketAddr> {
		format!("{}:{}", self.listen_host, self.listen_port)
			.parse()
			.map_err(|e| err!(Config("listen_host", "Invalid listen address: {e}")))
	}

	/// Whether the tokens still carry their generate-me placeholder.
	#[must_use]
	pub fn tokens_are_placeholders(&self) -> bool {
		self.as_token == default_unconfigured_token()
			|| self.hs_token == default_unconfigured_token()
	}

	/// `@{namespace_prefix}`, the start of every ghost MXID.
	#[must_use]
	pub fn mxid_prefix(&self) -> String { format!("@{}", self.namespace_prefix) }

	/// `:{homeserver_domain}`, the end of every local MXID.
	#[must_use]
	pub fn mxid_suffix(&self) -> String { format!(":{}", self.homeserver_domain) }
}

fn true_fn() -> bool { true }

fn default_homeserver_address() -> String { "http://localhost:8008".to_owned() }

fn default_appservice_id() -> String { "asmux".to_owned() }

fn default_bot_username() -> String { "asmuxbot".to_owned() }

fn default_unconfigured_token() -> String {
	"generate-the-registration-to-fill-this".to_owned()
}

fn default_listen_host() -> String { "0.0.0.0".to_owned() }

fn default_listen_port() -> u16 { 29_316 }

fn default_database() -> String { "postgres://asmux@localhost/asmux".to_owned() }

fn default_redis() -> String { "redis://localhost:6379".to_owned() }

fn default_log() -> String { "info".to_owned() }

#[cfg(test)]
mod tests {
	use figment::{Figment, providers::Serialized};

	use super::Config;

	fn minimal() -> Config {
		Figment::new()
			.merge(Serialized::defaults(serde_json::json!({
				"homeserver_domain": "example.org",
			})))
			.extract()
			.expect("minimal config extracts")
	}

	#[test]
	fn defaults_fill_in() {
		let config = minimal();
		assert_eq!(config.listen_port, 29_316);
		assert_eq!(config.appservice_id, "asmux");
		assert!(config.namespace_exclusive);
		assert!(config.remote_status_endpoint.is_none());
	}

	#[test]
	fn mxid_affixes() {
		let mut config = minimal();
		config.namespace_prefix = "acme_".to_owned();
		assert_eq!(config.mxid_prefix(), "@acme_");
		assert_eq!(config.mxid_suffix(), ":example.org");
	}

	#[test]
	fn unconfigured_tokens_fail_check() {
		let config = minimal();
		assert!(config.check().is_err());
	}

	#[test]
	fn configured_tokens_pass_check() {
		let mut config = minimal();
		config.as_token = "abc".to_owned();
		config.hs_token = "def".to_owned();
		assert!(config.check().is_ok());
	}
}
