use std::{fs, path::Path};

use asmux_core::{Config, Result, utils};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub(crate) struct Registration {
	id: String,
	url: String,
	as_token: String,
	hs_token: String,
	sender_localpart: String,
	rate_limited: bool,
	namespaces: Namespaces,
}

#[derive(Debug, Serialize)]
struct Namespaces {
	users: Vec<Namespace>,
	aliases: Vec<Namespace>,
}

#[derive(Debug, Serialize)]
struct Namespace {
	regex: String,
	exclusive: bool,
}

/// Writes the registration file the homeserver admin installs. Freshly
/// generated tokens are printed so they can be copied into the asmux
/// config; the homeserver and asmux must agree on both.
pub(crate) fn generate(config: &Config, path: &Path) -> Result {
	let registration = build(config);
	fs::write(path, serde_yaml::to_string(&registration)?)?;

	println!("Registration generated and saved to {}", path.display());
	if config.tokens_are_placeholders() {
		println!("as_token: {}", registration.as_token);
		println!("hs_token: {}", registration.hs_token);
		println!("Copy both tokens into your asmux config before starting the proxy.");
	}

	Ok(())
}

fn build(config: &Config) -> Registration {
	let (as_token, hs_token) = if config.tokens_are_placeholders() {
		(utils::rand::token(64), utils::rand::token(64))
	} else {
		(config.as_token.clone(), config.hs_token.clone())
	};

	let prefix = escape_regex(&config.namespace_prefix);
	let server_name = escape_regex(&config.homeserver_domain);

	Registration {
		id: config.appservice_id.clone(),
		url: config.appservice_address.clone(),
		as_token,
		hs_token,
		sender_localpart: config.bot_username.clone(),
		rate_limited: false,
		namespaces: Namespaces {
			users: vec![Namespace {
				regex: format!("@{prefix}.+:{server_name}"),
				exclusive: config.namespace_exclusive,
			}],
			aliases: vec![Namespace {
				regex: format!("#{prefix}.+:{server_name}"),
				exclusive: config.namespace_exclusive,
			}],
		},
	}
}

fn escape_regex(raw: &str) -> String {
	let mut escaped = String::with_capacity(raw.len());
	for c in raw.chars() {
		if !c.is_ascii_alphanumeric() {
			escaped.push('\\');
		}

		escaped.push(c);
	}

	escaped
}

#[cfg(test)]
mod tests {
	use figment::{Figment, providers::Serialized};

	use super::{build, escape_regex};

	fn config() -> asmux_core::Config {
		Figment::new()
			.merge(Serialized::defaults(serde_json::json!({
				"homeserver_domain": "example.org",
				"namespace_prefix": "acme_",
				"appservice_address": "https://asmux.example.org",
			})))
			.extract()
			.expect("test config extracts")
	}

	#[test]
	fn generated_tokens_are_fresh() {
		let registration = build(&config());
		assert_eq!(registration.as_token.len(), 64);
		assert_eq!(registration.hs_token.len(), 64);
		assert_ne!(registration.as_token, registration.hs_token);
	}

	#[test]
	fn configured_tokens_are_kept() {
		let mut config = config();
		config.as_token = "as".to_owned();
		config.hs_token = "hs".to_owned();

		let registration = build(&config);
		assert_eq!(registration.as_token, "as");
		assert_eq!(registration.hs_token, "hs");
	}

	#[test]
	fn namespaces_cover_ghosts_and_aliases() {
		let registration = build(&config());
		assert_eq!(registration.namespaces.users[0].regex, r"@acme\_.+:example\.org");
		assert_eq!(registration.namespaces.aliases[0].regex, r"#acme\_.+:example\.org");
		assert!(registration.namespaces.users[0].exclusive);
	}

	#[test]
	fn yaml_shape() {
		let yaml = serde_yaml::to_string(&build(&config())).unwrap();
		assert!(yaml.contains("id: asmux"));
		assert!(yaml.contains("url: https://asmux.example.org"));
		assert!(yaml.contains("sender_localpart: asmuxbot"));
		assert!(yaml.contains("rate_limited: false"));
	}
}
