use std::sync::Arc;

use asmux_core::{Err, Result};
use asmux_service::{Services, directory::Appservice};
use http::{HeaderMap, header::AUTHORIZATION};
use uuid::Uuid;

/// Extracts a bearer token from the Authorization header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "))
}

/// Splits a real appservice token (`{uuid}-{as_token}`) into its parts.
#[must_use]
pub fn split_real_as_token(token: &str) -> Option<(Uuid, &str)> {
	// a textual uuid is 36 chars, followed by the joining dash
	let (id, rest) = (token.get(..36)?, token.get(36..)?);
	let id = Uuid::parse_str(id).ok()?;
	let as_token = rest.strip_prefix('-')?;

	Some((id, as_token))
}

/// Resolves and verifies the appservice a real-as-token belongs to.
pub async fn find_appservice(
	services: &Arc<Services>,
	token: &str,
) -> Result<Arc<Appservice>> {
	let Some((id, as_token)) = split_real_as_token(token) else {
		return Err!(Request(UNAUTHORIZED, "Invalid authorization token"));
	};

	let Some(appservice) = services.directory.get_appservice(id).await? else {
		return Err!(Request(UNAUTHORIZED, "Invalid authorization token"));
	};

	if appservice.as_token != as_token {
		return Err!(Request(UNAUTHORIZED, "Invalid authorization token"));
	}

	Ok(appservice)
}

/// Verifies the homeserver-side token on inbound appservice requests.
pub fn check_hs_token(services: &Services, token: Option<&str>) -> Result {
	let Some(token) = token else {
		return Err!(Request(UNAUTHORIZED, "Missing authorization header"));
	};

	if token != services.server.config.hs_token {
		return Err!(Request(FORBIDDEN, "Incorrect access token"));
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use uuid::Uuid;

	use super::split_real_as_token;

	#[test]
	fn real_as_token_splits() {
		let id = Uuid::new_v4();
		let token = format!("{id}-secret-token");
		let (got_id, got_token) = split_real_as_token(&token).unwrap();

		assert_eq!(got_id, id);
		assert_eq!(got_token, "secret-token");
	}

	#[test]
	fn garbage_rejected() {
		assert!(split_real_as_token("").is_none());
		assert!(split_real_as_token("not-a-uuid").is_none());
		assert!(split_real_as_token("00000000-0000-0000-0000-000000000000").is_none());
		assert!(split_real_as_token("00000000-0000-0000-0000-000000000000x").is_none());
	}

	#[test]
	fn nil_uuid_with_token_splits() {
		let (id, token) =
			split_real_as_token("00000000-0000-0000-0000-000000000000-tkn").unwrap();
		assert_eq!(id, Uuid::nil());
		assert_eq!(token, "tkn");
	}
}
