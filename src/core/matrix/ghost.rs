/// Splits a bridge ghost MXID of the form
/// `{mxid_prefix}{owner}_{prefix}_{rest}{mxid_suffix}` into its
/// `(owner, prefix)` pair. Anything that does not match the shape yields
/// `None`; malformed state keys drop silently rather than failing the
/// whole transaction.
#[must_use]
pub fn parse<'a>(
	user_id: &'a str,
	mxid_prefix: &str,
	mxid_suffix: &str,
) -> Option<(&'a str, &'a str)> {
	let localpart = user_id
		.strip_prefix(mxid_prefix)?
		.strip_suffix(mxid_suffix)?;

	let mut parts = localpart.splitn(3, '_');
	let owner = parts.next()?;
	let prefix = parts.next()?;
	parts.next()?;

	Some((owner, prefix))
}

#[cfg(test)]
mod tests {
	use super::parse;

	#[test]
	fn well_formed_ghost() {
		let got = parse("@acme_telegram_bot:example.com", "@", ":example.com");
		assert_eq!(got, Some(("acme", "telegram")));
	}

	#[test]
	fn ghost_with_namespace_prefix() {
		let got = parse("@bridge_acme_telegram_12345:example.com", "@bridge_", ":example.com");
		assert_eq!(got, Some(("acme", "telegram")));
	}

	#[test]
	fn missing_ghost_part_rejected() {
		assert_eq!(parse("@acme_telegram:example.com", "@", ":example.com"), None);
	}

	#[test]
	fn foreign_server_rejected() {
		assert_eq!(parse("@acme_telegram_bot:other.com", "@", ":example.com"), None);
	}

	#[test]
	fn wrong_prefix_rejected() {
		assert_eq!(parse("@acme_telegram_bot:example.com", "@bridge_", ":example.com"), None);
	}

	#[test]
	fn empty_input_rejected() {
		assert_eq!(parse("", "@", ":example.com"), None);
	}
}
