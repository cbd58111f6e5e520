use rand::{Rng, distributions::Alphanumeric, thread_rng};

#[must_use]
pub fn string(length: usize) -> String {
	thread_rng()
		.sample_iter(Alphanumeric)
		.take(length)
		.map(char::from)
		.collect()
}

/// Lowercase alphanumeric secret, the shape used for generated registration
/// tokens.
#[must_use]
pub fn token(length: usize) -> String {
	const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

	let mut rng = thread_rng();
	(0..length)
		.map(|_| {
			let idx = rng.gen_range(0..CHARSET.len());
			char::from(CHARSET[idx])
		})
		.collect()
}
