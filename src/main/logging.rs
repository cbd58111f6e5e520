use asmux_core::{Config, Result, err};
use tracing_subscriber::EnvFilter;

pub(crate) fn init(config: &Config) -> Result {
	let filter = EnvFilter::builder()
		.parse(&config.log)
		.map_err(|e| err!(Config("log", "{e}.")))?;

	let subscriber = tracing_subscriber::fmt()
		.with_ansi(config.log_colors)
		.with_env_filter(filter)
		.finish();

	tracing::subscriber::set_global_default(subscriber)
		.map_err(|e| err!("Failed to initialize logging: {e}"))?;

	Ok(())
}
