use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant Matrix application service proxy and multiplexer
#[derive(Debug, Parser)]
#[command(name = "asmux", version)]
pub(crate) struct Args {
	/// Path to the configuration file; may be given more than once, later
	/// files override earlier ones
	#[arg(short, long, default_value = "asmux.toml")]
	pub(crate) config: Vec<PathBuf>,

	/// Generate the homeserver registration file and exit
	#[arg(short = 'g', long)]
	pub(crate) generate_registration: bool,

	/// Where to write the generated registration (not needed for running
	/// asmux)
	#[arg(short, long, default_value = "registration.yaml")]
	pub(crate) registration: PathBuf,
}

#[cfg(test)]
mod tests {
	use clap::Parser;

	use super::Args;

	#[test]
	fn defaults() {
		let args = Args::parse_from(["asmux"]);
		assert!(!args.generate_registration);
		assert_eq!(args.config.len(), 1);
		assert_eq!(args.registration.to_str(), Some("registration.yaml"));
	}

	#[test]
	fn multiple_config_files() {
		let args = Args::parse_from(["asmux", "-c", "base.toml", "-c", "override.toml"]);
		assert_eq!(args.config.len(), 2);
	}
}
