//! Tracing setup for the droidplane binary.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `-v` enables info and `-vv` debug for
/// droidplane targets. Logs go to stderr so `render` output stays clean.
pub fn init_logging(verbose: u8) {
	let default_filter = match verbose {
		0 => "warn",
		1 => "warn,droidplane=info",
		_ => "info,droidplane=debug",
	};
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
		.with_writer(std::io::stderr)
		.init();
}
