use clap::Parser;
use droidplane_cli::cli::Cli;
use droidplane_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = commands::dispatch(cli.command).await {
		error!(target = "droidplane", error = %err, "command failed");
		eprintln!("error: {err:#}");
		std::process::exit(1);
	}
}
