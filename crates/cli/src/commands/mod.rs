mod render;
mod serve;

use crate::cli::Commands;

pub use serve::build_state;

pub async fn dispatch(command: Commands) -> anyhow::Result<()> {
	match command {
		Commands::Serve(args) => serve::run(args).await?,
		Commands::Render(args) => render::run(args)?,
	}

	Ok(())
}
