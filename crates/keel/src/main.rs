//! Keel CLI entry point.

use clap::Parser;
use color_eyre::eyre::Result;

use keel::cli::{Cli, Commands, LogFormat, init_tracing};
use keel::exec::{ExecRequest, container_init};

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // `keel exec` re-entry: setns needs a single-threaded process.
    if let Some(request) = ExecRequest::from_env()? {
        init_tracing(false, LogFormat::Text)?;
        let code = request.run()?;
        std::process::exit(code);
    }

    // Parse CLI arguments
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.log_format)?;

    if matches!(cli.command, Commands::Init) {
        container_init()?;
        return Ok(());
    }

    // Execute command
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(cli.execute())
}
