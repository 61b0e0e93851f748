mod cli;
mod commands;
mod error;
mod logging;

use clap::{CommandFactory, Parser};

use fleetlink_config::{Config, ConfigError};

use crate::cli::{Cli, Command};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config file, so load it first. A
    // broken file still gets reported through the normal error path.
    let loaded = fleetlink_config::load_config(cli.global.config.as_deref());
    let section = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    let guard = logging::init(&cli.global, &section);

    if let Err(err) = run(cli, loaded).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        drop(guard);
        std::process::exit(code);
    }
}

async fn run(cli: Cli, loaded: Result<Config, ConfigError>) -> Result<(), CliError> {
    match cli.command {
        Command::Config(args) => commands::config_cmd::handle(&args, &cli.global, loaded),

        Command::Completions(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "fleetlink", &mut std::io::stdout());
            Ok(())
        }

        Command::Serve(args) => {
            tracing::debug!(?args, "starting gateway");
            commands::serve::handle(&args, loaded?).await
        }

        Command::SimulateAgent(args) => commands::simulate::handle(&args).await,
    }
}
