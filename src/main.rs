use clap::Parser;
use fusion_recorder::utils::ErrorResponse;
use std::process::ExitCode;

mod cli;
mod commands;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    fusion_recorder::init_tracing(cli.verbose);

    tracing::debug!("fusion-recorder v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Record(args) => commands::record::execute(args, cli.json).await,
        Command::Config(args) => commands::config::execute(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                let response = ErrorResponse::from(&e);
                match serde_json::to_string(&response) {
                    Ok(json) => println!("{json}"),
                    Err(_) => eprintln!("Error: {e}"),
                }
            } else {
                eprintln!("Error: {e}");
            }
            ExitCode::from(e.exit_code())
        }
    }
}
