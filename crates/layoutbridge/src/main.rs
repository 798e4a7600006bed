mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::LogOptions;
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "layoutbridge",
    version,
    about = "Keyboard layout hook bridge serving one IPC client"
)]
struct Cli {
    /// Output format for printed responses.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    #[command(flatten)]
    log: LogOptions,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    cli.log.init();

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
