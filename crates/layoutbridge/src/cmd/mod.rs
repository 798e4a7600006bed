use clap::{Args, Subcommand};
use std::path::PathBuf;

use layoutbridge::bridge::{BridgeConfig, DEFAULT_APP_ID, DEFAULT_CHANNEL_SUFFIX};
use layoutbridge::transport::default_runtime_dir;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod run;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bridge in the foreground until exit.
    Run(RunArgs),
    /// Send one command to a running bridge.
    ///
    /// The bridge serves a single client; disconnecting without `exit` ends it.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Identity of the bridge instance and its channel.
#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Application identity (instance lock and signal names).
    #[arg(long, env = "LAYOUTBRIDGE_APP_ID", default_value = DEFAULT_APP_ID)]
    pub app_id: String,
    /// Suffix appended to the app id to name the channel.
    #[arg(long, env = "LAYOUTBRIDGE_CHANNEL_SUFFIX", default_value = DEFAULT_CHANNEL_SUFFIX)]
    pub channel_suffix: String,
    /// Directory for the socket and lock file. Default: $XDG_RUNTIME_DIR or the temp dir.
    #[arg(long, env = "LAYOUTBRIDGE_RUNTIME_DIR", value_name = "DIR")]
    pub runtime_dir: Option<PathBuf>,
}

impl ChannelArgs {
    pub fn to_config(&self) -> BridgeConfig {
        BridgeConfig {
            app_id: self.app_id.clone(),
            channel_suffix: self.channel_suffix.clone(),
            runtime_dir: self.runtime_dir.clone().unwrap_or_else(default_runtime_dir),
            ..BridgeConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
    /// Client timeout in milliseconds.
    #[arg(long, env = "LAYOUTBRIDGE_CLIENT_TIMEOUT_MS", default_value_t = 5000)]
    pub client_timeout_ms: u64,
    /// Channel buffer size in bytes, length prefix included.
    #[arg(long, env = "LAYOUTBRIDGE_BUFFER_SIZE", default_value_t = 512)]
    pub buffer_size: usize,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub channel: ChannelArgs,
    #[command(subcommand)]
    pub request: SendRequest,
}

#[derive(Subcommand, Debug)]
pub enum SendRequest {
    /// Ask the bridge to exit.
    Exit,
    /// Ask the hook provider to switch a window's layout.
    #[command(allow_negative_numbers = true)]
    ChangeLayout(ChangeLayoutArgs),
}

#[derive(Args, Debug)]
pub struct ChangeLayoutArgs {
    /// Target window handle (decimal or 0x-prefixed hex).
    #[arg(value_parser = parse_i32)]
    pub window: i32,
    /// Layout identifier.
    #[arg(value_parser = parse_i32)]
    pub layout_id: i32,
    /// Layout handle.
    #[arg(value_parser = parse_i32)]
    pub layout_handle: i32,
    /// Wait for one response frame and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a response when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_i32(input: &str) -> Result<i32, String> {
    let trimmed = input.trim();
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        // Hex handles are bit patterns: 0xFFFFFFFF is -1.
        Some(hex) => u32::from_str_radix(hex, 16).map(|v| v as i32),
        None => trimmed.parse::<i32>(),
    };
    parsed.map_err(|err| format!("invalid integer {input:?}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_i32_accepts_decimal_and_hex() {
        assert_eq!(parse_i32("7"), Ok(7));
        assert_eq!(parse_i32("-1"), Ok(-1));
        assert_eq!(parse_i32("0x0409"), Ok(0x0409));
        assert_eq!(parse_i32("0xFFFFFFFF"), Ok(-1));
        assert!(parse_i32("seven").is_err());
        assert!(parse_i32("0x1FFFFFFFF").is_err());
    }

    #[test]
    fn channel_args_fill_config() {
        let args = ChannelArgs {
            app_id: "App".to_string(),
            channel_suffix: "Pipe".to_string(),
            runtime_dir: Some(PathBuf::from("/tmp/lb")),
        };
        let config = args.to_config();
        assert_eq!(config.channel_name(), "AppPipe");
        assert_eq!(config.runtime_dir, PathBuf::from("/tmp/lb"));
    }
}
