use layoutbridge::bridge::BridgeConfig;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("layoutbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let defaults = BridgeConfig::default();
    println!("name: layoutbridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "build_target: {}",
        option_env!("LAYOUTBRIDGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("channel_backend: {}", channel_backend());
    println!("default_channel: {}", defaults.channel_name());
    println!("default_address: {}", defaults.channel_address().display());
    println!("default_buffer_size: {}", defaults.buffer_size);
    println!(
        "default_client_timeout_ms: {}",
        defaults.client_timeout.as_millis()
    );

    Ok(SUCCESS)
}

fn channel_backend() -> &'static str {
    if cfg!(windows) {
        "named-pipe (overlapped, message mode)"
    } else {
        "unix-domain-socket (poll)"
    }
}
