use std::time::Duration;

use layoutbridge::{Bridge, LoopbackHook, Shutdown};
use tracing::info;

use crate::cmd::RunArgs;
use crate::exit::{bridge_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, TRANSPORT_ERROR};

pub fn run(args: RunArgs) -> CliResult<i32> {
    let config = layoutbridge::BridgeConfig {
        client_timeout: Duration::from_millis(args.client_timeout_ms),
        buffer_size: args.buffer_size,
        ..args.channel.to_config()
    };
    info!(
        channel = %config.channel_name(),
        path = ?config.channel_address(),
        "starting bridge"
    );

    let bridge = Bridge::builder(config)
        .hook(Box::new(LoopbackHook::new()))
        .build()
        .map_err(|err| bridge_error("bridge startup failed", err))?;

    let handle = bridge.handle();
    ctrlc::set_handler(move || {
        handle.request_exit();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;

    let shutdown = bridge
        .run()
        .map_err(|err| bridge_error("bridge failed", err))?;

    Ok(exit_code(shutdown))
}

fn exit_code(shutdown: Shutdown) -> i32 {
    match shutdown {
        Shutdown::ExitRequested => SUCCESS,
        Shutdown::ClientLost => FAILURE,
        Shutdown::ChannelFailed { .. } => TRANSPORT_ERROR,
    }
}
