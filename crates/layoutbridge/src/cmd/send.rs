use std::time::Duration;

use layoutbridge::frame::{Command, FrameConfig, FrameReader, FrameWriter, Response};
use layoutbridge::transport::{connect, DEFAULT_CLIENT_TIMEOUT};
use tracing::debug;

use crate::cmd::{SendArgs, SendRequest};
use crate::exit::{
    frame_error, protocol_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, USAGE,
};
use crate::output::{print_response, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let address = args.channel.to_config().channel_address();
    let (command, wait) = match &args.request {
        SendRequest::Exit => (Command::Exit, None),
        SendRequest::ChangeLayout(change) => {
            let command = Command::ChangeLayout {
                window: change.window,
                layout_id: change.layout_id,
                layout_handle: change.layout_handle,
            };
            let wait = if change.wait {
                Some(parse_duration(&change.wait_timeout)?)
            } else {
                None
            };
            (command, wait)
        }
    };

    let stream = connect(&address).map_err(|err| transport_error("connect failed", err))?;
    debug!(path = ?address, opcode = command.opcode(), "sending command");

    let reader = match wait {
        Some(timeout) => {
            let stream = stream
                .try_clone()
                .map_err(|err| transport_error("stream clone failed", err))?;
            let config = FrameConfig {
                read_timeout: Some(timeout),
                ..FrameConfig::default()
            };
            let reader = FrameReader::with_config_ipc(stream, config)
                .map_err(|err| frame_error("read timeout setup failed", err))?;
            Some(reader)
        }
        None => None,
    };

    let config = FrameConfig {
        write_timeout: Some(DEFAULT_CLIENT_TIMEOUT),
        ..FrameConfig::default()
    };
    let mut writer = FrameWriter::with_config_ipc(stream, config)
        .map_err(|err| frame_error("write timeout setup failed", err))?;
    writer
        .send(&command.encode())
        .map_err(|err| frame_error("send failed", err))?;

    let Some(mut reader) = reader else {
        return Ok(SUCCESS);
    };

    let payload = reader
        .read_frame()
        .map_err(|err| frame_error("receive failed", err))?;
    let response =
        Response::decode(&payload).map_err(|err| protocol_error("invalid response", err))?;
    print_response(&response, format);

    match response {
        Response::LayoutChanged { .. } => Ok(SUCCESS),
        Response::Error { .. } => Ok(FAILURE),
    }
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
