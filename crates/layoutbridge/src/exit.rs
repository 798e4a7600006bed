use std::fmt;
use std::io;

use layoutbridge::frame::{FrameError, ProtocolError};
use layoutbridge::server::ServerError;
use layoutbridge::transport::TransportError;
use layoutbridge::BridgeError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => TRANSPORT_ERROR,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } | FrameError::Truncated { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
    }
}

pub fn protocol_error(context: &str, err: ProtocolError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn server_error(context: &str, err: ServerError) -> CliError {
    match err {
        ServerError::Setup { source, .. } => transport_error(context, source),
        ServerError::ChannelIo { .. } => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        ServerError::Protocol(err) => frame_error(context, err),
    }
}

pub fn bridge_error(context: &str, err: BridgeError) -> CliError {
    match err {
        BridgeError::AlreadyRunning { .. } => CliError::new(FAILURE, format!("{context}: {err}")),
        BridgeError::Server(err) => server_error(context, err),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}
