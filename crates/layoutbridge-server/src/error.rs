use layoutbridge_frame::{FrameError, PROTOCOL_ERROR_CODE};
use layoutbridge_transport::TransportError;

/// Errors raised by the channel server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The channel or its completion signal could not be created. Fatal,
    /// reported before any client is accepted.
    #[error("{reason}: {source}")]
    Setup {
        reason: &'static str,
        source: TransportError,
    },

    /// A connect, read, or write failed after startup. Fatal to the running
    /// instance.
    #[error("{reason}: {source}")]
    ChannelIo {
        reason: &'static str,
        source: std::io::Error,
    },

    /// A frame could not be encoded or decoded. The channel keeps serving.
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
}

impl ServerError {
    /// Numeric code for user-facing reports: the OS error code when one is
    /// known, otherwise `-1`.
    pub fn code(&self) -> i32 {
        let os_code = match self {
            ServerError::Setup { source, .. } => source.os_code(),
            ServerError::ChannelIo { source, .. } => source.raw_os_error(),
            ServerError::Protocol(FrameError::Io(source)) => source.raw_os_error(),
            ServerError::Protocol(_) => None,
        };
        os_code.unwrap_or(PROTOCOL_ERROR_CODE)
    }

    /// Whether the error ends the channel instance.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ServerError::Protocol(_))
    }

    /// Short human-readable reason without the underlying cause.
    pub fn reason(&self) -> &'static str {
        match self {
            ServerError::Setup { reason, .. } | ServerError::ChannelIo { reason, .. } => *reason,
            ServerError::Protocol(_) => "Incorrect command.",
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
