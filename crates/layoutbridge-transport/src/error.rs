use std::path::PathBuf;

/// Errors that can occur while creating or using a channel endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to create the channel at the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to create a supporting OS primitive (completion signal, wake socket).
    #[error("failed to create {what}: {source}")]
    Setup {
        what: &'static str,
        source: std::io::Error,
    },

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },
}

impl TransportError {
    /// Raw OS error code carried by this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            TransportError::Bind { source, .. }
            | TransportError::Connect { source, .. }
            | TransportError::Setup { source, .. }
            | TransportError::Io(source) => source.raw_os_error(),
            TransportError::PathTooLong { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
