//! Single-client message channel endpoints.
//!
//! Two platform backends expose the same endpoint surface:
//! - Unix domain sockets driven by `poll(2)` (Linux/macOS)
//! - Overlapped named pipes in message mode (Windows)
//!
//! An endpoint issues connect and read operations without blocking. Each call
//! reports [`Progress::Complete`] or [`Progress::Pending`]; pending operations
//! are resolved by blocking in [`PipeEndpoint::wait`] (the one completion
//! signal) and then calling [`PipeEndpoint::finish`]. This is the lowest layer
//! of layoutbridge; the channel server's event loop is built on it.

pub mod address;
pub mod error;
pub mod traits;

#[cfg(unix)]
pub mod uds;
#[cfg(unix)]
pub mod uds_endpoint;

#[cfg(windows)]
pub mod named_pipe;

pub use address::{channel_address, default_runtime_dir};
pub use error::{Result, TransportError};
pub use traits::{
    Delivery, EndpointConfig, IpcStream, Progress, DEFAULT_BUFFER_SIZE, DEFAULT_CLIENT_TIMEOUT,
};

#[cfg(unix)]
pub use uds::UnixDomainSocket;
#[cfg(unix)]
pub use uds_endpoint::{
    UdsCanceller as PipeCanceller, UdsEndpoint as PipeEndpoint, UdsWriter as PipeWriter,
};

#[cfg(windows)]
pub use named_pipe::{
    NamedPipeCanceller as PipeCanceller, NamedPipeEndpoint as PipeEndpoint,
    NamedPipeWriter as PipeWriter,
};

/// Connect to a listening channel as a client (blocking).
pub fn connect(address: impl AsRef<std::path::Path>) -> Result<IpcStream> {
    #[cfg(unix)]
    {
        UnixDomainSocket::connect(address)
    }

    #[cfg(windows)]
    {
        named_pipe::connect(address)
    }
}
