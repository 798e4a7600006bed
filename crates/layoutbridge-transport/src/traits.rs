use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Default number of bytes in each direction of the channel buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 512;

/// Default client timeout applied by the channel configuration.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Outcome of issuing or resolving a non-blocking channel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The operation is still in flight; wait on the completion signal.
    Pending,
    /// The operation completed, transferring this many bytes (0 for connects).
    Complete(usize),
}

/// How the endpoint delivers inbound bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Each completed read is exactly one message written by the peer.
    Message,
    /// Reads may split or coalesce messages; the reader must reassemble.
    Stream,
}

/// Endpoint creation parameters.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Read buffer capacity in bytes.
    pub buffer_size: usize,
    /// Bound applied to client-facing blocking operations.
    pub client_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }
}

/// A connected client-side stream implementing Read + Write.
///
/// On Unix, this wraps a Unix domain socket stream.
/// On Windows, this wraps a named pipe client handle.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    #[cfg(windows)]
    Pipe(std::fs::File),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            IpcStreamInner::Pipe(file) => file.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            IpcStreamInner::Pipe(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            IpcStreamInner::Pipe(file) => file.flush(),
        }
    }
}

impl IpcStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_pipe(file: std::fs::File) -> Self {
        Self {
            inner: IpcStreamInner::Pipe(file),
        }
    }

    /// Set read timeout on the underlying stream.
    ///
    /// Named pipe client handles have no per-call timeout; this is a no-op there.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(windows)]
            IpcStreamInner::Pipe(_) => {
                let _ = timeout;
                Ok(())
            }
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(windows)]
            IpcStreamInner::Pipe(_) => {
                let _ = timeout;
                Ok(())
            }
        }
    }

    /// Try to clone this stream (duplicates the underlying handle).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            #[cfg(windows)]
            IpcStreamInner::Pipe(file) => Ok(Self::from_pipe(file.try_clone()?)),
        }
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => f.debug_struct("IpcStream").field("type", &"unix").finish(),
            #[cfg(windows)]
            IpcStreamInner::Pipe(_) => f
                .debug_struct("IpcStream")
                .field("type", &"named-pipe")
                .finish(),
        }
    }
}
