use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use layoutbridge_frame::{encode_frame, max_payload_for, FrameError, HEADER_SIZE};
use layoutbridge_transport::{EndpointConfig, PipeCanceller, PipeEndpoint, TransportError};
use tracing::{debug, info, warn};

use crate::error::{Result, ServerError};
use crate::state::{ChannelState, Shared};
use crate::worker::{Handlers, Worker};

const WORKER_THREAD_NAME: &str = "layoutbridge-channel";

/// Configures and opens a [`ChannelServer`].
///
/// Handlers are fixed before the worker starts, so no frame can arrive ahead
/// of its handler.
pub struct ServerBuilder {
    address: PathBuf,
    config: EndpointConfig,
    handlers: Handlers,
}

impl ServerBuilder {
    /// Start configuring a server that will listen at `address`.
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            config: EndpointConfig::default(),
            handlers: Handlers::default(),
        }
    }

    /// Bound for client-facing blocking operations. Default: 5 s.
    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.config.client_timeout = timeout;
        self
    }

    /// Channel buffer capacity in bytes, length prefix included. Default: 512.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Called on the channel thread with each complete inbound payload.
    pub fn on_read(mut self, handler: impl FnMut(Bytes) + Send + 'static) -> Self {
        self.handlers.read = Box::new(handler);
        self
    }

    /// Called once when the client goes away. Not called by [`ChannelServer::close`].
    pub fn on_disconnect(mut self, handler: impl FnMut() + Send + 'static) -> Self {
        self.handlers.disconnect = Box::new(handler);
        self
    }

    /// Called with asynchronous failures: fatal channel I/O errors and
    /// malformed inbound frames.
    ///
    /// After a fatal error with a client attached, [`ChannelServer::send`]
    /// still reaches that client until the server is closed.
    pub fn on_fault(mut self, handler: impl FnMut(ServerError) + Send + 'static) -> Self {
        self.handlers.fault = Box::new(handler);
        self
    }

    /// Create the channel, issue the first connect, and start the worker.
    pub fn open(self) -> Result<ChannelServer> {
        if self.config.buffer_size <= HEADER_SIZE {
            return Err(ServerError::Setup {
                reason: "channel creation failed",
                source: TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "buffer size {} leaves no room for a payload",
                        self.config.buffer_size
                    ),
                )),
            });
        }

        let mut endpoint =
            PipeEndpoint::create(&self.address, &self.config).map_err(|source| {
                ServerError::Setup {
                    reason: "channel creation failed",
                    source,
                }
            })?;
        let first = endpoint.begin_connect().map_err(|err| ServerError::Setup {
            reason: "connect failed",
            source: TransportError::Io(err),
        })?;

        let shared = Arc::new(Shared::new());
        let canceller = endpoint.canceller();
        let max_payload = max_payload_for(self.config.buffer_size);
        let worker = Worker {
            endpoint,
            shared: Arc::clone(&shared),
            handlers: self.handlers,
            inbound: BytesMut::with_capacity(self.config.buffer_size),
            max_payload,
            discard: 0,
        };

        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run(Ok(first)))
            .map_err(|source| ServerError::Setup {
                reason: "worker thread creation failed",
                source: TransportError::Io(source),
            })?;

        info!(path = ?self.address, buffer_size = self.config.buffer_size, "channel open");
        Ok(ChannelServer {
            shared,
            canceller,
            worker: Some(handle),
            write_buf: BytesMut::with_capacity(self.config.buffer_size),
            max_payload,
            address: self.address,
        })
    }
}

/// Server end of a single-client framed channel.
///
/// One client is served per instance; once it disconnects the instance is
/// finished. Inbound payloads and faults are delivered to the handlers given
/// to [`ServerBuilder`] on a dedicated thread.
pub struct ChannelServer {
    shared: Arc<Shared>,
    canceller: PipeCanceller,
    worker: Option<JoinHandle<()>>,
    write_buf: BytesMut,
    max_payload: usize,
    address: PathBuf,
}

impl ChannelServer {
    /// Shorthand for [`ServerBuilder::new`].
    pub fn builder(address: impl Into<PathBuf>) -> ServerBuilder {
        ServerBuilder::new(address)
    }

    /// Frame and send `payload` to the client.
    ///
    /// Does nothing unless a client is attached and being read. Oversized
    /// payloads are rejected before touching the channel.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        if self.shared.state() != ChannelState::Reading {
            debug!(len = payload.len(), "send skipped; no client attached");
            return Ok(());
        }
        if payload.len() > self.max_payload {
            return Err(ServerError::Protocol(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            }));
        }

        self.write_buf.clear();
        encode_frame(payload, &mut self.write_buf)?;

        let slot = self.shared.writer();
        let Some(writer) = slot.as_ref() else {
            return Ok(());
        };
        writer
            .write_message(&self.write_buf)
            .map_err(|source| ServerError::ChannelIo {
                reason: "send data failed",
                source,
            })
    }

    /// Whether a client is attached and being read.
    pub fn is_connected(&self) -> bool {
        self.shared.state() == ChannelState::Reading
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Channel address the server listens at.
    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Stop the worker and release the channel. The disconnect handler is
    /// not invoked.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let previous = self.shared.close();
        self.canceller.cancel();
        self.shared.writer().take();

        let Some(handle) = self.worker.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            // Closed from inside a handler; the worker exits on its own.
            return;
        }
        if handle.join().is_err() {
            warn!(path = ?self.address, "channel worker panicked");
        }
        debug!(path = ?self.address, ?previous, "channel closed");
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ChannelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServer")
            .field("address", &self.address)
            .field("state", &self.shared.state())
            .finish()
    }
}
