use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use layoutbridge_frame::{decode_frame, decode_message, FrameError, HEADER_SIZE};
use layoutbridge_transport::{Delivery, PipeEndpoint, Progress};
use tracing::{debug, error, info, trace};

use crate::error::ServerError;
use crate::state::{ChannelState, Shared};

pub(crate) type ReadHandler = Box<dyn FnMut(Bytes) + Send>;
pub(crate) type DisconnectHandler = Box<dyn FnMut() + Send>;
pub(crate) type FaultHandler = Box<dyn FnMut(ServerError) + Send>;

pub(crate) struct Handlers {
    pub(crate) read: ReadHandler,
    pub(crate) disconnect: DisconnectHandler,
    pub(crate) fault: FaultHandler,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            read: Box::new(|_| {}),
            disconnect: Box::new(|| {}),
            fault: Box::new(|_| {}),
        }
    }
}

/// Owns the endpoint, the read buffer and the one operation slot. Runs on
/// the dedicated channel thread; it is the only code that issues reads or
/// moves the channel out of `Connecting`.
pub(crate) struct Worker {
    pub(crate) endpoint: PipeEndpoint,
    pub(crate) shared: Arc<Shared>,
    pub(crate) handlers: Handlers,
    pub(crate) inbound: BytesMut,
    pub(crate) max_payload: usize,
    /// Body bytes of a rejected frame still to be dropped from the stream.
    pub(crate) discard: usize,
}

impl Worker {
    /// Event loop. `first` is the outcome of the connect issued during open.
    pub(crate) fn run(mut self, first: std::io::Result<Progress>) {
        let mut outcome = first;

        loop {
            let result = match outcome {
                Ok(Progress::Pending) => {
                    if let Err(err) = self.endpoint.wait() {
                        self.fail("wait for channel completion failed", err);
                        break;
                    }
                    if self.shared.state() == ChannelState::Closing {
                        break;
                    }
                    self.endpoint.finish()
                }
                resolved => resolved,
            };

            match (self.shared.state(), result) {
                (ChannelState::Closing, _) => break,
                (_, Ok(Progress::Pending)) => {
                    trace!("spurious wake-up; operation still pending");
                    outcome = Ok(Progress::Pending);
                    continue;
                }
                (ChannelState::Connecting, Err(err)) => {
                    self.fail("connect failed", err);
                    break;
                }
                (ChannelState::Connecting, Ok(Progress::Complete(_))) => {
                    if !self.on_connected() {
                        break;
                    }
                }
                (ChannelState::Reading, Err(err)) => {
                    debug!(error = %err, "read failed");
                    self.on_disconnected();
                    break;
                }
                (ChannelState::Reading, Ok(Progress::Complete(0))) => {
                    self.on_disconnected();
                    break;
                }
                (ChannelState::Reading, Ok(Progress::Complete(n))) => self.on_read(n),
            }

            outcome = self.endpoint.begin_read();
        }

        debug!(path = ?self.endpoint.address(), "channel worker exiting");
    }

    pub(crate) fn on_connected(&mut self) -> bool {
        let writer = match self.endpoint.writer() {
            Ok(writer) => writer,
            Err(err) => {
                self.fail("connect failed", err);
                return false;
            }
        };
        *self.shared.writer() = Some(writer);

        if !self
            .shared
            .transition(ChannelState::Connecting, ChannelState::Reading)
        {
            self.shared.writer().take();
            return false;
        }
        info!(path = ?self.endpoint.address(), "client connected");
        true
    }

    fn on_disconnected(&mut self) {
        self.shared.writer().take();
        self.endpoint.disconnect();
        if self
            .shared
            .transition(ChannelState::Reading, ChannelState::Closing)
        {
            info!(path = ?self.endpoint.address(), "client disconnected");
            (self.handlers.disconnect)();
        }
    }

    fn on_read(&mut self, transferred: usize) {
        trace!(transferred, "read completed");
        match self.endpoint.delivery() {
            Delivery::Message => {
                let message = self.endpoint.read_buffer(transferred);
                match decode_message(message, self.max_payload) {
                    Ok(payload) => (self.handlers.read)(payload),
                    Err(err) => self.protocol_fault(err),
                }
            }
            Delivery::Stream => {
                let mut incoming = self.endpoint.read_buffer(transferred);
                if self.discard > 0 {
                    let skipped = self.discard.min(incoming.len());
                    self.discard -= skipped;
                    incoming = &incoming[skipped..];
                }
                self.inbound.extend_from_slice(incoming);
                loop {
                    match decode_frame(&mut self.inbound, self.max_payload) {
                        Ok(Some(payload)) => (self.handlers.read)(payload),
                        Ok(None) => break,
                        Err(err) => {
                            self.skip_rejected(&err);
                            self.protocol_fault(err);
                        }
                    }
                }
            }
        }
    }

    /// Drop the rejected frame from the stream so decoding resumes at the
    /// next frame boundary, even when its body spans later reads.
    fn skip_rejected(&mut self, err: &FrameError) {
        match *err {
            FrameError::PayloadTooLarge { size, .. } => {
                self.inbound.advance(HEADER_SIZE);
                let skipped = size.min(self.inbound.len());
                self.inbound.advance(skipped);
                self.discard = size - skipped;
            }
            _ => self.inbound.clear(),
        }
    }

    fn protocol_fault(&mut self, err: FrameError) {
        debug!(error = %err, "malformed frame");
        (self.handlers.fault)(ServerError::Protocol(err));
    }

    /// Report a fatal channel error and stop the worker.
    ///
    /// An attached client keeps its writer and the `Reading` state, so the
    /// owner can still send it an error report; [`ChannelServer::close`]
    /// retires the channel.
    ///
    /// [`ChannelServer::close`]: crate::ChannelServer::close
    pub(crate) fn fail(&mut self, reason: &'static str, source: std::io::Error) {
        error!(reason, error = %source, "channel failed");
        if self.shared.state() != ChannelState::Reading {
            self.shared.close();
            self.shared.writer().take();
        }
        (self.handlers.fault)(ServerError::ChannelIo { reason, source });
    }
}
