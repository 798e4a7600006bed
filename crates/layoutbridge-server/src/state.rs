use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use layoutbridge_transport::PipeWriter;

/// Lifecycle of the single channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Waiting for the client. Initial state.
    Connecting = 0,
    /// A client is attached and reads are being issued.
    Reading = 1,
    /// Terminal: the worker has exited or is about to.
    Closing = 2,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ChannelState::Connecting,
            1 => ChannelState::Reading,
            _ => ChannelState::Closing,
        }
    }
}

/// State shared between the server handle and its worker.
pub(crate) struct Shared {
    state: AtomicU8,
    writer: Mutex<Option<PipeWriter>>,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Connecting as u8),
            writer: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move `from` → `to`; fails if another transition happened first.
    pub(crate) fn transition(&self, from: ChannelState, to: ChannelState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Enter the terminal state, returning the previous one.
    pub(crate) fn close(&self) -> ChannelState {
        ChannelState::from_u8(self.state.swap(ChannelState::Closing as u8, Ordering::AcqRel))
    }

    pub(crate) fn writer(&self) -> MutexGuard<'_, Option<PipeWriter>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
