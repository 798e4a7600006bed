use std::ffi::c_void;
use std::io::ErrorKind;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_INCOMPLETE, ERROR_IO_PENDING, ERROR_MORE_DATA,
    ERROR_PIPE_CONNECTED, INVALID_HANDLE_VALUE, WAIT_FAILED, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    ReadFile, WriteFile, FILE_FLAG_OVERLAPPED, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, PIPE_READMODE_MESSAGE,
    PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_MESSAGE, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject, INFINITE};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use crate::error::{Result, TransportError};
use crate::traits::{Delivery, EndpointConfig, IpcStream, Progress};

/// A single pipe instance: exactly one client at a time.
const INSTANCES: u32 = 1;

/// Owned Win32 handle, closed on drop.
struct OwnedHandle(*mut c_void);

// SAFETY: Win32 pipe and event handles may be used from any thread; the raw
// pointer is an opaque kernel handle value, never dereferenced.
unsafe impl Send for OwnedHandle {}
// SAFETY: see above; all operations on the handle are thread-safe kernel calls.
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    fn raw(&self) -> *mut c_void {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle was returned by a successful create call and is
        // closed exactly once, here.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn create_event() -> std::io::Result<OwnedHandle> {
    // SAFETY: null security attributes and name are permitted; manual-reset,
    // initially non-signalled.
    let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
    if event.is_null() {
        return Err(std::io::Error::last_os_error());
    }
    Ok(OwnedHandle(event))
}

fn last_error() -> u32 {
    // SAFETY: reads the calling thread's last-error value.
    unsafe { GetLastError() }
}

fn wide(path: &Path) -> Vec<u16> {
    path.as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().min(u32::MAX as u128 - 1) as u32
}

/// Server side of an overlapped, message-mode named pipe.
///
/// One `OVERLAPPED` slot (and its manual-reset event) serves connect and read;
/// the event is the single completion signal waited on by the worker.
pub struct NamedPipeEndpoint {
    pipe: Arc<OwnedHandle>,
    event: Arc<OwnedHandle>,
    overlapped: Box<OVERLAPPED>,
    read_buf: Box<[u8]>,
    address: PathBuf,
    client_timeout: Duration,
    in_flight: bool,
    /// Set after delivering the head of a message larger than the buffer;
    /// the rest of that message is read and dropped.
    draining: bool,
}

impl NamedPipeEndpoint {
    /// Create the pipe instance at `address` (`\\.\pipe\<name>`).
    pub fn create(address: &Path, config: &EndpointConfig) -> Result<Self> {
        let event = create_event().map_err(|source| TransportError::Setup {
            what: "completion signal",
            source,
        })?;

        let name = wide(address);
        let buffer_size = config.buffer_size.max(1) as u32;
        // SAFETY: `name` is a NUL-terminated UTF-16 string that outlives the call;
        // null security attributes select the default descriptor.
        let pipe = unsafe {
            CreateNamedPipeW(
                name.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
                INSTANCES,
                buffer_size,
                buffer_size,
                timeout_ms(config.client_timeout),
                std::ptr::null(),
            )
        };
        if pipe == INVALID_HANDLE_VALUE {
            return Err(TransportError::Bind {
                path: address.to_path_buf(),
                source: std::io::Error::last_os_error(),
            });
        }

        // SAFETY: OVERLAPPED is plain data; all-zero is its documented initial state.
        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { std::mem::zeroed() });
        overlapped.hEvent = event.raw();

        info!(path = ?address, "listening on named pipe");

        Ok(Self {
            pipe: Arc::new(OwnedHandle(pipe)),
            event: Arc::new(event),
            overlapped,
            read_buf: vec![0u8; config.buffer_size.max(1)].into_boxed_slice(),
            address: address.to_path_buf(),
            client_timeout: config.client_timeout,
            in_flight: false,
            draining: false,
        })
    }

    /// Start an overlapped connect.
    pub fn begin_connect(&mut self) -> std::io::Result<Progress> {
        // SAFETY: the pipe handle is valid and the boxed OVERLAPPED has a stable
        // address for as long as the operation can be in flight.
        let rc = unsafe { ConnectNamedPipe(self.pipe.raw(), &mut *self.overlapped) };
        if rc != 0 {
            // Overlapped connects report through the event, never synchronously.
            return Err(std::io::Error::other("overlapped connect returned synchronously"));
        }
        match last_error() {
            ERROR_IO_PENDING => {
                self.in_flight = true;
                Ok(Progress::Pending)
            }
            ERROR_PIPE_CONNECTED => {
                debug!(path = ?self.address, "client connected before listen");
                Ok(Progress::Complete(0))
            }
            code => Err(std::io::Error::from_raw_os_error(code as i32)),
        }
    }

    /// Issue an overlapped read of one message into the endpoint's buffer.
    ///
    /// A message larger than the buffer is delivered once, truncated to the
    /// buffer; its remaining fragments are dropped.
    pub fn begin_read(&mut self) -> std::io::Result<Progress> {
        loop {
            let mut read = 0u32;
            // SAFETY: the buffer and OVERLAPPED are owned by `self`, heap-allocated,
            // and not touched again until the operation resolves.
            let rc = unsafe {
                ReadFile(
                    self.pipe.raw(),
                    self.read_buf.as_mut_ptr(),
                    self.read_buf.len() as u32,
                    &mut read,
                    &mut *self.overlapped,
                )
            };
            let (len, whole) = if rc != 0 {
                (read as usize, true)
            } else {
                match last_error() {
                    ERROR_IO_PENDING => {
                        self.in_flight = true;
                        return Ok(Progress::Pending);
                    }
                    ERROR_MORE_DATA => (self.read_buf.len(), false),
                    code => return Err(std::io::Error::from_raw_os_error(code as i32)),
                }
            };
            if let Some(progress) = self.accept_fragment(len, whole) {
                return Ok(progress);
            }
        }
    }

    /// Resolve the outstanding operation without blocking.
    pub fn finish(&mut self) -> std::io::Result<Progress> {
        let mut transferred = 0u32;
        // SAFETY: valid handle and the OVERLAPPED used to issue the operation.
        let rc = unsafe {
            GetOverlappedResult(self.pipe.raw(), &*self.overlapped, &mut transferred, 0)
        };
        let (len, whole) = if rc != 0 {
            (transferred as usize, true)
        } else {
            match last_error() {
                ERROR_IO_INCOMPLETE => return Ok(Progress::Pending),
                ERROR_MORE_DATA => (self.read_buf.len(), false),
                code => {
                    self.in_flight = false;
                    return Err(std::io::Error::from_raw_os_error(code as i32));
                }
            }
        };
        self.in_flight = false;
        match self.accept_fragment(len, whole) {
            Some(progress) => Ok(progress),
            None => self.begin_read(),
        }
    }

    /// Decide whether a completed read is delivered or dropped as the tail
    /// of an oversized message.
    fn accept_fragment(&mut self, len: usize, whole: bool) -> Option<Progress> {
        if self.draining {
            self.draining = !whole;
            trace!(len, "dropped tail of oversized message");
            return None;
        }
        if !whole {
            self.draining = true;
            debug!(path = ?self.address, len, "message exceeds the read buffer");
        }
        Some(Progress::Complete(len))
    }

    /// Block on the completion event.
    pub fn wait(&mut self) -> std::io::Result<()> {
        // SAFETY: the event handle is valid for the lifetime of `self`.
        let rc = unsafe { WaitForSingleObject(self.event.raw(), INFINITE) };
        if rc == WAIT_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Bytes delivered by the last completed read.
    pub fn read_buffer(&self, len: usize) -> &[u8] {
        &self.read_buf[..len.min(self.read_buf.len())]
    }

    /// Read buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Handle for writing to the connected client, with its own OVERLAPPED slot.
    pub fn writer(&self) -> std::io::Result<NamedPipeWriter> {
        Ok(NamedPipeWriter {
            pipe: Arc::clone(&self.pipe),
            event: create_event()?,
            timeout: self.client_timeout,
        })
    }

    /// Handle that cancels in-flight I/O and wakes [`wait`](Self::wait).
    pub fn canceller(&self) -> NamedPipeCanceller {
        NamedPipeCanceller {
            pipe: Arc::clone(&self.pipe),
            event: Arc::clone(&self.event),
        }
    }

    /// Disconnect the client from this pipe instance.
    pub fn disconnect(&mut self) {
        // SAFETY: valid pipe handle.
        if unsafe { DisconnectNamedPipe(self.pipe.raw()) } == 0 {
            debug!(code = last_error(), "DisconnectNamedPipe failed");
        }
    }

    /// Message-mode pipes deliver one message per completed read.
    pub fn delivery(&self) -> Delivery {
        Delivery::Message
    }

    /// The pipe address.
    pub fn address(&self) -> &Path {
        &self.address
    }
}

impl Drop for NamedPipeEndpoint {
    fn drop(&mut self) {
        if !self.in_flight {
            return;
        }
        let mut transferred = 0u32;
        // SAFETY: cancel the operation that references our buffer and OVERLAPPED,
        // then wait for the kernel to release them before they are freed.
        unsafe {
            CancelIoEx(self.pipe.raw(), &*self.overlapped);
            GetOverlappedResult(self.pipe.raw(), &*self.overlapped, &mut transferred, 1);
        }
    }
}

/// Writes one message per call to the connected client.
pub struct NamedPipeWriter {
    pipe: Arc<OwnedHandle>,
    event: OwnedHandle,
    timeout: Duration,
}

impl NamedPipeWriter {
    /// Write `bytes` as one message, waiting at most the client timeout.
    pub fn write_message(&self, bytes: &[u8]) -> std::io::Result<()> {
        // SAFETY: plain data, zero is the documented initial state.
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        overlapped.hEvent = self.event.raw();

        let mut written = 0u32;
        // SAFETY: `bytes` and `overlapped` live on this frame until the write has
        // resolved below (completed, failed, or cancelled and drained).
        let rc = unsafe {
            WriteFile(
                self.pipe.raw(),
                bytes.as_ptr(),
                bytes.len() as u32,
                &mut written,
                &mut overlapped,
            )
        };
        if rc == 0 {
            let code = last_error();
            if code != ERROR_IO_PENDING {
                return Err(std::io::Error::from_raw_os_error(code as i32));
            }
            // SAFETY: valid event handle.
            let wait = unsafe { WaitForSingleObject(self.event.raw(), timeout_ms(self.timeout)) };
            if wait == WAIT_TIMEOUT {
                // SAFETY: cancel our own write and drain it before `overlapped` drops.
                unsafe {
                    CancelIoEx(self.pipe.raw(), &overlapped);
                    GetOverlappedResult(self.pipe.raw(), &overlapped, &mut written, 1);
                }
                return Err(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "client did not drain the channel in time",
                ));
            }
            // SAFETY: valid handle and the OVERLAPPED used for this write.
            if unsafe { GetOverlappedResult(self.pipe.raw(), &overlapped, &mut written, 1) } == 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        if written as usize != bytes.len() {
            return Err(std::io::Error::from(ErrorKind::WriteZero));
        }
        Ok(())
    }
}

/// Cancels in-flight pipe I/O and wakes the worker.
#[derive(Clone)]
pub struct NamedPipeCanceller {
    pipe: Arc<OwnedHandle>,
    event: Arc<OwnedHandle>,
}

impl NamedPipeCanceller {
    /// Cancel outstanding operations on the pipe and signal the event.
    pub fn cancel(&self) {
        // SAFETY: valid handles; a null OVERLAPPED cancels every operation on the pipe.
        unsafe {
            CancelIoEx(self.pipe.raw(), std::ptr::null());
            SetEvent(self.event.raw());
        }
    }
}

/// Open the client end of a named pipe.
pub fn connect(address: impl AsRef<Path>) -> Result<IpcStream> {
    let address = address.as_ref();
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(address)
        .map_err(|source| TransportError::Connect {
            path: address.to_path_buf(),
            source,
        })?;
    debug!(path = ?address, "connected to named pipe");
    Ok(IpcStream::from_pipe(file))
}
