use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{Delivery, EndpointConfig, Progress};
use crate::uds::UnixDomainSocket;

/// Server side of a single-client Unix domain socket channel.
///
/// Operations never block. The completion signal is a `poll(2)` over the
/// active descriptor (listener while connecting, stream while reading) plus a
/// wake socket that [`UdsCanceller::cancel`] writes to.
pub struct UdsEndpoint {
    socket: UnixDomainSocket,
    stream: Option<UnixStream>,
    wake_rx: UnixStream,
    wake_tx: Arc<UnixStream>,
    read_buf: Box<[u8]>,
    client_timeout: Duration,
}

impl UdsEndpoint {
    /// Bind the channel at `address` and prepare the completion signal.
    pub fn create(address: &Path, config: &EndpointConfig) -> Result<Self> {
        let socket = UnixDomainSocket::bind(address)?;
        socket.set_nonblocking(true)?;

        let (wake_tx, wake_rx) = UnixStream::pair().map_err(|source| TransportError::Setup {
            what: "completion signal",
            source,
        })?;
        wake_rx
            .set_nonblocking(true)
            .map_err(|source| TransportError::Setup {
                what: "completion signal",
                source,
            })?;

        Ok(Self {
            socket,
            stream: None,
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            read_buf: vec![0u8; config.buffer_size.max(1)].into_boxed_slice(),
            client_timeout: config.client_timeout,
        })
    }

    /// Start accepting a client.
    ///
    /// On completion the listener is closed: the channel serves one client.
    pub fn begin_connect(&mut self) -> std::io::Result<Progress> {
        match self.socket.try_accept()? {
            Some(stream) => {
                stream.set_nonblocking(true)?;
                self.stream = Some(stream);
                self.socket.stop_listening();
                Ok(Progress::Complete(0))
            }
            None => Ok(Progress::Pending),
        }
    }

    /// Issue a read into the endpoint's buffer.
    pub fn begin_read(&mut self) -> std::io::Result<Progress> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotConnected))?;
        match stream.read(&mut self.read_buf) {
            Ok(n) => Ok(Progress::Complete(n)),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(Progress::Pending)
            }
            Err(err) => Err(err),
        }
    }

    /// Resolve the outstanding operation after [`wait`](Self::wait) returns.
    ///
    /// Returns `Progress::Pending` on a spurious wake-up.
    pub fn finish(&mut self) -> std::io::Result<Progress> {
        if self.stream.is_none() {
            self.begin_connect()
        } else {
            self.begin_read()
        }
    }

    /// Block until the outstanding operation may have completed or the
    /// endpoint was cancelled.
    pub fn wait(&mut self) -> std::io::Result<()> {
        let target = match (&self.stream, self.socket.listener_fd()) {
            (Some(stream), _) => stream.as_raw_fd(),
            (None, Some(fd)) => fd,
            (None, None) => return Err(std::io::Error::from(ErrorKind::NotConnected)),
        };
        let mut fds = [
            pollfd(target, libc::POLLIN),
            pollfd(self.wake_rx.as_raw_fd(), libc::POLLIN),
        ];
        poll(&mut fds, -1)?;
        trace!(
            target_revents = fds[0].revents,
            wake_revents = fds[1].revents,
            "completion signal"
        );
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

    /// Handle for writing to the connected client.
    pub fn writer(&self) -> std::io::Result<UdsWriter> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| std::io::Error::from(ErrorKind::NotConnected))?;
        Ok(UdsWriter {
            stream: stream.try_clone()?,
            timeout: self.client_timeout,
        })
    }

    /// Handle that interrupts [`wait`](Self::wait) from another thread.
    pub fn canceller(&self) -> UdsCanceller {
        UdsCanceller {
            wake: Arc::clone(&self.wake_tx),
        }
    }

    /// Drop the client connection.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(path = ?self.socket.path(), "client disconnected");
        }
    }

    /// Stream sockets may split or coalesce writes.
    pub fn delivery(&self) -> Delivery {
        Delivery::Stream
    }

    /// The bound channel address.
    pub fn address(&self) -> &Path {
        self.socket.path()
    }
}

/// Writes complete byte sequences to the connected client.
#[derive(Debug)]
pub struct UdsWriter {
    stream: UnixStream,
    timeout: Duration,
}

impl UdsWriter {
    /// Write all of `bytes`, waiting at most the client timeout for the peer
    /// to drain its receive buffer.
    pub fn write_message(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            match (&self.stream).write(&bytes[offset..]) {
                Ok(0) => return Err(std::io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    let mut fds = [pollfd(self.stream.as_raw_fd(), libc::POLLOUT)];
                    if poll(&mut fds, timeout_ms(self.timeout))? == 0 {
                        return Err(std::io::Error::new(
                            ErrorKind::TimedOut,
                            "client did not drain the channel in time",
                        ));
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// Cancels a blocked [`UdsEndpoint::wait`].
#[derive(Debug, Clone)]
pub struct UdsCanceller {
    wake: Arc<UnixStream>,
}

impl UdsCanceller {
    /// Wake the endpoint's worker. Idempotent.
    pub fn cancel(&self) {
        let _ = (&*self.wake).write(&[1]);
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

fn timeout_ms(timeout: Duration) -> libc::c_int {
    timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int
}

fn poll(fds: &mut [libc::pollfd], timeout_ms: libc::c_int) -> std::io::Result<usize> {
    loop {
        // SAFETY: `fds` is a valid, initialized slice of `pollfd` and its length is
        // passed alongside the pointer; the descriptors are owned by the caller.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::path::PathBuf;
    use std::thread;

    use super::*;

    fn sock_path(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lb-ep-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("ep.sock")
    }

    #[test]
    fn connect_is_pending_until_a_client_arrives() {
        let path = sock_path("pending");
        let mut endpoint = UdsEndpoint::create(&path, &EndpointConfig::default()).unwrap();
        assert_eq!(endpoint.begin_connect().unwrap(), Progress::Pending);

        let client = crate::connect(&path).unwrap();
        endpoint.wait().unwrap();
        assert_eq!(endpoint.finish().unwrap(), Progress::Complete(0));
        assert_eq!(endpoint.delivery(), Delivery::Stream);

        drop(client);
        drop(endpoint);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn read_completes_after_wait() {
        let path = sock_path("read");
        let mut endpoint = UdsEndpoint::create(&path, &EndpointConfig::default()).unwrap();
        let mut client = crate::connect(&path).unwrap();
        assert_eq!(endpoint.begin_connect().unwrap(), Progress::Complete(0));
        assert_eq!(endpoint.begin_read().unwrap(), Progress::Pending);

        client.write_all(b"abc").unwrap();
        endpoint.wait().unwrap();
        assert_eq!(endpoint.finish().unwrap(), Progress::Complete(3));
        assert_eq!(endpoint.read_buffer(3), b"abc");

        drop(client);
        endpoint.wait().unwrap();
        assert_eq!(endpoint.finish().unwrap(), Progress::Complete(0));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn cancel_wakes_a_blocked_wait() {
        let path = sock_path("cancel");
        let mut endpoint = UdsEndpoint::create(&path, &EndpointConfig::default()).unwrap();
        assert_eq!(endpoint.begin_connect().unwrap(), Progress::Pending);

        let canceller = endpoint.canceller();
        let waiter = thread::spawn(move || {
            endpoint.wait().unwrap();
            endpoint.finish().unwrap()
        });
        canceller.cancel();

        assert_eq!(waiter.join().unwrap(), Progress::Pending);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn writer_reaches_the_client() {
        let path = sock_path("writer");
        let mut endpoint = UdsEndpoint::create(&path, &EndpointConfig::default()).unwrap();
        let mut client = crate::connect(&path).unwrap();
        endpoint.begin_connect().unwrap();

        let writer = endpoint.writer().unwrap();
        writer.write_message(b"pong").unwrap();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn writer_requires_a_client() {
        let path = sock_path("no-writer");
        let endpoint = UdsEndpoint::create(&path, &EndpointConfig::default()).unwrap();
        let err = endpoint.writer().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotConnected);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
