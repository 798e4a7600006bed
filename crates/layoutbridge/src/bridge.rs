//! The bridge orchestrator.
//!
//! Owns the lifecycle gate, the channel server, the notification pump and
//! the hook provider. Every asynchronous input (frames, disconnects, faults,
//! layout notifications, exit requests) lands on one event queue consumed by
//! [`Bridge::run`].

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use layoutbridge_frame::{Command, ProtocolError, Response, PROTOCOL_ERROR_CODE};
use layoutbridge_server::{ChannelServer, ServerError};
use layoutbridge_transport::{
    channel_address, default_runtime_dir, DEFAULT_BUFFER_SIZE, DEFAULT_CLIENT_TIMEOUT,
};
use tracing::{debug, error, info, warn};

use crate::hook::{HookError, LayoutHook, LoopbackHook};
use crate::lifecycle::{LifecycleError, LifecycleGate};
use crate::pump::{Notification, NotificationPump};

/// Default application identity; also the stem of the channel name.
pub const DEFAULT_APP_ID: &str = "NativeLangHookWrapper";
/// Default suffix appended to the application identity to name the channel.
pub const DEFAULT_CHANNEL_SUFFIX: &str = "IPC";

const ALREADY_RUNNING: &str = "Another app instance running. Exiting.";
const ABNORMAL_DISCONNECT: &str = "Abnormal pipe disconnection.";
const WATCHER_THREAD_NAME: &str = "layoutbridge-exit-watcher";

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Application identity naming the instance lock and signals.
    pub app_id: String,
    /// Appended to `app_id` to form the channel name.
    pub channel_suffix: String,
    /// Directory for the socket and lock file (Unix).
    pub runtime_dir: PathBuf,
    /// Bound for client-facing blocking operations.
    pub client_timeout: Duration,
    /// Channel buffer capacity in bytes, length prefix included.
    pub buffer_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            channel_suffix: DEFAULT_CHANNEL_SUFFIX.to_string(),
            runtime_dir: default_runtime_dir(),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl BridgeConfig {
    /// `<app_id><channel_suffix>`.
    pub fn channel_name(&self) -> String {
        format!("{}{}", self.app_id, self.channel_suffix)
    }

    /// Platform address of the channel.
    pub fn channel_address(&self) -> PathBuf {
        channel_address(&self.channel_name(), &self.runtime_dir)
    }
}

/// Errors that stop the bridge from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Another process holds the instance lock.
    #[error("another instance of {app_id} is running")]
    AlreadyRunning { app_id: String },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Hook(#[from] HookError),

    /// A helper thread could not be started.
    #[error("failed to start {what}: {source}")]
    Thread {
        what: &'static str,
        source: std::io::Error,
    },
}

impl BridgeError {
    /// Numeric code for reports: the OS error code when known, otherwise `-1`.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::AlreadyRunning { .. } => PROTOCOL_ERROR_CODE,
            BridgeError::Lifecycle(err) => err.code(),
            BridgeError::Server(err) => err.code(),
            BridgeError::Hook(err) => err.code(),
            BridgeError::Thread { source, .. } => {
                source.raw_os_error().unwrap_or(PROTOCOL_ERROR_CODE)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Why a bridge run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// The client sent `Exit` or an exit was requested through the gate.
    ExitRequested,
    /// The client went away without sending `Exit`.
    ClientLost,
    /// The channel failed with this code.
    ChannelFailed { code: i32 },
}

/// Cross-thread handle to a bridge's lifecycle signals.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    gate: Arc<LifecycleGate>,
}

impl BridgeHandle {
    /// Ask the bridge to shut down. Idempotent; returns `false` when exit
    /// had already been signalled.
    pub fn request_exit(&self) -> bool {
        self.gate.exit_app()
    }

    /// Whether an exit has been requested.
    pub fn is_exit_requested(&self) -> bool {
        self.gate.is_exit_requested()
    }

    /// Block until the bridge is serving or `timeout` elapses.
    pub fn wait_for_init(&self, timeout: Duration) -> bool {
        self.gate.wait_for_init(timeout)
    }
}

/// Configures a [`Bridge`].
pub struct BridgeBuilder {
    config: BridgeConfig,
    hook: Option<Box<dyn LayoutHook>>,
}

impl BridgeBuilder {
    /// Register the hook provider. Defaults to [`LoopbackHook`].
    pub fn hook(mut self, hook: Box<dyn LayoutHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Acquire the instance gate.
    ///
    /// Fails with [`BridgeError::AlreadyRunning`] when another instance holds
    /// it; the channel is not opened in that case.
    pub fn build(self) -> Result<Bridge> {
        let gate = LifecycleGate::acquire(&self.config.app_id, &self.config.runtime_dir)?;
        if !gate.is_unique_instance() {
            report(ALREADY_RUNNING, PROTOCOL_ERROR_CODE);
            return Err(BridgeError::AlreadyRunning {
                app_id: self.config.app_id,
            });
        }
        Ok(Bridge {
            config: self.config,
            hook: self.hook.unwrap_or_else(|| Box::new(LoopbackHook::new())),
            gate: Arc::new(gate),
        })
    }

    /// Shorthand for `build()?.run()`.
    pub fn run(self) -> Result<Shutdown> {
        self.build()?.run()
    }
}

/// A bridge holding the instance gate, ready to serve.
pub struct Bridge {
    config: BridgeConfig,
    hook: Box<dyn LayoutHook>,
    gate: Arc<LifecycleGate>,
}

#[derive(Debug)]
enum Event {
    Frame(Bytes),
    Disconnected,
    Fault(ServerError),
    LayoutChanged(i32),
    ExitRequested,
}

impl Bridge {
    /// Start configuring a bridge.
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder { config, hook: None }
    }

    /// Handle for requesting exit from other threads (signal handlers, tests).
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            gate: Arc::clone(&self.gate),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Serve until exit is requested or the channel ends. Blocks the caller,
    /// which becomes the orchestrator thread.
    pub fn run(self) -> Result<Shutdown> {
        let Bridge {
            config,
            mut hook,
            gate,
        } = self;
        let (tx, rx) = mpsc::channel();

        let address = config.channel_address();
        let server = ChannelServer::builder(&address)
            .client_timeout(config.client_timeout)
            .buffer_size(config.buffer_size)
            .on_read(forward(&tx, Event::Frame))
            .on_disconnect({
                let tx = tx.clone();
                move || {
                    let _ = tx.send(Event::Disconnected);
                }
            })
            .on_fault(forward(&tx, Event::Fault))
            .open()?;

        let pump = NotificationPump::spawn({
            let tx = tx.clone();
            move |notification| match notification {
                Notification::LayoutChanged { layout_handle } => {
                    let _ = tx.send(Event::LayoutChanged(layout_handle));
                }
            }
        })
        .map_err(|source| BridgeError::Thread {
            what: "notification pump",
            source,
        })?;

        if let Err(err) = hook.install(pump.notifier()) {
            report(&err.to_string(), err.code());
            pump.stop();
            server.close();
            return Err(err.into());
        }

        let watcher = match spawn_exit_watcher(&gate, tx) {
            Ok(watcher) => watcher,
            Err(err) => {
                hook.shutdown();
                pump.stop();
                server.close();
                return Err(err);
            }
        };

        gate.set_init_complete();
        info!(path = ?address, app_id = %config.app_id, "bridge serving");

        let mut orchestrator = Orchestrator {
            server,
            hook,
            gate: Arc::clone(&gate),
        };
        let shutdown = orchestrator.serve(&rx);
        info!(?shutdown, "bridge shutting down");

        let Orchestrator {
            server, mut hook, ..
        } = orchestrator;
        hook.shutdown();
        pump.stop();
        server.close();
        // Releases the watcher if the run ended for another reason.
        gate.exit_app();
        if watcher.join().is_err() {
            warn!("exit watcher panicked");
        }
        drop(gate);
        debug!("bridge stopped");

        Ok(shutdown)
    }
}

struct Orchestrator {
    server: ChannelServer,
    hook: Box<dyn LayoutHook>,
    gate: Arc<LifecycleGate>,
}

impl Orchestrator {
    fn serve(&mut self, rx: &Receiver<Event>) -> Shutdown {
        while let Ok(event) = rx.recv() {
            let outcome = match event {
                Event::Frame(payload) => self.on_frame(&payload),
                Event::LayoutChanged(layout_handle) => {
                    self.respond(&Response::LayoutChanged { layout_handle });
                    None
                }
                Event::Disconnected => {
                    report(ABNORMAL_DISCONNECT, PROTOCOL_ERROR_CODE);
                    Some(Shutdown::ClientLost)
                }
                Event::Fault(err) => self.on_fault(err),
                Event::ExitRequested => Some(Shutdown::ExitRequested),
            };
            if let Some(shutdown) = outcome {
                return shutdown;
            }
        }
        // Every sender is gone; nothing can wake the loop again.
        Shutdown::ExitRequested
    }

    fn on_frame(&mut self, payload: &[u8]) -> Option<Shutdown> {
        match Command::decode(payload) {
            Ok(Command::Exit) => {
                let raised = self.gate.exit_app();
                info!(raised, "exit command received");
                Some(Shutdown::ExitRequested)
            }
            Ok(Command::ChangeLayout {
                window,
                layout_id,
                layout_handle,
            }) => {
                debug!(window, layout_id, layout_handle, "layout change requested");
                if let Err(err) = self
                    .hook
                    .request_layout_change(window, layout_id, layout_handle)
                {
                    let message = err.to_string();
                    self.fail_command(&message, err.code());
                }
                None
            }
            Err(err) => {
                self.protocol_error(&err);
                None
            }
        }
    }

    fn on_fault(&mut self, err: ServerError) -> Option<Shutdown> {
        let code = err.code();
        if err.is_fatal() {
            report(&err.to_string(), code);
            self.respond(&Response::error(code, err.reason()));
            return Some(Shutdown::ChannelFailed { code });
        }
        debug!(error = %err, "malformed frame");
        self.fail_command(err.reason(), code);
        None
    }

    fn protocol_error(&mut self, err: &ProtocolError) {
        debug!(error = %err, "rejected command");
        self.fail_command(err.user_message(), PROTOCOL_ERROR_CODE);
    }

    /// Report a failed command locally and to the client.
    fn fail_command(&mut self, message: &str, code: i32) {
        report(message, code);
        self.respond(&Response::error(code, Bytes::copy_from_slice(message.as_bytes())));
    }

    fn respond(&mut self, response: &Response) {
        if let Err(err) = self.server.send(&response.encode()) {
            warn!(error = %err, opcode = response.opcode(), "failed to send response");
        }
    }
}

fn forward<T>(
    tx: &Sender<Event>,
    wrap: impl Fn(T) -> Event + Send + 'static,
) -> impl FnMut(T) + Send + 'static {
    let tx = tx.clone();
    move |value| {
        let _ = tx.send(wrap(value));
    }
}

fn spawn_exit_watcher(gate: &Arc<LifecycleGate>, tx: Sender<Event>) -> Result<JoinHandle<()>> {
    let gate = Arc::clone(gate);
    thread::Builder::new()
        .name(WATCHER_THREAD_NAME.to_string())
        .spawn(move || {
            gate.wait_for_exit_command();
            let _ = tx.send(Event::ExitRequested);
        })
        .map_err(|source| BridgeError::Thread {
            what: "exit watcher",
            source,
        })
}

/// User-visible error report.
fn report(message: &str, code: i32) {
    error!(code = format_args!("{code:#x}"), "{message}");
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::TryRecvError;
    use std::time::Instant;

    use layoutbridge_frame::{encode_frame, FrameReader, FrameWriter};
    use layoutbridge_transport::IpcStream;

    use super::*;
    use crate::hook::LayoutNotifier;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config(tag: &str) -> BridgeConfig {
        let dir = PathBuf::from(format!(
            "/tmp/lbb-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        BridgeConfig {
            app_id: "TestBridge".to_string(),
            runtime_dir: dir,
            ..BridgeConfig::default()
        }
    }

    fn cleanup(config: &BridgeConfig) {
        let _ = std::fs::remove_dir_all(&config.runtime_dir);
    }

    /// Records requests; optionally reports them back as layout changes.
    struct RecordingHook {
        calls: Sender<(i32, i32, i32)>,
        echo: bool,
        notifier: Option<LayoutNotifier>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl LayoutHook for RecordingHook {
        fn install(&mut self, notifier: LayoutNotifier) -> crate::hook::Result<()> {
            self.notifier = Some(notifier);
            Ok(())
        }

        fn request_layout_change(
            &mut self,
            window: i32,
            layout_id: i32,
            layout_handle: i32,
        ) -> crate::hook::Result<()> {
            let _ = self.calls.send((window, layout_id, layout_handle));
            if self.echo {
                if let Some(notifier) = &self.notifier {
                    notifier.layout_changed(layout_handle);
                }
            }
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Running {
        handle: BridgeHandle,
        thread: JoinHandle<Result<Shutdown>>,
        calls: Receiver<(i32, i32, i32)>,
        shutdowns: Arc<AtomicUsize>,
    }

    fn start(config: &BridgeConfig, echo: bool) -> Running {
        let (calls_tx, calls) = mpsc::channel();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let hook = RecordingHook {
            calls: calls_tx,
            echo,
            notifier: None,
            shutdowns: Arc::clone(&shutdowns),
        };
        let bridge = Bridge::builder(config.clone())
            .hook(Box::new(hook))
            .build()
            .expect("bridge should build");
        let handle = bridge.handle();
        let thread = thread::spawn(move || bridge.run());
        assert!(handle.wait_for_init(TIMEOUT), "bridge should start serving");
        Running {
            handle,
            thread,
            calls,
            shutdowns,
        }
    }

    fn connect(config: &BridgeConfig) -> IpcStream {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            match layoutbridge_transport::connect(config.channel_address()) {
                Ok(stream) => return stream,
                Err(err) if Instant::now() < deadline => {
                    debug!(error = %err, "retrying connect");
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("client should connect: {err}"),
            }
        }
    }

    fn finish(running: Running) -> Shutdown {
        running
            .thread
            .join()
            .expect("bridge thread should not panic")
            .expect("bridge should run")
    }

    #[test]
    fn change_layout_calls_hook_without_response() {
        let config = test_config("change");
        let running = start(&config, false);
        let client = connect(&config);
        let reader_stream = client.try_clone().expect("stream should clone");
        let mut writer = FrameWriter::new(client);

        let command = Command::ChangeLayout {
            window: 0x1000,
            layout_id: 7,
            layout_handle: 0x0409,
        };
        writer.send(&command.encode()).expect("command should send");
        let call = running.calls.recv_timeout(TIMEOUT).expect("hook should be called");
        assert_eq!(call, (0x1000, 7, 0x0409));

        reader_stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("timeout should apply");
        let mut silent = reader_stream;
        let mut buf = [0u8; 1];
        let err = silent.read(&mut buf).expect_err("no response is expected");
        assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

        writer.send(&Command::Exit.encode()).expect("exit should send");
        assert_eq!(finish(running), Shutdown::ExitRequested);
        cleanup(&config);
    }

    #[test]
    fn layout_notification_becomes_twelve_byte_frame() {
        let config = test_config("notify");
        let running = start(&config, true);
        let mut client = connect(&config);

        let command = Command::ChangeLayout {
            window: 0x1000,
            layout_id: 7,
            layout_handle: 0x0409,
        };
        let mut wire = bytes::BytesMut::new();
        encode_frame(&command.encode(), &mut wire).expect("frame should encode");
        client.write_all(&wire).expect("command should write");

        let mut response = [0u8; 12];
        client.read_exact(&mut response).expect("response should arrive");
        assert_eq!(response, [8, 0, 0, 0, 1, 0, 0, 0, 0x09, 0x04, 0, 0]);

        running.handle.request_exit();
        assert_eq!(finish(running), Shutdown::ExitRequested);
        cleanup(&config);
    }

    #[test]
    fn bad_length_change_layout_is_rejected() {
        let config = test_config("bad-length");
        let running = start(&config, false);
        let client = connect(&config);
        let mut reader = FrameReader::new(client.try_clone().expect("stream should clone"));
        let mut writer = FrameWriter::new(client);

        let mut short = 2i32.to_le_bytes().to_vec();
        short.extend_from_slice(&[0u8; 8]);
        writer.send(&short).expect("command should send");
        let response = Response::decode(&reader.read_frame().expect("response should arrive"))
            .expect("response should decode");
        assert_eq!(response, Response::error(-1, "Incorrect command."));

        writer.send(&99i32.to_le_bytes()).expect("command should send");
        let response = Response::decode(&reader.read_frame().expect("response should arrive"))
            .expect("response should decode");
        assert_eq!(response, Response::error(-1, "Unknown command."));

        assert!(matches!(running.calls.try_recv(), Err(TryRecvError::Empty)));
        writer.send(&Command::Exit.encode()).expect("exit should send");
        assert_eq!(finish(running), Shutdown::ExitRequested);
        cleanup(&config);
    }

    #[test]
    fn exit_is_signalled_once_and_stops_frame_processing() {
        let config = test_config("exit");
        let running = start(&config, false);
        let mut client = connect(&config);

        let mut wire = bytes::BytesMut::new();
        encode_frame(&Command::Exit.encode(), &mut wire).expect("frame should encode");
        encode_frame(&Command::Exit.encode(), &mut wire).expect("frame should encode");
        let late = Command::ChangeLayout {
            window: 1,
            layout_id: 2,
            layout_handle: 3,
        };
        encode_frame(&late.encode(), &mut wire).expect("frame should encode");
        client.write_all(&wire).expect("frames should write");

        let Running {
            handle,
            thread,
            calls,
            shutdowns,
        } = running;
        let shutdown = thread
            .join()
            .expect("bridge thread should not panic")
            .expect("bridge should run");
        assert_eq!(shutdown, Shutdown::ExitRequested);
        assert_eq!(calls.try_iter().count(), 0, "no frame is processed after exit");
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(handle.is_exit_requested());
        assert!(!handle.request_exit(), "exit was already signalled by the command");
        cleanup(&config);
    }

    #[test]
    fn fatal_channel_fault_sends_error_frame_before_teardown() {
        let config = test_config("fatal");
        let gate = Arc::new(
            LifecycleGate::acquire(&config.app_id, &config.runtime_dir)
                .expect("gate should acquire"),
        );
        let server = ChannelServer::builder(config.channel_address())
            .open()
            .expect("server should open");
        let client = connect(&config);
        let deadline = Instant::now() + TIMEOUT;
        while !server.is_connected() {
            assert!(Instant::now() < deadline, "client should attach");
            thread::sleep(Duration::from_millis(5));
        }

        let mut orchestrator = Orchestrator {
            server,
            hook: Box::new(LoopbackHook::new()),
            gate,
        };
        let outcome = orchestrator.on_fault(ServerError::ChannelIo {
            reason: "wait for channel completion failed",
            source: std::io::Error::from_raw_os_error(32),
        });
        assert_eq!(outcome, Some(Shutdown::ChannelFailed { code: 32 }));

        let mut reader = FrameReader::new(client);
        let response = Response::decode(&reader.read_frame().expect("error frame should arrive"))
            .expect("response should decode");
        assert_eq!(
            response,
            Response::error(32, "wait for channel completion failed")
        );

        orchestrator.server.close();
        cleanup(&config);
    }

    #[test]
    fn client_disconnect_without_exit_is_abnormal() {
        let config = test_config("lost");
        let running = start(&config, false);
        let client = connect(&config);
        thread::sleep(Duration::from_millis(20));
        drop(client);

        assert_eq!(finish(running), Shutdown::ClientLost);
        cleanup(&config);
    }

    #[test]
    fn exit_request_while_waiting_for_client() {
        let config = test_config("idle-exit");
        let running = start(&config, false);
        running.handle.request_exit();
        assert_eq!(finish(running), Shutdown::ExitRequested);
        assert!(
            !config.channel_address().exists(),
            "socket is removed on teardown"
        );
        cleanup(&config);
    }

    #[test]
    fn second_instance_is_already_running() {
        let config = test_config("second");
        let first = Bridge::builder(config.clone())
            .build()
            .expect("first bridge should build");

        let err = Bridge::builder(config.clone())
            .build()
            .err()
            .expect("second bridge should be refused");
        assert!(matches!(err, BridgeError::AlreadyRunning { .. }));
        assert_eq!(err.code(), -1);
        assert!(
            !config.channel_address().exists(),
            "channel is not opened by either bridge yet"
        );

        drop(first);
        cleanup(&config);
    }

    #[test]
    fn channel_name_joins_app_id_and_suffix() {
        let config = BridgeConfig::default();
        assert_eq!(config.channel_name(), "NativeLangHookWrapperIPC");
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.client_timeout, Duration::from_millis(5000));
    }
}
