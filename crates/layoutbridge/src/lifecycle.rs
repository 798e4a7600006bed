//! Single-instance gate with init and exit signals.
//!
//! One gate per application identity. The first process to acquire it owns
//! the instance; later processes learn they are duplicates through
//! [`LifecycleGate::is_unique_instance`].

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

/// Errors raised while creating the gate's primitives.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// A lock, event, or signal could not be created.
    #[error("failed to create {what}: {source}")]
    Create {
        what: &'static str,
        source: std::io::Error,
    },
}

impl LifecycleError {
    /// OS error code of the underlying failure, or `-1`.
    pub fn code(&self) -> i32 {
        match self {
            LifecycleError::Create { source, .. } => source.raw_os_error().unwrap_or(-1),
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Instance lock plus the init-complete and exit-requested signals.
///
/// All methods take `&self`; share the gate with `Arc` to signal exit from
/// other threads.
pub struct LifecycleGate {
    app_id: String,
    inner: platform::Gate,
}

impl LifecycleGate {
    /// Acquire the gate for `app_id`.
    ///
    /// Losing the instance race is not an error; check
    /// [`is_unique_instance`](Self::is_unique_instance). `runtime_dir` holds the
    /// lock file on Unix and is ignored on Windows, where the primitives are
    /// named kernel objects.
    pub fn acquire(app_id: &str, runtime_dir: &Path) -> Result<Self> {
        let inner = platform::Gate::acquire(app_id, runtime_dir)?;
        if inner.is_unique() {
            info!(app_id, "instance lock acquired");
        } else {
            info!(app_id, "another instance holds the lock");
        }
        Ok(Self {
            app_id: app_id.to_string(),
            inner,
        })
    }

    /// Application identity the gate was acquired for.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Whether this process holds the instance lock.
    pub fn is_unique_instance(&self) -> bool {
        self.inner.is_unique()
    }

    /// Mark initialization complete, releasing [`wait_for_init`](Self::wait_for_init).
    pub fn set_init_complete(&self) {
        debug!(app_id = %self.app_id, "init complete");
        self.inner.set_init_complete();
    }

    /// Block until init completes or `timeout` elapses. Returns whether init
    /// completed.
    pub fn wait_for_init(&self, timeout: Duration) -> bool {
        self.inner.wait_for_init(timeout)
    }

    /// Block until an exit is requested.
    pub fn wait_for_exit_command(&self) {
        self.inner.wait_for_exit();
    }

    /// Request exit. Idempotent; callable from any thread.
    ///
    /// Returns `true` only for the call that raised the signal.
    pub fn exit_app(&self) -> bool {
        let raised = self.inner.request_exit();
        if raised {
            debug!(app_id = %self.app_id, "exit requested");
        }
        raised
    }

    /// Whether an exit has been requested.
    pub fn is_exit_requested(&self) -> bool {
        self.inner.is_exit_requested()
    }
}

impl std::fmt::Debug for LifecycleGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleGate")
            .field("app_id", &self.app_id)
            .field("unique", &self.inner.is_unique())
            .field("exit_requested", &self.inner.is_exit_requested())
            .finish()
    }
}

#[cfg(unix)]
mod platform {
    use std::fs::{File, OpenOptions};
    use std::io::ErrorKind;
    use std::os::fd::AsRawFd;
    use std::path::Path;
    use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;

    use super::{LifecycleError, Result};

    #[derive(Default)]
    struct Flags {
        init: bool,
        exit: bool,
    }

    /// `flock` on `<runtime_dir>/<app_id>.lock` plus latched in-process signals.
    pub(super) struct Gate {
        // Held for its lock; released when the descriptor closes.
        lock: Option<File>,
        flags: Mutex<Flags>,
        changed: Condvar,
    }

    impl Gate {
        pub(super) fn acquire(app_id: &str, runtime_dir: &Path) -> Result<Self> {
            let path = runtime_dir.join(format!("{app_id}.lock"));
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)
                .map_err(|source| LifecycleError::Create {
                    what: "instance lock",
                    source,
                })?;

            // SAFETY: `file` owns a valid descriptor for the duration of the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            let lock = if rc == 0 {
                Some(file)
            } else {
                let err = std::io::Error::last_os_error();
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(LifecycleError::Create {
                        what: "instance lock",
                        source: err,
                    });
                }
                None
            };

            Ok(Self {
                lock,
                flags: Mutex::new(Flags::default()),
                changed: Condvar::new(),
            })
        }

        pub(super) fn is_unique(&self) -> bool {
            self.lock.is_some()
        }

        fn flags(&self) -> MutexGuard<'_, Flags> {
            self.flags.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(super) fn set_init_complete(&self) {
            self.flags().init = true;
            self.changed.notify_all();
        }

        pub(super) fn wait_for_init(&self, timeout: Duration) -> bool {
            let guard = self.flags();
            let (guard, _) = self
                .changed
                .wait_timeout_while(guard, timeout, |flags| !flags.init)
                .unwrap_or_else(PoisonError::into_inner);
            guard.init
        }

        pub(super) fn wait_for_exit(&self) {
            let guard = self.flags();
            let _guard = self
                .changed
                .wait_while(guard, |flags| !flags.exit)
                .unwrap_or_else(PoisonError::into_inner);
        }

        pub(super) fn request_exit(&self) -> bool {
            let mut flags = self.flags();
            let raised = !flags.exit;
            flags.exit = true;
            drop(flags);
            self.changed.notify_all();
            raised
        }

        pub(super) fn is_exit_requested(&self) -> bool {
            self.flags().exit
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ffi::c_void;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, WAIT_OBJECT_0,
    };
    use windows_sys::Win32::System::Threading::{
        CreateEventW, CreateMutexW, SetEvent, WaitForSingleObject, INFINITE,
    };

    use super::{LifecycleError, Result};

    struct OwnedHandle(*mut c_void);

    // SAFETY: mutex and event handles are opaque kernel handles usable from any
    // thread; the pointer is never dereferenced.
    unsafe impl Send for OwnedHandle {}
    // SAFETY: see above.
    unsafe impl Sync for OwnedHandle {}

    impl Drop for OwnedHandle {
        fn drop(&mut self) {
            // SAFETY: the handle came from a successful create call and is closed once.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    fn wide(name: &str) -> Vec<u16> {
        name.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// Named mutex `<app_id>Mutex` and manual-reset events `<app_id>InitEvent`
    /// and `<app_id>ExitEvent`.
    pub(super) struct Gate {
        _mutex: OwnedHandle,
        unique: bool,
        init: OwnedHandle,
        exit: OwnedHandle,
        // Set by the first in-process request.
        exit_raised: AtomicBool,
    }

    impl Gate {
        pub(super) fn acquire(app_id: &str, _runtime_dir: &Path) -> Result<Self> {
            let name = wide(&format!("{app_id}Mutex"));
            // SAFETY: `name` is a NUL-terminated UTF-16 buffer that outlives the call.
            let mutex = unsafe { CreateMutexW(std::ptr::null(), 0, name.as_ptr()) };
            // SAFETY: reads the calling thread's last-error value set by CreateMutexW.
            let already_exists = unsafe { GetLastError() } == ERROR_ALREADY_EXISTS;
            if mutex.is_null() {
                return Err(LifecycleError::Create {
                    what: "instance mutex",
                    source: std::io::Error::last_os_error(),
                });
            }
            let mutex = OwnedHandle(mutex);

            Ok(Self {
                _mutex: mutex,
                unique: !already_exists,
                init: named_event(&format!("{app_id}InitEvent"), "init event")?,
                exit: named_event(&format!("{app_id}ExitEvent"), "exit event")?,
                exit_raised: AtomicBool::new(false),
            })
        }

        pub(super) fn is_unique(&self) -> bool {
            self.unique
        }

        pub(super) fn set_init_complete(&self) {
            // SAFETY: `init` is a live event handle.
            unsafe {
                SetEvent(self.init.0);
            }
        }

        pub(super) fn wait_for_init(&self, timeout: Duration) -> bool {
            let ms = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
            // SAFETY: `init` is a live event handle.
            unsafe { WaitForSingleObject(self.init.0, ms) == WAIT_OBJECT_0 }
        }

        pub(super) fn wait_for_exit(&self) {
            // SAFETY: `exit` is a live event handle.
            unsafe {
                WaitForSingleObject(self.exit.0, INFINITE);
            }
        }

        pub(super) fn request_exit(&self) -> bool {
            let raised =
                !self.exit_raised.swap(true, Ordering::AcqRel) && !self.is_exit_requested();
            // SAFETY: `exit` is a live event handle.
            unsafe {
                SetEvent(self.exit.0);
            }
            raised
        }

        pub(super) fn is_exit_requested(&self) -> bool {
            // SAFETY: `exit` is a live event handle; a zero timeout only polls.
            unsafe { WaitForSingleObject(self.exit.0, 0) == WAIT_OBJECT_0 }
        }
    }

    fn named_event(name: &str, what: &'static str) -> Result<OwnedHandle> {
        let name = wide(name);
        // SAFETY: manual-reset, initially non-signalled; `name` is NUL-terminated
        // and outlives the call.
        let event = unsafe { CreateEventW(std::ptr::null(), 1, 0, name.as_ptr()) };
        if event.is_null() {
            return Err(LifecycleError::Create {
                what,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(OwnedHandle(event))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn make_runtime_dir(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/lbl-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    #[test]
    fn first_gate_is_unique_second_is_not() {
        let dir = make_runtime_dir("unique");
        let first = LifecycleGate::acquire("TestApp", &dir).expect("gate should acquire");
        let second = LifecycleGate::acquire("TestApp", &dir).expect("gate should acquire");

        assert!(first.is_unique_instance());
        assert!(!second.is_unique_instance());

        drop(first);
        let third = LifecycleGate::acquire("TestApp", &dir).expect("gate should acquire");
        assert!(third.is_unique_instance(), "lock is released on drop");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn distinct_app_ids_do_not_conflict() {
        let dir = make_runtime_dir("ids");
        let a = LifecycleGate::acquire("AppA", &dir).expect("gate should acquire");
        let b = LifecycleGate::acquire("AppB", &dir).expect("gate should acquire");
        assert!(a.is_unique_instance());
        assert!(b.is_unique_instance());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn wait_for_init_times_out_then_completes() {
        let dir = make_runtime_dir("init");
        let gate = Arc::new(LifecycleGate::acquire("InitApp", &dir).expect("gate should acquire"));
        assert!(!gate.wait_for_init(Duration::from_millis(10)));

        let signaller = Arc::clone(&gate);
        let handle = thread::spawn(move || signaller.set_init_complete());
        assert!(gate.wait_for_init(Duration::from_secs(5)));
        handle.join().expect("signaller should finish");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn exit_releases_waiter_and_is_idempotent() {
        let dir = make_runtime_dir("exit");
        let gate = Arc::new(LifecycleGate::acquire("ExitApp", &dir).expect("gate should acquire"));
        assert!(!gate.is_exit_requested());

        let waiter_gate = Arc::clone(&gate);
        let waiter = thread::spawn(move || waiter_gate.wait_for_exit_command());

        assert!(gate.exit_app());
        assert!(!gate.exit_app());
        waiter.join().expect("waiter should be released");
        assert!(gate.is_exit_requested());

        // Already latched: returns immediately.
        gate.wait_for_exit_command();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_exit_requests_raise_one_signal() {
        let dir = make_runtime_dir("exit-race");
        let gate = Arc::new(LifecycleGate::acquire("RaceApp", &dir).expect("gate should acquire"));

        let requesters: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.exit_app())
            })
            .collect();
        let raised = requesters
            .into_iter()
            .map(|handle| handle.join().expect("requester should finish"))
            .filter(|raised| *raised)
            .count();

        assert_eq!(raised, 1);
        assert!(gate.is_exit_requested());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_runtime_dir_fails_to_create() {
        let err = LifecycleGate::acquire("App", Path::new("/nonexistent-layoutbridge-dir"))
            .expect_err("lock file cannot be created");
        assert!(matches!(err, LifecycleError::Create { what: "instance lock", .. }));
        assert!(err.code() > 0);
    }
}
