//! Keyboard layout hook providers.
//!
//! A provider switches layouts on request and reports layout changes through
//! the [`LayoutNotifier`] it receives at install time. The bridge owns exactly
//! one provider, registered through [`BridgeBuilder::hook`](crate::bridge::BridgeBuilder::hook).

use tracing::{debug, info};

pub use crate::pump::LayoutNotifier;

/// Errors reported by a hook provider.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The provider could not be installed.
    #[error("hook install failed: {0}")]
    Install(String),

    /// A layout change request was rejected or failed.
    #[error("layout change failed: {0}")]
    LayoutChange(String),

    /// OS-level failure inside the provider.
    #[error("hook I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HookError {
    /// OS error code when known, otherwise `-1`.
    pub fn code(&self) -> i32 {
        match self {
            HookError::Io(err) => err.raw_os_error().unwrap_or(-1),
            _ => -1,
        }
    }
}

pub type Result<T> = std::result::Result<T, HookError>;

/// A keyboard layout hook provider.
pub trait LayoutHook: Send {
    /// Install the hook. Layout changes are reported through `notifier` from
    /// any thread.
    fn install(&mut self, notifier: LayoutNotifier) -> Result<()>;

    /// Switch `window` to the layout identified by `layout_id` / `layout_handle`.
    fn request_layout_change(&mut self, window: i32, layout_id: i32, layout_handle: i32)
        -> Result<()>;

    /// Uninstall the hook. Called once during teardown.
    fn shutdown(&mut self) {}
}

/// Provider that treats every request as an immediate, successful switch and
/// reports it back as a layout change.
#[derive(Debug, Default)]
pub struct LoopbackHook {
    notifier: Option<LayoutNotifier>,
}

impl LoopbackHook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LayoutHook for LoopbackHook {
    fn install(&mut self, notifier: LayoutNotifier) -> Result<()> {
        info!("loopback hook installed");
        self.notifier = Some(notifier);
        Ok(())
    }

    fn request_layout_change(
        &mut self,
        window: i32,
        layout_id: i32,
        layout_handle: i32,
    ) -> Result<()> {
        let notifier = self
            .notifier
            .as_ref()
            .ok_or_else(|| HookError::LayoutChange("hook is not installed".to_string()))?;
        debug!(window, layout_id, layout_handle, "loopback layout change");
        notifier.layout_changed(layout_handle);
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.notifier.take().is_some() {
            info!("loopback hook removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::pump::{Notification, NotificationPump};

    #[test]
    fn loopback_reports_requested_layout() {
        let (tx, rx) = mpsc::channel();
        let pump = NotificationPump::spawn(move |n| {
            let _ = tx.send(n);
        })
        .expect("pump should spawn");

        let mut hook = LoopbackHook::new();
        hook.install(pump.notifier()).expect("install should succeed");
        hook.request_layout_change(0x1000, 7, 0x0409)
            .expect("request should succeed");

        let notification = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("notification should arrive");
        assert_eq!(
            notification,
            Notification::LayoutChanged {
                layout_handle: 0x0409
            }
        );
        hook.shutdown();
        pump.stop();
    }

    #[test]
    fn loopback_requires_install() {
        let mut hook = LoopbackHook::new();
        let err = hook
            .request_layout_change(1, 2, 3)
            .expect_err("uninstalled hook should fail");
        assert!(matches!(err, HookError::LayoutChange(_)));
        assert_eq!(err.code(), -1);
    }
}
