//! Notification pump: a dedicated thread that delivers hook notifications.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace, warn};

const PUMP_THREAD_NAME: &str = "layoutbridge-pump";

/// A notification posted by the hook provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The active keyboard layout changed to `layout_handle`.
    LayoutChanged { layout_handle: i32 },
}

#[derive(Debug)]
enum PumpMessage {
    Notify(Notification),
    Quit,
}

/// Posts notifications to a [`NotificationPump`]. Cheap to clone and usable
/// from any thread, including provider callbacks.
#[derive(Debug, Clone)]
pub struct LayoutNotifier {
    tx: Sender<PumpMessage>,
}

impl LayoutNotifier {
    /// Report that the active layout changed. Dropped silently once the pump
    /// has stopped.
    pub fn layout_changed(&self, layout_handle: i32) {
        let notification = Notification::LayoutChanged { layout_handle };
        if self.tx.send(PumpMessage::Notify(notification)).is_err() {
            debug!(layout_handle, "pump stopped; notification dropped");
        }
    }
}

/// Owns the pump thread. Stopping (or dropping) posts a quit message and
/// joins; notifications queued before the quit are still delivered.
pub struct NotificationPump {
    tx: Sender<PumpMessage>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationPump {
    /// Start the pump, forwarding each notification to `callback` on the pump thread.
    pub fn spawn(callback: impl FnMut(Notification) + Send + 'static) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(PUMP_THREAD_NAME.to_string())
            .spawn(move || pump(rx, callback))?;
        debug!("notification pump started");
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// A notifier posting to this pump.
    pub fn notifier(&self) -> LayoutNotifier {
        LayoutNotifier {
            tx: self.tx.clone(),
        }
    }

    /// Post quit and join the pump thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.tx.send(PumpMessage::Quit);
        if handle.join().is_err() {
            warn!("notification pump panicked");
        }
        debug!("notification pump stopped");
    }
}

impl Drop for NotificationPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump(rx: Receiver<PumpMessage>, mut callback: impl FnMut(Notification)) {
    for message in rx {
        trace!(?message, "pump message");
        match message {
            PumpMessage::Notify(notification) => callback(notification),
            PumpMessage::Quit => break,
        }
    }
}
