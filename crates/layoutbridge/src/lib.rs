//! Background bridge between a keyboard layout hook provider and one client.
//!
//! layoutbridge runs a single-instance process that serves exactly one
//! client over a private framed channel, forwards layout change requests to
//! a hook provider, and reports layout changes back to the client.
//!
//! # Crate Structure
//!
//! - [`transport`]: Platform channel endpoints (Unix sockets, named pipes)
//! - [`frame`]: Length-prefixed framing and the command protocol
//! - [`server`]: Single-client asynchronous channel server
//! - [`lifecycle`]: Single-instance gate with init and exit signals
//! - [`hook`]: Hook provider trait and the loopback provider
//! - [`pump`]: Notification pump thread
//! - [`bridge`]: The orchestrator tying it all together

/// Re-export transport types.
pub mod transport {
    pub use layoutbridge_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use layoutbridge_frame::*;
}

/// Re-export channel server types.
pub mod server {
    pub use layoutbridge_server::*;
}

pub mod bridge;
pub mod hook;
pub mod lifecycle;
pub mod pump;

pub use bridge::{Bridge, BridgeBuilder, BridgeConfig, BridgeError, BridgeHandle, Shutdown};
pub use hook::{HookError, LayoutHook, LayoutNotifier, LoopbackHook};
pub use lifecycle::{LifecycleError, LifecycleGate};
pub use pump::{Notification, NotificationPump};
