//! Single-client asynchronous channel server.
//!
//! A [`ChannelServer`] accepts exactly one client on a platform channel,
//! reassembles length-prefixed frames from it on a dedicated thread, and
//! hands each payload to a handler. The owner sends framed replies with
//! [`ChannelServer::send`]. Once the client leaves, the instance is finished.

pub mod error;
pub mod server;
pub mod state;

mod worker;

pub use error::{Result, ServerError};
pub use server::{ChannelServer, ServerBuilder};
pub use state::ChannelState;
