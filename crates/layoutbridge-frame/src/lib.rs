//! Length-prefixed framing and the layout bridge command protocol.
//!
//! Every message on the channel is one frame:
//! - A 4-byte little-endian payload length
//! - Exactly that many payload bytes
//!
//! Above the framing sits a small binary protocol of little-endian `i32`
//! fields: client [`Command`]s and server [`Response`]s.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, decode_message, encode_frame, max_payload_for, FrameConfig, DEFAULT_BUFFER_SIZE,
    DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use message::{Command, ProtocolError, Response, PROTOCOL_ERROR_CODE};
pub use reader::FrameReader;
pub use writer::FrameWriter;
