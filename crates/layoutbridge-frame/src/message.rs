//! Application protocol carried inside frames.
//!
//! All fields are little-endian `i32`. The first field of every payload is
//! the opcode.
//!
//! | Direction | Opcode | Fields |
//! |---|---|---|
//! | client → server | 1 `Exit` | - |
//! | client → server | 2 `ChangeLayout` | window, layout id, layout handle |
//! | server → client | 1 `LayoutChanged` | layout handle |
//! | server → client | 2 `Error` | error code, message bytes |

use bytes::{BufMut, Bytes, BytesMut};

/// Error code reported for protocol violations and local failures without an OS code.
pub const PROTOCOL_ERROR_CODE: i32 = -1;

const FIELD: usize = std::mem::size_of::<i32>();

/// A malformed or unknown client command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The payload is too short to hold an opcode.
    #[error("incorrect command: payload of {len} bytes has no opcode")]
    MissingOpcode { len: usize },

    /// The opcode is not part of the protocol.
    #[error("unknown command: opcode {0}")]
    UnknownOpcode(i32),

    /// The opcode is known but the payload has the wrong size.
    #[error("incorrect command: opcode {opcode} expects {expected} bytes, got {actual}")]
    BadLength {
        opcode: i32,
        expected: usize,
        actual: usize,
    },
}

impl ProtocolError {
    /// Message sent back to the client in an `Error` response.
    pub fn user_message(&self) -> &'static str {
        match self {
            ProtocolError::UnknownOpcode(_) => "Unknown command.",
            ProtocolError::MissingOpcode { .. } | ProtocolError::BadLength { .. } => {
                "Incorrect command."
            }
        }
    }
}

/// Client → server command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Shut the bridge down.
    Exit,
    /// Ask the hook provider to switch `window` to the given layout.
    ChangeLayout {
        window: i32,
        layout_id: i32,
        layout_handle: i32,
    },
}

impl Command {
    pub const EXIT: i32 = 1;
    pub const CHANGE_LAYOUT: i32 = 2;
    /// Exact payload size of a `ChangeLayout` command, opcode included.
    pub const CHANGE_LAYOUT_LEN: usize = FIELD * 4;

    /// Protocol opcode of this command.
    pub fn opcode(&self) -> i32 {
        match self {
            Command::Exit => Self::EXIT,
            Command::ChangeLayout { .. } => Self::CHANGE_LAYOUT,
        }
    }

    /// Decode a command from a frame payload.
    ///
    /// `Exit` ignores any bytes after the opcode; `ChangeLayout` must be exactly
    /// [`CHANGE_LAYOUT_LEN`](Self::CHANGE_LAYOUT_LEN) bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let opcode = read_i32(payload, 0).ok_or(ProtocolError::MissingOpcode {
            len: payload.len(),
        })?;

        match opcode {
            Self::EXIT => Ok(Command::Exit),
            Self::CHANGE_LAYOUT => {
                if payload.len() != Self::CHANGE_LAYOUT_LEN {
                    return Err(ProtocolError::BadLength {
                        opcode,
                        expected: Self::CHANGE_LAYOUT_LEN,
                        actual: payload.len(),
                    });
                }
                let field = |index: usize| read_i32(payload, index).unwrap_or_default();
                Ok(Command::ChangeLayout {
                    window: field(1),
                    layout_id: field(2),
                    layout_handle: field(3),
                })
            }
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    /// Encode this command as a frame payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::CHANGE_LAYOUT_LEN);
        buf.put_i32_le(self.opcode());
        if let Command::ChangeLayout {
            window,
            layout_id,
            layout_handle,
        } = *self
        {
            buf.put_i32_le(window);
            buf.put_i32_le(layout_id);
            buf.put_i32_le(layout_handle);
        }
        buf.freeze()
    }
}

/// Server → client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// The hook provider switched to this layout.
    LayoutChanged { layout_handle: i32 },
    /// A failure report. The message has no terminator; its length is implied
    /// by the frame length.
    Error { code: i32, message: Bytes },
}

impl Response {
    pub const LAYOUT_CHANGED: i32 = 1;
    pub const ERROR: i32 = 2;

    /// Build an `Error` response.
    pub fn error(code: i32, message: impl Into<Bytes>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }

    /// Protocol opcode of this response.
    pub fn opcode(&self) -> i32 {
        match self {
            Response::LayoutChanged { .. } => Self::LAYOUT_CHANGED,
            Response::Error { .. } => Self::ERROR,
        }
    }

    /// Encode this response as a frame payload.
    pub fn encode(&self) -> Bytes {
        match self {
            Response::LayoutChanged { layout_handle } => {
                let mut buf = BytesMut::with_capacity(FIELD * 2);
                buf.put_i32_le(Self::LAYOUT_CHANGED);
                buf.put_i32_le(*layout_handle);
                buf.freeze()
            }
            Response::Error { code, message } => {
                let mut buf = BytesMut::with_capacity(FIELD * 2 + message.len());
                buf.put_i32_le(Self::ERROR);
                buf.put_i32_le(*code);
                buf.put_slice(message);
                buf.freeze()
            }
        }
    }

    /// Decode a response from a frame payload (client side).
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let opcode = read_i32(payload, 0).ok_or(ProtocolError::MissingOpcode {
            len: payload.len(),
        })?;

        let expected = FIELD * 2;
        let second = read_i32(payload, 1).ok_or(ProtocolError::BadLength {
            opcode,
            expected,
            actual: payload.len(),
        });

        match opcode {
            Self::LAYOUT_CHANGED => {
                if payload.len() != expected {
                    return Err(ProtocolError::BadLength {
                        opcode,
                        expected,
                        actual: payload.len(),
                    });
                }
                Ok(Response::LayoutChanged {
                    layout_handle: second?,
                })
            }
            Self::ERROR => Ok(Response::Error {
                code: second?,
                message: Bytes::copy_from_slice(&payload[expected..]),
            }),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

fn read_i32(payload: &[u8], index: usize) -> Option<i32> {
    let start = index * FIELD;
    let bytes: [u8; FIELD] = payload.get(start..start + FIELD)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}
