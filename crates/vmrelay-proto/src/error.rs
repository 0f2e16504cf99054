//! Codec error types.
//!
//! Framing errors are kept separate from `std::io::Error` so callers can
//! distinguish a peer that speaks garbage from a socket that died. Both are
//! fatal to the connection they occurred on, but only the latter is worth
//! retrying at a higher level.

use std::io;

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

/// Errors produced while encoding or decoding agent frames.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// The peer closed the stream in the middle of a frame.
    #[error("short read: stream ended inside a frame")]
    ShortRead,

    /// The header's `length` field is smaller than the header itself.
    #[error("malformed frame: length {length} < header size {header}")]
    MalformedFrame {
        /// Claimed total frame length.
        length: usize,
        /// Size of the fixed header for this frame kind.
        header: usize,
    },

    /// The header claims a payload larger than the codec is willing to read.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed payload size.
        size: usize,
        /// Maximum accepted payload size.
        max: usize,
    },

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ProtoError {
    /// Map an error from `read_exact` into the codec taxonomy.
    ///
    /// `read_exact` reports a mid-frame EOF as `UnexpectedEof`; everything
    /// else is a genuine transport failure.
    pub fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof { Self::ShortRead } else { Self::Io(err) }
    }
}
