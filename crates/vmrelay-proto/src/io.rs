//! Agent I/O-channel framing.
//!
//! The I/O socket multiplexes the standard streams of every process in the
//! VM over one byte stream. Frames carry a 12-byte big-endian header: a
//! 64-bit sequence number selecting the stream and a 32-bit `length`
//! counting the whole frame, header included. A frame with `length == 12`
//! carries no payload and marks EOF for its sequence.

use bytes::{BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtoError, Result};

/// Size of the I/O frame header: `seq: u64` + `length: u32`.
pub const IO_HEADER_SIZE: usize = 12;

/// Upper bound on a single I/O payload.
pub const MAX_IO_PAYLOAD: usize = 16 * 1024 * 1024;

/// One I/O frame exchanged with the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoMessage {
    /// Stream sequence number.
    pub seq: u64,
    /// Stream payload; empty for an EOF marker.
    pub payload: Bytes,
}

impl IoMessage {
    /// Create an I/O frame carrying `payload` for stream `seq`.
    pub fn new(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self { seq, payload: payload.into() }
    }

    /// Create the EOF marker for stream `seq`.
    #[must_use]
    pub fn eof(seq: u64) -> Self {
        Self { seq, payload: Bytes::new() }
    }

    /// Whether this frame marks EOF for its stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.payload.is_empty()
    }

    /// Total encoded size of this frame.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        IO_HEADER_SIZE + self.payload.len()
    }

    /// Encode into `dst`: `[seq][length][payload]`, big-endian.
    ///
    /// # Errors
    ///
    /// `ProtoError::PayloadTooLarge` if the payload exceeds
    /// [`MAX_IO_PAYLOAD`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > MAX_IO_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_IO_PAYLOAD,
            });
        }

        dst.put_u64(self.seq);
        dst.put_u32(self.encoded_len() as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Read exactly one frame from an async stream.
    ///
    /// # Errors
    ///
    /// - `ProtoError::ShortRead` on EOF inside a frame
    /// - `ProtoError::MalformedFrame` if `length < 12`
    /// - `ProtoError::PayloadTooLarge` if the payload exceeds the cap
    /// - `ProtoError::Io` for any other socket error
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; IO_HEADER_SIZE];
        reader.read_exact(&mut header).await.map_err(ProtoError::from_read)?;

        let seq = u64::from_be_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let length = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

        if length < IO_HEADER_SIZE {
            return Err(ProtoError::MalformedFrame { length, header: IO_HEADER_SIZE });
        }

        let payload_len = length - IO_HEADER_SIZE;
        if payload_len > MAX_IO_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge { size: payload_len, max: MAX_IO_PAYLOAD });
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await.map_err(ProtoError::from_read)?;

        Ok(Self { seq, payload: payload.into() })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn eof_marker_is_header_only() {
        let msg = IoMessage::eof(0x1_0000_0001);
        assert!(msg.is_eof());

        let mut wire = Vec::new();
        msg.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), IO_HEADER_SIZE);
        assert_eq!(&wire[8..12], &12u32.to_be_bytes());
    }

    #[tokio::test]
    async fn reject_undersized_length() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&7u64.to_be_bytes());
        wire.extend_from_slice(&11u32.to_be_bytes());

        let mut cursor = Cursor::new(wire);
        assert!(matches!(
            IoMessage::read_from(&mut cursor).await,
            Err(ProtoError::MalformedFrame { length: 11, .. })
        ));
    }

    proptest! {
        #[test]
        fn io_round_trip(seq in any::<u64>(), payload in prop::collection::vec(any::<u8>(), 0..256)) {
            let msg = IoMessage::new(seq, payload);
            let mut wire = Vec::new();
            msg.encode(&mut wire).unwrap();

            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decoded = rt.block_on(async {
                IoMessage::read_from(&mut Cursor::new(wire)).await.unwrap()
            });
            prop_assert_eq!(decoded, msg);
        }
    }
}
