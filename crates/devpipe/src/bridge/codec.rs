//! NUL-delimited framing codec for the debugging pipe.
//!
//! Every message on the wire is UTF-8 JSON followed by a single 0x00 byte.
//! There is no length prefix and no escaping: JSON text never contains a raw
//! NUL, so the first sentinel always ends the frame.
//! Works over any AsyncRead/AsyncWrite (pipes, duplex streams, sockets).

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Byte that terminates every frame.
pub const SENTINEL: u8 = 0x00;

/// Frames above this size are reported at info level.
const LARGE_FRAME_BYTES: usize = 100_000;

/// Splits an inbound byte stream on [`SENTINEL`] and appends it to outbound frames.
///
/// The framed reader calls `decode` again after every frame, so several frames
/// arriving in one read are yielded one by one, in order, without recursion.
#[derive(Debug, Clone, Default)]
pub struct NulDelimitedCodec {
    /// Bytes of the assembly buffer already scanned without finding a sentinel.
    next_index: usize,
}

impl NulDelimitedCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for NulDelimitedCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(offset) = src[self.next_index..]
            .iter()
            .position(|byte| *byte == SENTINEL)
        else {
            self.next_index = src.len();
            return Ok(None);
        };

        let end = self.next_index + offset;
        self.next_index = 0;

        let mut frame = src.split_to(end + 1);
        frame.truncate(end);
        tracing::trace!(frame_size_bytes = end, "Decoded frame");
        Ok(Some(frame.freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if !src.is_empty() {
            tracing::warn!(
                partial_frame_bytes = src.len(),
                "Stream ended inside a frame, discarding partial frame"
            );
            src.clear();
        }
        self.next_index = 0;
        Ok(None)
    }
}

impl Encoder<Bytes> for NulDelimitedCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.contains(&SENTINEL) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload contains the NUL sentinel",
            ));
        }

        let len = item.len();
        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large frame being encoded"
            );
        }

        dst.reserve(len + 1);
        dst.put_slice(&item);
        dst.put_u8(SENTINEL);
        Ok(())
    }
}
