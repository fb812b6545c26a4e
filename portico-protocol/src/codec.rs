//! Codec for encoding and decoding control channel frames
//!
//! Reuses a thread-local buffer on the encode path.

use crate::constants::MAX_FRAME_SIZE;
use crate::envelope::{decode_envelope, EnvelopeError};
use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use std::cell::RefCell;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

thread_local! {
    static ENCODE_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

const INITIAL_ENCODE_BUFFER_CAPACITY: usize = 8192;

/// A frame that could not be turned into bytes.
///
/// Nothing is written to the output buffer when this happens, so the
/// stream is still usable and the writer may move on to the next frame.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("Encode error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
}

impl From<EncodeError> for io::Error {
    fn from(err: EncodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// True when `err` came from [`EncodeError`] rather than the socket
pub fn is_encode_error(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<EncodeError>())
}

/// Size of the JSON payload `frame` encodes to, without the length prefix
pub fn encoded_len(frame: &Frame) -> Result<usize, EncodeError> {
    struct Counter(usize);

    impl io::Write for Counter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0 += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    let mut counter = Counter(0);
    serde_json::to_writer(&mut counter, frame)?;
    Ok(counter.0)
}

/// One unit read off the control channel.
///
/// A malformed payload still consumes exactly its own length-prefixed slot,
/// so the stream stays in sync and the connection can carry on.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    Malformed(EnvelopeError),
}

/// Control channel codec
///
/// Frames are length-prefixed with a 4-byte big-endian length field,
/// followed by a JSON envelope.
///
/// Frame format:
/// ```text
/// ┌─────────────┬──────────────┐
/// │ Length (u32)│ JSON object  │
/// │ 4 bytes     │ N bytes      │
/// └─────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TunnelCodec {
    max_frame_size: usize,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

impl TunnelCodec {
    /// Create a new codec instance with default max frame size
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new codec instance with a custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the configured max frame size
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for TunnelCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Read length prefix (don't consume yet)
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        // An oversized prefix means the peer is broken; there is no safe resync
        if frame_length > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame too large: {frame_length} bytes (max: {})",
                    self.max_frame_size
                ),
            ));
        }

        if src.len() < 4 + frame_length {
            src.reserve(4 + frame_length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(frame_length).freeze();

        Ok(Some(match decode_envelope(&payload) {
            Ok(frame) => Decoded::Frame(frame),
            Err(e) => Decoded::Malformed(e),
        }))
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        ENCODE_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();

            if buf.capacity() == 0 {
                buf.reserve(INITIAL_ENCODE_BUFFER_CAPACITY);
            }
            buf.clear();

            serde_json::to_writer(&mut *buf, &frame).map_err(EncodeError::from)?;

            let frame_length = buf.len();

            if frame_length > self.max_frame_size {
                return Err(EncodeError::TooLarge {
                    size: frame_length,
                    max: self.max_frame_size,
                }
                .into());
            }

            let length_prefix = u32::try_from(frame_length).map_err(|_| EncodeError::TooLarge {
                size: frame_length,
                max: u32::MAX as usize,
            })?;

            dst.reserve(4 + frame_length);
            dst.put_u32(length_prefix);
            dst.put_slice(&buf);

            Ok(())
        })
    }
}

/// Write a raw, already serialized payload with a length prefix.
///
/// Used to push bytes the [`Encoder`] would never produce, such as
/// envelopes from a newer peer or deliberately broken input in tests.
pub fn encode_raw(payload: &[u8], dst: &mut BytesMut) -> io::Result<()> {
    let length_prefix = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Frame length overflows u32"))?;
    dst.reserve(4 + payload.len());
    dst.put_u32(length_prefix);
    dst.put_slice(payload);
    Ok(())
}
