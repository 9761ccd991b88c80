//! Framed codecs for the duplex channel.
//!
//! Uses LengthDelimitedCodec for framing: a 4-byte big-endian length prefix followed by that
//! many payload bytes. [`FrameCodec`] moves raw payloads, [`MessageCodec`] runs them through a
//! [`MessageSerializer`].

use std::io;
use std::sync::Arc;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Message;
use crate::serializer::MessageSerializer;

/// Upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Length-prefixed framing of opaque payloads.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max)
                .new_codec(),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.inner.decode(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = item.len();
        tracing::trace!(frame_size_bytes = len, "Encoding frame");
        if len > 1024 * 1024 {
            tracing::debug!(
                frame_size_bytes = len,
                frame_size_kb = len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(item, dst)
    }
}

/// Frames plus serialization, used by the worker side where a decoded [`Message`] is wanted
/// directly.
#[derive(Clone)]
pub struct MessageCodec {
    frames: FrameCodec,
    serializer: Arc<dyn MessageSerializer>,
}

impl MessageCodec {
    pub fn new(serializer: Arc<dyn MessageSerializer>) -> Self {
        Self {
            frames: FrameCodec::new(),
            serializer,
        }
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.frames = FrameCodec::with_max_frame_length(max);
        self
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(frame) => {
                let msg = self
                    .serializer
                    .decode(&frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = self
            .serializer
            .encode(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.frames.encode(payload, dst)
    }
}
