//! Self-delimiting JSON framing over peer streams.
//!
//! Wire format: one JSON document per message, newline terminated, no length
//! prefix. The decoder finds document boundaries from the JSON structure
//! itself, so a frame may arrive split across any number of reads.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::types::Message;

/// Largest document the decoder will buffer while waiting for its end.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame too large: {size} bytes buffered (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("stream ended inside a frame ({0} bytes pending)")]
    Truncated(usize),
}

/// Codec for [`Message`] documents.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        let leading = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(leading);
        if src.is_empty() {
            return Ok(None);
        }

        let mut docs = serde_json::Deserializer::from_slice(src).into_iter::<Message>();
        match docs.next() {
            Some(Ok(message)) => {
                let consumed = docs.byte_offset();
                src.advance(consumed);
                Ok(Some(message))
            }
            Some(Err(e)) if e.is_eof() => {
                if src.len() > self.max_frame_size {
                    return Err(FrameError::TooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                Ok(None)
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated(src.len())),
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        let bytes = serde_json::to_vec(item)?;
        dst.reserve(bytes.len() + 1);
        dst.extend_from_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Encode a single message into its wire bytes.
pub fn encode_message(message: &Message) -> Result<BytesMut, FrameError> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(message, &mut buf)?;
    Ok(buf)
}
