//! Codec for encoding/decoding control messages

use crate::messages::ControlMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Control message codec
///
/// Format: [length: u32 big-endian][payload: bincode serialized message]
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlCodec;

impl ControlCodec {
    /// Maximum message size (16MB)
    pub const MAX_MESSAGE_SIZE: usize = crate::MAX_FRAME_SIZE as usize;

    /// Length header size
    const HEADER_SIZE: usize = 4;

    /// Encode a control message to bytes
    pub fn encode_message(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        Self::encode_into(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a control message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete message was decoded,
    /// Ok(None) if more data is needed.
    pub fn decode_message(buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < Self::HEADER_SIZE + length {
            // Reserve room for the rest of the frame so the reader does not trickle
            buf.reserve(Self::HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let msg_bytes = buf.split_to(length);
        let msg: ControlMessage = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }

    fn encode_into(msg: &ControlMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Self::encode_into(&item, dst)
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Self::decode_message(src)
    }
}
