//! Stream framer for `tokio_util::codec`
//!
//! Performs the mandatory two-phase read: wait for the 8 header bytes,
//! then for exactly `payload_length` more, then emit one [`DoipFrame`].

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    CodecError, DoipFrame, FrameHeader, FramingError, DEFAULT_MAX_PAYLOAD_LENGTH, HEADER_LEN,
};

#[derive(Debug, Clone, Copy)]
pub struct DoipCodec {
    max_payload_length: u32,
}

impl DoipCodec {
    pub fn new(max_payload_length: u32) -> Self {
        Self { max_payload_length }
    }
}

impl Default for DoipCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LENGTH)
    }
}

impl Decoder for DoipCodec {
    type Item = DoipFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DoipFrame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = FrameHeader::decode(&src[..HEADER_LEN])?;
        if header.payload_length > self.max_payload_length {
            return Err(FramingError::PayloadTooLarge {
                length: header.payload_length,
                max: self.max_payload_length,
            }
            .into());
        }

        let frame_len = header.frame_len();
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(frame_len);
        let payload = raw.split_off(HEADER_LEN).freeze();
        Ok(Some(DoipFrame {
            protocol_version: header.protocol_version,
            inverse_version: header.inverse_version,
            payload_type: header.payload_type,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<DoipFrame>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // Peer closed mid-frame
            None if src.len() < HEADER_LEN => Err(FramingError::TooShort {
                need: HEADER_LEN,
                got: src.len(),
            }
            .into()),
            None => {
                let header = FrameHeader::decode(&src[..HEADER_LEN])?;
                Err(FramingError::IncompletePayload {
                    declared: header.payload_length,
                    got: src.len() - HEADER_LEN,
                }
                .into())
            }
        }
    }
}

impl Encoder<DoipFrame> for DoipCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: DoipFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
        frame.encode_into(dst);
        Ok(())
    }
}
