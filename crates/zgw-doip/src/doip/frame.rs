//! DoIP frame encode/decode

use bytes::{BufMut, Bytes, BytesMut};

use super::{FramingError, PayloadType, HEADER_LEN, INVERSE_VERSION, PROTOCOL_VERSION};

/// Decoded 8-byte generic header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub protocol_version: u8,
    pub inverse_version: u8,
    pub payload_type: PayloadType,
    pub payload_length: u32,
}

impl FrameHeader {
    /// Parse the first 8 bytes of `bytes`.
    ///
    /// Only the header is inspected; payload bytes after it are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        if bytes.len() < HEADER_LEN {
            return Err(FramingError::TooShort {
                need: HEADER_LEN,
                got: bytes.len(),
            });
        }

        let protocol_version = bytes[0];
        let inverse_version = bytes[1];
        if inverse_version != !protocol_version {
            return Err(FramingError::VersionMismatch {
                version: protocol_version,
                inverse: inverse_version,
            });
        }

        Ok(Self {
            protocol_version,
            inverse_version,
            payload_type: PayloadType::from(u16::from_be_bytes([bytes[2], bytes[3]])),
            payload_length: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }

    /// Total frame size on the wire (header + payload)
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.payload_length as usize
    }
}

/// One DoIP message, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoipFrame {
    pub protocol_version: u8,
    pub inverse_version: u8,
    pub payload_type: PayloadType,
    pub payload: Bytes,
}

impl DoipFrame {
    /// Build a frame with the default 0x02/0xFD version pair
    pub fn new(payload_type: PayloadType, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            inverse_version: INVERSE_VERSION,
            payload_type,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload)
    pub fn wire_size(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the wire representation to `dst`.
    ///
    /// Payloads are capped by the framer's `max_payload_length`, far below `u32::MAX`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u8(self.protocol_version);
        dst.put_u8(self.inverse_version);
        dst.put_u16(self.payload_type.into());
        dst.put_u32(u32::try_from(self.payload.len()).unwrap_or(u32::MAX));
        dst.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.encode_into(&mut buf);
        buf.to_vec()
    }

    /// Decode exactly one complete frame.
    ///
    /// `bytes` must hold the 8 header bytes followed by exactly
    /// `payload_length` bytes; the stream layer is responsible for
    /// collecting them.
    pub fn decode(bytes: &[u8]) -> Result<Self, FramingError> {
        let header = FrameHeader::decode(bytes)?;
        let available = bytes.len() - HEADER_LEN;
        let declared = header.payload_length;

        if available < declared as usize {
            return Err(FramingError::IncompletePayload {
                declared,
                got: available,
            });
        }
        if available > declared as usize {
            return Err(FramingError::TrailingBytes {
                declared,
                got: available,
            });
        }

        Ok(Self {
            protocol_version: header.protocol_version,
            inverse_version: header.inverse_version,
            payload_type: header.payload_type,
            payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
        })
    }
}

/// Encode `frame` to its wire bytes
pub fn encode(frame: &DoipFrame) -> Vec<u8> {
    frame.encode()
}

/// Decode one complete frame from `bytes`
pub fn decode(bytes: &[u8]) -> Result<DoipFrame, FramingError> {
    DoipFrame::decode(bytes)
}
