//! DoIP framing and payload errors

use thiserror::Error;

use super::PayloadType;

/// Violations of the 8-byte header contract. Fatal to the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame too short: need {need} header bytes, got {got}")]
    TooShort { need: usize, got: usize },

    #[error("Protocol version mismatch: version 0x{version:02X}, inverse 0x{inverse:02X}")]
    VersionMismatch { version: u8, inverse: u8 },

    #[error("Incomplete payload: declared {declared} bytes, got {got}")]
    IncompletePayload { declared: u32, got: usize },

    #[error("Trailing bytes after payload: declared {declared} bytes, got {got}")]
    TrailingBytes { declared: u32, got: usize },

    #[error("Payload too large: {length} bytes (max {max})")]
    PayloadTooLarge { length: u32, max: u32 },
}

/// A well-framed message whose payload does not fit its type
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("{payload_type} payload too short: need {need} bytes, got {got}")]
    TooShort {
        payload_type: PayloadType,
        need: usize,
        got: usize,
    },
}

/// Stream framer error
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
