//! DoIP (Diagnostics over IP) framing per ISO 13400-2
//!
//! Every message is an 8-byte generic header followed by the payload:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬────────────────┬────────────────┐
//! │ Version  │ Inverse  │ Payload type │ Payload length │ Payload        │
//! │ (1B)     │ (1B)     │ (2B BE)      │ (4B BE)        │ (length bytes) │
//! │ 0x02     │ 0xFD     │              │                │                │
//! └──────────┴──────────┴──────────────┴────────────────┴────────────────┘
//! ```
//!
//! The inverse byte must always equal `0xFF ^ version`.

mod codec;
mod error;
mod frame;
pub mod payload;
mod payload_type;

pub use codec::DoipCodec;
pub use error::{CodecError, FramingError, PayloadError};
pub use frame::{decode, encode, DoipFrame, FrameHeader};
pub use payload_type::PayloadType;

/// Generic header length
pub const HEADER_LEN: usize = 8;

/// ISO 13400-2:2012
pub const PROTOCOL_VERSION: u8 = 0x02;
pub const INVERSE_VERSION: u8 = 0xFD;

/// Default upper bound on a declared payload length
pub const DEFAULT_MAX_PAYLOAD_LENGTH: u32 = 64 * 1024;

/// Well-known DoIP TCP port
pub const DOIP_PORT: u16 = 13400;
