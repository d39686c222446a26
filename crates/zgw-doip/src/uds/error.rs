//! UDS protocol errors

use thiserror::Error;

use super::NegativeResponseCode;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UdsError {
    #[error("Empty UDS message")]
    EmptyMessage,

    #[error("Invalid format for service 0x{service_id:02X}: {reason}")]
    InvalidFormat { service_id: u8, reason: String },

    #[error("Parameter out of range for service 0x{service_id:02X}: {reason}")]
    OutOfRange { service_id: u8, reason: String },

    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service_id:02X}")]
    NegativeResponse {
        service_id: u8,
        nrc: NegativeResponseCode,
    },
}

impl UdsError {
    pub(crate) fn invalid(service_id: u8, reason: impl Into<String>) -> Self {
        Self::InvalidFormat {
            service_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn out_of_range(service_id: u8, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            service_id,
            reason: reason.into(),
        }
    }

    /// NRC a server answers with when a request fails this way
    pub fn nrc(&self) -> NegativeResponseCode {
        match self {
            Self::EmptyMessage | Self::InvalidFormat { .. } => {
                NegativeResponseCode::IncorrectMessageLengthOrFormat
            }
            Self::OutOfRange { .. } => NegativeResponseCode::RequestOutOfRange,
            Self::NegativeResponse { nrc, .. } => *nrc,
        }
    }
}
