//! Crate-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::doip::{FramingError, PayloadError};
use crate::sw_package::PackageError;
use crate::telemetry::TelemetryError;
use crate::transfer::TransferError;
use crate::uds::{NegativeResponseCode, UdsError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Routing is not active")]
    RoutingInactive,

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Uds(#[from] UdsError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for refusing a request with a fixed NRC
    pub fn rejected(service_id: u8, nrc: NegativeResponseCode) -> Self {
        Self::Uds(UdsError::NegativeResponse { service_id, nrc })
    }

    /// NRC reported to the tester for this failure
    pub fn nrc(&self) -> NegativeResponseCode {
        match self {
            Self::RoutingInactive => NegativeResponseCode::RequestSequenceError,
            Self::Uds(e) => e.nrc(),
            Self::Transfer(e) => e.nrc(),
            Self::Package(e) => e.nrc(),
            Self::Framing(_) | Self::Payload(_) | Self::Telemetry(_) => {
                NegativeResponseCode::IncorrectMessageLengthOrFormat
            }
            Self::Config(_) => NegativeResponseCode::GeneralReject,
        }
    }
}
