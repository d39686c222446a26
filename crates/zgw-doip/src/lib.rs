//! zgw-doip - DoIP/UDS protocol engine for a zonal gateway
//!
//! Frames DoIP on a stream transport, serves and forwards the UDS traffic
//! carried inside diagnostic messages, keeps routing activation alive with
//! periodic alive checks, collects telemetry reports, and runs firmware
//! downloads whose images carry a verified software package header.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    connection::spawn                        │
//! │      reader task · owner loop · alive-check ticker          │
//! │                          │                                  │
//! │  ┌───────────────────────┴───────────────────────────────┐  │
//! │  │                   ProtocolEngine                      │  │
//! │  │                                                       │  │
//! │  │  ┌──────────────┐ ┌────────────┐ ┌──────────────────┐ │  │
//! │  │  │RoutingSession│ │ telemetry  │ │FirmwareTransfer  │ │  │
//! │  │  │(activation,  │ │ (reports,  │ │Session + package │ │  │
//! │  │  │ alive check) │ │  store)    │ │header / CRC-32   │ │  │
//! │  │  └──────────────┘ └────────────┘ └──────────────────┘ │  │
//! │  │                  ┌─────────────┐                      │  │
//! │  │                  │ UDS codec   │                      │  │
//! │  │                  └──────┬──────┘                      │  │
//! │  └─────────────────────────┼─────────────────────────────┘  │
//! │                     ┌──────┴──────┐                         │
//! │                     │ DoIP codec  │                         │
//! │                     └─────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything below [`connection`] is synchronous and clock-free, so it can
//! be driven directly:
//!
//! ```
//! use std::time::Instant;
//! use zgw_doip::doip::payload::{activation_type, RoutingActivationRequest};
//! use zgw_doip::{EngineConfig, ProtocolEngine};
//!
//! let mut engine = ProtocolEngine::new(EngineConfig::default()).unwrap();
//! let request = RoutingActivationRequest::new(0x0E00, activation_type::DEFAULT);
//! let out = engine.handle_frame(&request.into_frame(), Instant::now());
//! assert_eq!(out.frames.len(), 1);
//! assert!(engine.routing().is_active());
//! ```

pub mod config;
pub mod connection;
pub mod doip;
pub mod engine;
pub mod error;
pub mod routing;
pub mod sw_package;
pub mod telemetry;
pub mod transfer;
pub mod uds;

pub use config::{ConfigError, EngineConfig};
pub use connection::{spawn, ConnectionError, ConnectionHandle, ConnectionStatus};
pub use doip::{DoipCodec, DoipFrame, FramingError, PayloadError, PayloadType};
pub use engine::{EngineEvent, EngineOutput, ProtocolEngine, VerifiedPackage};
pub use error::{Error, Result};
pub use routing::{AliveCheck, RoutingSession, RoutingState};
pub use sw_package::{PackageDisposition, PackageError, SoftwarePackageHeader};
pub use telemetry::{ParsedReport, TelemetryError, TelemetryStore};
pub use transfer::{FirmwareTransferSession, TransferError, TransferLimits, TransferState};
pub use uds::{NegativeResponseCode, UdsError, UdsMessage};
