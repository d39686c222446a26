//! DoIP payload types

use std::fmt;

/// DoIP payload type carried in bytes 2..4 of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    GenericNack,
    VehicleIdentificationRequest,
    VehicleIdentificationRequestEid,
    VehicleIdentificationRequestVin,
    VehicleAnnouncement,
    RoutingActivationRequest,
    RoutingActivationResponse,
    AliveCheckRequest,
    AliveCheckResponse,
    DiagnosticMessage,
    DiagnosticMessageAck,
    DiagnosticMessageNack,
    /// Consolidated VCI report (48-byte records)
    VciReport,
    /// Health status report (24-byte records)
    HealthReport,
    /// Update readiness report (27-byte records)
    ReadinessReport,
    /// Unassigned or vendor payload type
    Unknown(u16),
}

impl From<u16> for PayloadType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Self::GenericNack,
            0x0001 => Self::VehicleIdentificationRequest,
            0x0002 => Self::VehicleIdentificationRequestEid,
            0x0003 => Self::VehicleIdentificationRequestVin,
            0x0004 => Self::VehicleAnnouncement,
            0x0005 => Self::RoutingActivationRequest,
            0x0006 => Self::RoutingActivationResponse,
            0x0007 => Self::AliveCheckRequest,
            0x0008 => Self::AliveCheckResponse,
            0x8001 => Self::DiagnosticMessage,
            0x8002 => Self::DiagnosticMessageAck,
            0x8003 => Self::DiagnosticMessageNack,
            0x9000 => Self::VciReport,
            0x9001 => Self::HealthReport,
            0x9002 => Self::ReadinessReport,
            other => Self::Unknown(other),
        }
    }
}

impl From<PayloadType> for u16 {
    fn from(payload_type: PayloadType) -> Self {
        match payload_type {
            PayloadType::GenericNack => 0x0000,
            PayloadType::VehicleIdentificationRequest => 0x0001,
            PayloadType::VehicleIdentificationRequestEid => 0x0002,
            PayloadType::VehicleIdentificationRequestVin => 0x0003,
            PayloadType::VehicleAnnouncement => 0x0004,
            PayloadType::RoutingActivationRequest => 0x0005,
            PayloadType::RoutingActivationResponse => 0x0006,
            PayloadType::AliveCheckRequest => 0x0007,
            PayloadType::AliveCheckResponse => 0x0008,
            PayloadType::DiagnosticMessage => 0x8001,
            PayloadType::DiagnosticMessageAck => 0x8002,
            PayloadType::DiagnosticMessageNack => 0x8003,
            PayloadType::VciReport => 0x9000,
            PayloadType::HealthReport => 0x9001,
            PayloadType::ReadinessReport => 0x9002,
            PayloadType::Unknown(v) => v,
        }
    }
}

impl fmt::UpperHex for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u16 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenericNack => write!(f, "GenericNack"),
            Self::VehicleIdentificationRequest => write!(f, "VehicleIdentificationRequest"),
            Self::VehicleIdentificationRequestEid => write!(f, "VehicleIdentificationRequestEid"),
            Self::VehicleIdentificationRequestVin => write!(f, "VehicleIdentificationRequestVin"),
            Self::VehicleAnnouncement => write!(f, "VehicleAnnouncement"),
            Self::RoutingActivationRequest => write!(f, "RoutingActivationRequest"),
            Self::RoutingActivationResponse => write!(f, "RoutingActivationResponse"),
            Self::AliveCheckRequest => write!(f, "AliveCheckRequest"),
            Self::AliveCheckResponse => write!(f, "AliveCheckResponse"),
            Self::DiagnosticMessage => write!(f, "DiagnosticMessage"),
            Self::DiagnosticMessageAck => write!(f, "DiagnosticMessageAck"),
            Self::DiagnosticMessageNack => write!(f, "DiagnosticMessageNack"),
            Self::VciReport => write!(f, "VciReport"),
            Self::HealthReport => write!(f, "HealthReport"),
            Self::ReadinessReport => write!(f, "ReadinessReport"),
            Self::Unknown(v) => write!(f, "Unknown(0x{:04X})", v),
        }
    }
}
