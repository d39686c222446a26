//! Typed DoIP payloads
//!
//! Each payload knows its own layout and how to wrap itself into a
//! [`DoipFrame`]. All multi-byte fields are big-endian.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{DoipFrame, PayloadError, PayloadType};

fn ensure_len(payload_type: PayloadType, payload: &[u8], need: usize) -> Result<(), PayloadError> {
    if payload.len() < need {
        return Err(PayloadError::TooShort {
            payload_type,
            need,
            got: payload.len(),
        });
    }
    Ok(())
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Routing activation types
pub mod activation_type {
    pub const DEFAULT: u8 = 0x00;
    pub const WWH_OBD: u8 = 0x01;
    pub const CENTRAL_SECURITY: u8 = 0xE0;
}

// =============================================================================
// Routing Activation (0x0005 / 0x0006)
// =============================================================================

/// Routing activation request: SA(2) + type(1) + reserved(4) [+ OEM(4)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationRequest {
    pub source_address: u16,
    pub activation_type: u8,
    pub reserved: u32,
    pub oem_specific: Option<u32>,
}

impl RoutingActivationRequest {
    pub const MIN_LEN: usize = 7;

    pub fn new(source_address: u16, activation_type: u8) -> Self {
        Self {
            source_address,
            activation_type,
            reserved: 0,
            oem_specific: None,
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        ensure_len(PayloadType::RoutingActivationRequest, payload, Self::MIN_LEN)?;
        Ok(Self {
            source_address: be_u16(payload, 0),
            activation_type: payload[2],
            reserved: be_u32(payload, 3),
            oem_specific: (payload.len() >= 11).then(|| be_u32(payload, 7)),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(11);
        buf.put_u16(self.source_address);
        buf.put_u8(self.activation_type);
        buf.put_u32(self.reserved);
        if let Some(oem) = self.oem_specific {
            buf.put_u32(oem);
        }
        buf.freeze()
    }

    pub fn into_frame(self) -> DoipFrame {
        DoipFrame::new(PayloadType::RoutingActivationRequest, self.to_bytes())
    }
}

/// Routing activation response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingActivationCode {
    DeniedUnknownSourceAddress,
    DeniedNoSocket,
    DeniedSourceAddressInUse,
    DeniedSourceAddressDifferent,
    DeniedAlreadyActive,
    DeniedAuthenticationMissing,
    DeniedConfirmationRejected,
    Success,
    ConfirmationRequired,
    Unknown(u8),
}

impl From<u8> for RoutingActivationCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::DeniedUnknownSourceAddress,
            0x01 => Self::DeniedNoSocket,
            0x02 => Self::DeniedSourceAddressInUse,
            0x03 => Self::DeniedSourceAddressDifferent,
            0x04 => Self::DeniedAlreadyActive,
            0x05 => Self::DeniedAuthenticationMissing,
            0x06 => Self::DeniedConfirmationRejected,
            0x10 => Self::Success,
            0x11 => Self::ConfirmationRequired,
            other => Self::Unknown(other),
        }
    }
}

impl From<RoutingActivationCode> for u8 {
    fn from(code: RoutingActivationCode) -> Self {
        match code {
            RoutingActivationCode::DeniedUnknownSourceAddress => 0x00,
            RoutingActivationCode::DeniedNoSocket => 0x01,
            RoutingActivationCode::DeniedSourceAddressInUse => 0x02,
            RoutingActivationCode::DeniedSourceAddressDifferent => 0x03,
            RoutingActivationCode::DeniedAlreadyActive => 0x04,
            RoutingActivationCode::DeniedAuthenticationMissing => 0x05,
            RoutingActivationCode::DeniedConfirmationRejected => 0x06,
            RoutingActivationCode::Success => 0x10,
            RoutingActivationCode::ConfirmationRequired => 0x11,
            RoutingActivationCode::Unknown(v) => v,
        }
    }
}

impl fmt::UpperHex for RoutingActivationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

/// Routing activation response: entity(2) + tester(2) + code(1) + reserved(4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingActivationResponse {
    pub entity_address: u16,
    pub tester_address: u16,
    pub code: RoutingActivationCode,
    pub reserved: u32,
}

impl RoutingActivationResponse {
    pub const LEN: usize = 9;

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        ensure_len(PayloadType::RoutingActivationResponse, payload, Self::LEN)?;
        Ok(Self {
            entity_address: be_u16(payload, 0),
            tester_address: be_u16(payload, 2),
            code: RoutingActivationCode::from(payload[4]),
            reserved: be_u32(payload, 5),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16(self.entity_address);
        buf.put_u16(self.tester_address);
        buf.put_u8(self.code.into());
        buf.put_u32(self.reserved);
        buf.freeze()
    }

    pub fn into_frame(self) -> DoipFrame {
        DoipFrame::new(PayloadType::RoutingActivationResponse, self.to_bytes())
    }
}

// =============================================================================
// Alive Check (0x0007 / 0x0008)
// =============================================================================

/// Alive check request carrying the sender's logical address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveCheckRequest {
    pub source_address: u16,
}

impl AliveCheckRequest {
    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        ensure_len(PayloadType::AliveCheckRequest, payload, 2)?;
        Ok(Self {
            source_address: be_u16(payload, 0),
        })
    }

    pub fn into_frame(self) -> DoipFrame {
        DoipFrame::new(
            PayloadType::AliveCheckRequest,
            self.source_address.to_be_bytes().to_vec(),
        )
    }
}

/// Alive check response; some peers send it without an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliveCheckResponse {
    pub source_address: Option<u16>,
}

impl AliveCheckResponse {
    pub fn parse(payload: &[u8]) -> Self {
        Self {
            source_address: (payload.len() >= 2).then(|| be_u16(payload, 0)),
        }
    }

    pub fn into_frame(self) -> DoipFrame {
        let payload = self
            .source_address
            .map(|a| a.to_be_bytes().to_vec())
            .unwrap_or_default();
        DoipFrame::new(PayloadType::AliveCheckResponse, payload)
    }
}

// =============================================================================
// Diagnostic Message (0x8001 / 0x8002 / 0x8003)
// =============================================================================

/// Diagnostic message: SA(2) + TA(2) + UDS bytes (at least one)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    pub source_address: u16,
    pub target_address: u16,
    pub user_data: Bytes,
}

impl DiagnosticMessage {
    pub const MIN_LEN: usize = 5;

    pub fn new(source_address: u16, target_address: u16, user_data: impl Into<Bytes>) -> Self {
        Self {
            source_address,
            target_address,
            user_data: user_data.into(),
        }
    }

    pub fn parse(payload: &Bytes) -> Result<Self, PayloadError> {
        ensure_len(PayloadType::DiagnosticMessage, payload, Self::MIN_LEN)?;
        Ok(Self {
            source_address: be_u16(payload, 0),
            target_address: be_u16(payload, 2),
            user_data: payload.slice(4..),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.user_data.len());
        buf.put_u16(self.source_address);
        buf.put_u16(self.target_address);
        buf.put_slice(&self.user_data);
        buf.freeze()
    }

    pub fn into_frame(self) -> DoipFrame {
        DoipFrame::new(PayloadType::DiagnosticMessage, self.to_bytes())
    }
}

/// Diagnostic message acknowledgement codes
pub mod diagnostic_ack_code {
    pub const ACKNOWLEDGED: u8 = 0x00;
}

/// Diagnostic message negative acknowledgement codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticNackCode {
    InvalidSourceAddress,
    UnknownTargetAddress,
    MessageTooLarge,
    OutOfMemory,
    TargetUnreachable,
    UnknownNetwork,
    TransportProtocolError,
    Unknown(u8),
}

impl From<u8> for DiagnosticNackCode {
    fn from(value: u8) -> Self {
        match value {
            0x02 => Self::InvalidSourceAddress,
            0x03 => Self::UnknownTargetAddress,
            0x04 => Self::MessageTooLarge,
            0x05 => Self::OutOfMemory,
            0x06 => Self::TargetUnreachable,
            0x07 => Self::UnknownNetwork,
            0x08 => Self::TransportProtocolError,
            other => Self::Unknown(other),
        }
    }
}

impl From<DiagnosticNackCode> for u8 {
    fn from(code: DiagnosticNackCode) -> Self {
        match code {
            DiagnosticNackCode::InvalidSourceAddress => 0x02,
            DiagnosticNackCode::UnknownTargetAddress => 0x03,
            DiagnosticNackCode::MessageTooLarge => 0x04,
            DiagnosticNackCode::OutOfMemory => 0x05,
            DiagnosticNackCode::TargetUnreachable => 0x06,
            DiagnosticNackCode::UnknownNetwork => 0x07,
            DiagnosticNackCode::TransportProtocolError => 0x08,
            DiagnosticNackCode::Unknown(v) => v,
        }
    }
}

/// Positive or negative diagnostic acknowledgement: SA(2) + TA(2) + code(1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticAck {
    pub source_address: u16,
    pub target_address: u16,
    pub code: u8,
}

impl DiagnosticAck {
    pub const LEN: usize = 5;

    pub fn acknowledged(source_address: u16, target_address: u16) -> Self {
        Self {
            source_address,
            target_address,
            code: diagnostic_ack_code::ACKNOWLEDGED,
        }
    }

    pub fn rejected(source_address: u16, target_address: u16, code: DiagnosticNackCode) -> Self {
        Self {
            source_address,
            target_address,
            code: code.into(),
        }
    }

    pub fn parse(payload_type: PayloadType, payload: &[u8]) -> Result<Self, PayloadError> {
        ensure_len(payload_type, payload, Self::LEN)?;
        Ok(Self {
            source_address: be_u16(payload, 0),
            target_address: be_u16(payload, 2),
            code: payload[4],
        })
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(&self.source_address.to_be_bytes());
        buf.extend_from_slice(&self.target_address.to_be_bytes());
        buf.push(self.code);
        buf
    }

    pub fn into_ack_frame(self) -> DoipFrame {
        DoipFrame::new(PayloadType::DiagnosticMessageAck, self.to_bytes())
    }

    pub fn into_nack_frame(self) -> DoipFrame {
        DoipFrame::new(PayloadType::DiagnosticMessageNack, self.to_bytes())
    }
}

// =============================================================================
// Generic Header NACK (0x0000)
// =============================================================================

/// Generic header negative acknowledgement codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericNackCode {
    IncorrectPattern,
    UnknownPayloadType,
    MessageTooLarge,
    OutOfMemory,
    InvalidPayloadLength,
    Unknown(u8),
}

impl From<u8> for GenericNackCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::IncorrectPattern,
            0x01 => Self::UnknownPayloadType,
            0x02 => Self::MessageTooLarge,
            0x03 => Self::OutOfMemory,
            0x04 => Self::InvalidPayloadLength,
            other => Self::Unknown(other),
        }
    }
}

impl From<GenericNackCode> for u8 {
    fn from(code: GenericNackCode) -> Self {
        match code {
            GenericNackCode::IncorrectPattern => 0x00,
            GenericNackCode::UnknownPayloadType => 0x01,
            GenericNackCode::MessageTooLarge => 0x02,
            GenericNackCode::OutOfMemory => 0x03,
            GenericNackCode::InvalidPayloadLength => 0x04,
            GenericNackCode::Unknown(v) => v,
        }
    }
}

impl GenericNackCode {
    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        ensure_len(PayloadType::GenericNack, payload, 1)?;
        Ok(Self::from(payload[0]))
    }

    pub fn into_frame(self) -> DoipFrame {
        DoipFrame::new(PayloadType::GenericNack, vec![u8::from(self)])
    }
}
