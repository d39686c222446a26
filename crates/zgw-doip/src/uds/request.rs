//! Typed views of the UDS services the gateway serves

use super::{service_id, UdsError, UdsMessage};

/// A UDS request after service-specific parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsRequest {
    ReadDataByIdentifier {
        did: u16,
    },
    RoutineControl {
        sub_function: u8,
        routine_id: u16,
        option_record: Vec<u8>,
    },
    RequestDownload {
        data_format: u8,
        address: u32,
        size: u32,
    },
    TransferData {
        block_counter: u8,
        data: Vec<u8>,
    },
    RequestTransferExit {
        parameters: Vec<u8>,
    },
    /// Any service this gateway does not implement
    Unsupported {
        service_id: u8,
    },
}

impl UdsRequest {
    pub fn parse(msg: &UdsMessage) -> Result<Self, UdsError> {
        let sid = msg.service_id;
        match sid {
            service_id::READ_DATA_BY_IDENTIFIER => {
                if msg.data.len() < 2 {
                    return Err(UdsError::invalid(sid, "missing data identifier"));
                }
                Ok(Self::ReadDataByIdentifier {
                    did: u16::from_be_bytes([msg.data[0], msg.data[1]]),
                })
            }
            service_id::ROUTINE_CONTROL => {
                let sub_function = msg
                    .sub_function
                    .ok_or_else(|| UdsError::invalid(sid, "missing sub-function"))?;
                if msg.data.len() < 2 {
                    return Err(UdsError::invalid(sid, "missing routine identifier"));
                }
                Ok(Self::RoutineControl {
                    sub_function,
                    routine_id: u16::from_be_bytes([msg.data[0], msg.data[1]]),
                    option_record: msg.data[2..].to_vec(),
                })
            }
            service_id::REQUEST_DOWNLOAD => Self::parse_request_download(&msg.data),
            service_id::TRANSFER_DATA => {
                let (&block_counter, data) = msg
                    .data
                    .split_first()
                    .ok_or_else(|| UdsError::invalid(sid, "missing block sequence counter"))?;
                Ok(Self::TransferData {
                    block_counter,
                    data: data.to_vec(),
                })
            }
            service_id::REQUEST_TRANSFER_EXIT => Ok(Self::RequestTransferExit {
                parameters: msg.data.clone(),
            }),
            other => Ok(Self::Unsupported { service_id: other }),
        }
    }

    /// dataFormatIdentifier(1) + addressAndLengthFormatIdentifier(1) + address + size
    fn parse_request_download(data: &[u8]) -> Result<Self, UdsError> {
        let sid = service_id::REQUEST_DOWNLOAD;
        if data.len() < 2 {
            return Err(UdsError::invalid(sid, "missing format identifiers"));
        }

        let data_format = data[0];
        let address_len = (data[1] & 0x0F) as usize;
        let size_len = ((data[1] >> 4) & 0x0F) as usize;
        if !(1..=4).contains(&address_len) || !(1..=4).contains(&size_len) {
            return Err(UdsError::out_of_range(
                sid,
                format!("unsupported addressAndLengthFormatIdentifier 0x{:02X}", data[1]),
            ));
        }
        if data.len() != 2 + address_len + size_len {
            return Err(UdsError::invalid(
                sid,
                format!(
                    "expected {} bytes, got {}",
                    2 + address_len + size_len,
                    data.len()
                ),
            ));
        }

        let address = be_uint(&data[2..2 + address_len]);
        let size = be_uint(&data[2 + address_len..]);
        Ok(Self::RequestDownload {
            data_format,
            address,
            size,
        })
    }

    pub fn service_id(&self) -> u8 {
        match self {
            Self::ReadDataByIdentifier { .. } => service_id::READ_DATA_BY_IDENTIFIER,
            Self::RoutineControl { .. } => service_id::ROUTINE_CONTROL,
            Self::RequestDownload { .. } => service_id::REQUEST_DOWNLOAD,
            Self::TransferData { .. } => service_id::TRANSFER_DATA,
            Self::RequestTransferExit { .. } => service_id::REQUEST_TRANSFER_EXIT,
            Self::Unsupported { service_id } => *service_id,
        }
    }
}

fn be_uint(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// RoutineControl result status byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutineStatus {
    Success,
    NotConnected,
    SendError,
    Unknown(u8),
}

impl From<u8> for RoutineStatus {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::NotConnected,
            0x02 => Self::SendError,
            other => Self::Unknown(other),
        }
    }
}

impl From<RoutineStatus> for u8 {
    fn from(status: RoutineStatus) -> Self {
        match status {
            RoutineStatus::Success => 0x00,
            RoutineStatus::NotConnected => 0x01,
            RoutineStatus::SendError => 0x02,
            RoutineStatus::Unknown(v) => v,
        }
    }
}

/// Positive RoutineControl response: 0x71, sub, RID(2), status, [count]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutineControlResponse {
    pub sub_function: u8,
    pub routine_id: u16,
    pub status: Option<RoutineStatus>,
    pub count: Option<u8>,
}

impl RoutineControlResponse {
    pub fn parse(msg: &UdsMessage) -> Result<Self, UdsError> {
        let sid = service_id::ROUTINE_CONTROL;
        if !msg.is_positive_response_to(sid) {
            return Err(UdsError::invalid(
                sid,
                format!("not a RoutineControl response (0x{:02X})", msg.service_id),
            ));
        }
        let sub_function = msg
            .sub_function
            .ok_or_else(|| UdsError::invalid(sid, "missing sub-function"))?;
        if msg.data.len() < 2 {
            return Err(UdsError::invalid(sid, "missing routine identifier"));
        }

        Ok(Self {
            sub_function,
            routine_id: u16::from_be_bytes([msg.data[0], msg.data[1]]),
            status: msg.data.get(2).copied().map(RoutineStatus::from),
            count: msg.data.get(3).copied(),
        })
    }

    /// Response data after the 0x71 byte
    pub fn to_response_data(&self) -> Vec<u8> {
        let mut data = vec![self.sub_function];
        data.extend_from_slice(&self.routine_id.to_be_bytes());
        data.extend(self.status.map(u8::from));
        data.extend(self.count);
        data
    }
}
