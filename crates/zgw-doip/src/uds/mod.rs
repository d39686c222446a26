//! UDS (Unified Diagnostic Services) layer carried inside DoIP diagnostic messages

mod codec;
mod error;
mod nrc;
mod request;

pub use codec::{
    encode_negative_response, encode_positive_response, encode_request, UdsMessage,
};
pub use error::UdsError;
pub use nrc::NegativeResponseCode;
pub use request::{RoutineControlResponse, RoutineStatus, UdsRequest};

/// Offset added to a service id to form its positive response id
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// UDS Service IDs
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const COMMUNICATION_CONTROL: u8 = 0x28;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const READ_DTC_INFORMATION: u8 = 0x19;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// Gateway data identifiers served by ReadDataByIdentifier
pub mod did {
    /// Own VCI record
    pub const VCI_INDIVIDUAL: u16 = 0xF194;
    /// Count + all known VCI records
    pub const VCI_CONSOLIDATED: u16 = 0xF195;
    /// Count + own health record
    pub const HEALTH_STATUS: u16 = 0xF1A0;
    /// Count + all known health records
    pub const HEALTH_STATUS_CONSOLIDATED: u16 = 0xF1A1;
}

/// Gateway routine identifiers
pub mod rid {
    pub const VCI_COLLECTION_START: u16 = 0xF001;
    pub const VCI_SEND_REPORT: u16 = 0xF002;
    pub const READINESS_CHECK: u16 = 0xF003;
    pub const READINESS_SEND_REPORT: u16 = 0xF004;
}

/// Services whose second byte is a sub-function
pub fn has_sub_function(service_id: u8) -> bool {
    let request_id = if is_response_id(service_id) {
        service_id - POSITIVE_RESPONSE_OFFSET
    } else {
        service_id
    };
    matches!(
        request_id,
        service_id::DIAGNOSTIC_SESSION_CONTROL
            | service_id::ECU_RESET
            | service_id::READ_DTC_INFORMATION
            | service_id::SECURITY_ACCESS
            | service_id::COMMUNICATION_CONTROL
            | service_id::ROUTINE_CONTROL
            | service_id::TESTER_PRESENT
            | service_id::CONTROL_DTC_SETTING
    )
}

/// Response ids have bit 6 set; 0x7F is the negative response
pub fn is_response_id(service_id: u8) -> bool {
    service_id & POSITIVE_RESPONSE_OFFSET != 0
}
