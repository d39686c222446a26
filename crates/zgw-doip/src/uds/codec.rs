//! UDS message encoding and decoding

use super::{
    has_sub_function, is_response_id, service_id, NegativeResponseCode, UdsError,
    POSITIVE_RESPONSE_OFFSET,
};

/// A decoded UDS request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsMessage {
    pub service_id: u8,
    pub sub_function: Option<u8>,
    pub data: Vec<u8>,
}

impl UdsMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, UdsError> {
        let (&sid, rest) = bytes.split_first().ok_or(UdsError::EmptyMessage)?;

        match rest.split_first() {
            Some((&sub, data)) if has_sub_function(sid) => Ok(Self {
                service_id: sid,
                sub_function: Some(sub),
                data: data.to_vec(),
            }),
            _ => Ok(Self {
                service_id: sid,
                sub_function: None,
                data: rest.to_vec(),
            }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_request(self.service_id, self.sub_function, &self.data)
    }

    pub fn is_negative_response(&self) -> bool {
        self.service_id == service_id::NEGATIVE_RESPONSE
    }

    pub fn is_positive_response(&self) -> bool {
        !self.is_negative_response() && is_response_id(self.service_id)
    }

    pub fn is_response(&self) -> bool {
        is_response_id(self.service_id)
    }

    /// Whether this is the positive response to `request_sid`
    pub fn is_positive_response_to(&self, request_sid: u8) -> bool {
        self.service_id == request_sid.wrapping_add(POSITIVE_RESPONSE_OFFSET)
    }

    /// `(rejected service id, NRC)` if this is a well-formed negative response
    pub fn negative_response(&self) -> Option<(u8, NegativeResponseCode)> {
        if !self.is_negative_response() || self.data.len() < 2 {
            return None;
        }
        Some((self.data[0], NegativeResponseCode::from(self.data[1])))
    }

    /// Turn a negative response into `UdsError::NegativeResponse`
    pub fn into_result(self) -> Result<Self, UdsError> {
        match self.negative_response() {
            Some((service_id, nrc)) => Err(UdsError::NegativeResponse { service_id, nrc }),
            None => Ok(self),
        }
    }
}

pub fn encode_request(service_id: u8, sub_function: Option<u8>, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + data.len());
    out.push(service_id);
    out.extend(sub_function);
    out.extend_from_slice(data);
    out
}

/// Build a positive response: `service_id + 0x40` followed by `data`
pub fn encode_positive_response(service_id: u8, data: &[u8]) -> Vec<u8> {
    let mut resp = Vec::with_capacity(1 + data.len());
    resp.push(service_id.wrapping_add(POSITIVE_RESPONSE_OFFSET));
    resp.extend_from_slice(data);
    resp
}

/// Build a negative response: `0x7F, service_id, nrc`
pub fn encode_negative_response(service_id: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![service_id::NEGATIVE_RESPONSE, service_id, nrc.into()]
}
