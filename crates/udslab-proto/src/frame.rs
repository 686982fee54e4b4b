//! Service request/response frames
//!
//! A request is one service id byte plus an opaque payload. A response is
//! either positive (`sid + 0x40`, then payload) or negative
//! (`0x7F`, echoed sid, response code).

use crate::{service_id, NegativeResponseCode, POSITIVE_RESPONSE_OFFSET};

/// An incoming service request frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub sid: u8,
    pub payload: Vec<u8>,
}

impl ServiceRequest {
    pub fn new(sid: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sid,
            payload: payload.into(),
        }
    }
}

/// A service response frame, produced per request and never retained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    /// Positive response: status byte is `sid + 0x40`
    Positive { sid: u8, data: Vec<u8> },
    /// Negative response: `[0x7F, sid, nrc]`
    Negative {
        sid: u8,
        nrc: NegativeResponseCode,
    },
}

impl ServiceResponse {
    pub fn positive(sid: u8, data: impl Into<Vec<u8>>) -> Self {
        Self::Positive {
            sid,
            data: data.into(),
        }
    }

    pub fn negative(sid: u8, nrc: NegativeResponseCode) -> Self {
        Self::Negative { sid, nrc }
    }

    /// The status byte leading the encoded frame
    pub fn status(&self) -> u8 {
        match self {
            Self::Positive { sid, .. } => sid.wrapping_add(POSITIVE_RESPONSE_OFFSET),
            Self::Negative { .. } => service_id::NEGATIVE_RESPONSE,
        }
    }

    /// Bytes following the status byte
    pub fn body(&self) -> Vec<u8> {
        match self {
            Self::Positive { data, .. } => data.clone(),
            Self::Negative { sid, nrc } => vec![*sid, (*nrc).into()],
        }
    }

    /// Encode the full frame, status byte first
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = self.body();
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.status());
        out.extend_from_slice(&body);
        out
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Self::Positive { .. })
    }
}
