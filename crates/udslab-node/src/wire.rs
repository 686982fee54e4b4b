//! Hex/JSON frame encoding for the HTTP transport
//!
//! A frame is `{"sid": "<2 hex digits>", "data": "<hex>"}` in both
//! directions. Malformed frames are transport errors (HTTP 400), never UDS
//! negatives: the engine only ever sees well-formed byte sequences.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use udslab_proto::{ServiceRequest, ServiceResponse};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("invalid sid hex value")]
    InvalidSidHex,

    #[error("sid is of unexpected length")]
    SidLength,

    #[error("invalid data hex value")]
    InvalidDataHex,
}

impl IntoResponse for FrameError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
        }
        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}

/// The JSON frame exchanged with testers and the registry's proxy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UdsHttpFrame {
    pub sid: String,
    #[serde(default)]
    pub data: String,
}

impl UdsHttpFrame {
    pub fn to_request(&self) -> Result<ServiceRequest, FrameError> {
        let sid = hex::decode(&self.sid).map_err(|_| FrameError::InvalidSidHex)?;
        if sid.len() != 1 {
            return Err(FrameError::SidLength);
        }
        let data = hex::decode(&self.data).map_err(|_| FrameError::InvalidDataHex)?;
        Ok(ServiceRequest::new(sid[0], data))
    }

    pub fn from_response(response: &ServiceResponse) -> Self {
        Self {
            sid: hex::encode([response.status()]),
            data: hex::encode(response.body()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use udslab_proto::NegativeResponseCode;

    use super::*;

    #[test]
    fn request_decoding() {
        let frame = UdsHttpFrame {
            sid: "22".into(),
            data: "f190".into(),
        };
        let req = frame.to_request().unwrap();
        assert_eq!(req.sid, 0x22);
        assert_eq!(req.payload, vec![0xF1, 0x90]);

        // empty data is a valid empty payload
        let frame = UdsHttpFrame {
            sid: "3e".into(),
            data: String::new(),
        };
        assert_eq!(frame.to_request().unwrap().payload, Vec::<u8>::new());
    }

    #[test]
    fn request_decoding_failures() {
        let bad_sid = UdsHttpFrame {
            sid: "zz".into(),
            data: String::new(),
        };
        assert_eq!(bad_sid.to_request(), Err(FrameError::InvalidSidHex));

        let long_sid = UdsHttpFrame {
            sid: "2762".into(),
            data: String::new(),
        };
        assert_eq!(long_sid.to_request(), Err(FrameError::SidLength));

        let bad_data = UdsHttpFrame {
            sid: "22".into(),
            data: "f19".into(),
        };
        assert_eq!(bad_data.to_request(), Err(FrameError::InvalidDataHex));
    }

    #[test]
    fn response_encoding() {
        let positive = ServiceResponse::positive(0x27, vec![0x01, 0xAA]);
        assert_eq!(
            UdsHttpFrame::from_response(&positive),
            UdsHttpFrame {
                sid: "67".into(),
                data: "01aa".into(),
            }
        );

        let negative = ServiceResponse::negative(0x22, NegativeResponseCode::RequestOutOfRange);
        assert_eq!(
            UdsHttpFrame::from_response(&negative),
            UdsHttpFrame {
                sid: "7f".into(),
                data: "2231".into(),
            }
        );
    }
}
