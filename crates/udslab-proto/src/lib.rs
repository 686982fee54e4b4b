//! UDS protocol vocabulary shared by the udslab engine and transport.
//!
//! This crate is pure and stateless: service id constants, the negative
//! response code catalog, request/response frame types, and the codec for
//! the nibble-packed address/length format.

pub mod codec;
mod frame;
mod nrc;

pub use frame::{ServiceRequest, ServiceResponse};
pub use nrc::NegativeResponseCode;

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const DYNAMICALLY_DEFINE_DATA_ID: u8 = 0x2C;
    pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// SecurityAccess (0x27) sub-functions
pub mod security_sub_function {
    /// Request a fresh seed
    pub const REQUEST_SEED: u8 = 0x01;
    /// Submit the computed key for the outstanding seed
    pub const SEND_KEY: u8 = 0x02;
}

/// DynamicallyDefineDataIdentifier (0x2C) sub-functions
pub mod ddid_sub_function {
    /// Define by identifier - compose the DDID from source DIDs
    pub const DEFINE_BY_IDENTIFIER: u8 = 0x01;
    /// Define by memory address
    pub const DEFINE_BY_MEMORY_ADDRESS: u8 = 0x02;
    /// Clear dynamically defined data identifier
    pub const CLEAR_DYNAMICALLY_DEFINED_DATA_IDENTIFIER: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    /// Hard reset - complete shutdown and restart of ECU
    pub const HARD_RESET: u8 = 0x01;
    /// Key off/on reset - simulate ignition cycle
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
}

/// DiagnosticSessionControl (0x10) session levels
pub mod session_type {
    pub const DEFAULT: u8 = 0x01;
    pub const EXTENDED: u8 = 0x02;
}

/// Device-specific negative response codes outside the ISO catalog
pub mod device_nrc {
    /// WriteMemoryByAddress data record does not match the decoded length
    /// field. Deliberately distinct from 0x13 so a tester can tell a framing
    /// error from a length-field mismatch.
    pub const DATA_LENGTH_MISMATCH: u8 = 0xFF;
}

/// Offset added to a service id to form its positive response status byte
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
