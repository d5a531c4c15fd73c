//! Error types for rsdrm.

use std::time::Duration;

use thiserror::Error;

/// Status code reported when the CDM restricts output for the loaded key.
pub const HDCP_OUTPUT_PROTECTION_FAILURE: i32 = 4327;
/// Status code reported when the connected display is not HDCP 2.2 compliant.
pub const HDCP_COMPLIANCE_CHECK_FAILURE: i32 = 4427;
/// Generic failure code used by the session layer itself.
pub const GENERIC_FAILURE: i32 = -1;

/// Main error type for rsdrm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No DRM helper is registered for the key system.
    #[error("Unsupported key system: {0}")]
    UnsupportedKeySystem(String),

    /// The selected backend needs a native CDM binding and none was supplied.
    #[error("No CDM binding configured for key system {0}")]
    NoCdmBinding(String),

    /// The PSSH box or init data is invalid or empty.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// The license response could not be used.
    #[error("Invalid license: {0}")]
    InvalidLicense(String),

    /// The CDM never produced a key request within the timeout.
    #[error("No key request produced within {0:?}")]
    KeyRequestTimeout(Duration),

    /// The license fetcher failed.
    #[error("License acquisition failed: {0}")]
    LicenseFetch(String),

    /// Key processing or decryption returned a status.
    #[error(transparent)]
    Cdm(#[from] CdmError),

    /// Failed to decode data.
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// JSON error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

/// Status-bearing failure from key processing or decryption.
///
/// Every variant maps to the integer code hosts surface to the user, see
/// [`CdmError::code`]. Unknown native statuses are carried verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CdmError {
    /// The CDM reported `OutputRestricted` for the key.
    #[error("HDCP output protection failure")]
    OutputProtection,

    /// HDCP 2.2 is required and the output link does not provide it.
    #[error("HDCP compliance check failure")]
    HdcpCompliance,

    /// The memory system failed to encode or decode a buffer.
    #[error("Memory system failure")]
    MemorySystem,

    /// No native session is open.
    #[error("No CDM session")]
    NoSession,

    /// The key status never arrived.
    #[error("Timed out waiting for key status")]
    Timeout,

    /// Raw status reported by the CDM.
    #[error("CDM status {0}")]
    Status(i32),
}

impl CdmError {
    /// Integer code for the failure.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            CdmError::OutputProtection => HDCP_OUTPUT_PROTECTION_FAILURE,
            CdmError::HdcpCompliance => HDCP_COMPLIANCE_CHECK_FAILURE,
            CdmError::MemorySystem | CdmError::NoSession | CdmError::Timeout => GENERIC_FAILURE,
            CdmError::Status(code) => *code,
        }
    }
}

/// Result type alias for rsdrm operations.
pub type Result<T> = std::result::Result<T, Error>;
