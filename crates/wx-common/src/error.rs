//! Error types for the weather daemon services.

use thiserror::Error;

/// Result type alias using WxError.
pub type WxResult<T> = Result<T, WxError>;

/// Primary error type for weather acquisition and serving.
#[derive(Debug, Error)]
pub enum WxError {
    // === Numerics ===
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Download Errors ===
    #[error("Downloader error: {0}")]
    Downloader(String),

    #[error("Download cancelled")]
    Cancelled,

    // === External tool ===
    #[error("Subprocess failed with status {status}: {message}")]
    Subprocess { status: i32, message: String },

    // === Format Errors ===
    #[error("Invalid grib index: {0}")]
    GribIndex(String),

    #[error("Unparseable wgrib2 output: {0}")]
    WgribOutput(String),

    #[error("Malformed station record: {0}")]
    StationRecord(String),

    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    // === Config Errors ===
    #[error("Corrupt configuration: {0}")]
    ConfigCorrupt(String),

    // === Server Errors ===
    #[error("Port in use: {0}")]
    PortInUse(String),

    #[error("Malformed request: {0}")]
    BadRequest(String),
}

impl WxError {
    /// Whether the failure is expected to clear on its own and only
    /// warrants a retry cooldown.
    pub fn is_transient(&self) -> bool {
        matches!(self, WxError::Downloader(_) | WxError::Subprocess { .. })
    }
}

impl From<std::io::Error> for WxError {
    fn from(err: std::io::Error) -> Self {
        WxError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for WxError {
    fn from(err: serde_json::Error) -> Self {
        WxError::ConfigCorrupt(format!("JSON error: {}", err))
    }
}
