//! Custom error types for the detector control core.
//!
//! This module defines the primary error type, `FrelonError`. Using the
//! `thiserror` crate, it gives every layer (protocol engine, register access,
//! geometry, timing, camera) a single consistent way to report failures.
//!
//! ## Error Hierarchy
//!
//! - **`UnexpectedAnswer`**: a reply that matches none of the recognised frame
//!   grammars. Fatal, never retried.
//! - **`Device`**: the camera answered `!E:<text>`. The text is kept verbatim;
//!   the register access layer only looks inside it for the `FAI` and `BSY`
//!   markers (see [`FrelonError::device_fault`]).
//! - **`StillBusy`** / **`StillFailing`**: the bounded write-retry policy gave up.
//! - **`InvalidValue`**: the caller asked for something the hardware cannot
//!   represent (out of range value, unavailable channel mode, listener already
//!   registered, ...).
//! - **`Contract`**: a programming error in the caller, such as reading a reply
//!   when no operation is pending.
//! - **`NotSupported`**: the operation is gated by a capability this camera
//!   does not have. Kept separate so front ends can suggest a firmware upgrade.
//! - **`Timeout`** / **`MultiLineTimeout`**: the transport produced no data in time.
//! - **`Camera`**: the camera is in a state the operation cannot handle.
//!
//! Transport and configuration failures are wrapped with `#[from]` so `?`
//! works across the crate boundary.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, FrelonError>;

/// Device error marker for a temporary command failure.
pub const FAIL_MARKER: &str = "FAI";
/// Device error marker for a busy camera.
pub const BUSY_MARKER: &str = "BSY";

/// Errors raised by the camera control stack.
#[derive(Error, Debug)]
pub enum FrelonError {
    /// Settings could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Settings loaded but rejected.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port could not be opened or configured.
    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// No reply within the timeout.
    #[error("Serial line timeout after {0:?}")]
    Timeout(Duration),

    /// A multi-line reply did not complete in time.
    #[error("Timeout reading multi-line response after {0:?}")]
    MultiLineTimeout(Duration),

    /// Reply that does not match the request.
    #[error("Unexpected answer from camera: {0:?}")]
    UnexpectedAnswer(String),

    /// Error reported by the camera.
    #[error("Frelon Error: {0}")]
    Device(String),

    /// Camera kept answering busy.
    #[error("Frelon camera still busy after {0:?}")]
    StillBusy(Duration),

    /// Command kept failing after this many attempts.
    #[error("Frelon camera still failing after {0} retrie(s)")]
    StillFailing(u32),

    /// Value out of range for the target.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// API misuse, such as a second outstanding request.
    #[error("Contract violation: {0}")]
    Contract(String),

    /// Not available on this camera model.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Camera level failure.
    #[error("Camera error: {0}")]
    Camera(String),
}

/// Retryable device conditions recognised in `!E` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFault {
    /// Temporary command failure (`FAI`): retried once.
    Fail,
    /// Device busy (`BSY`): retried within a time budget.
    Busy,
}

impl FrelonError {
    /// Classify a device error as one of the retryable faults.
    ///
    /// Returns `None` for every other error, including device errors that
    /// carry neither marker.
    pub fn device_fault(&self) -> Option<DeviceFault> {
        match self {
            Self::Device(text) if text.contains(FAIL_MARKER) => Some(DeviceFault::Fail),
            Self::Device(text) if text.contains(BUSY_MARKER) => Some(DeviceFault::Busy),
            _ => None,
        }
    }

    /// True for capability-gated failures.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported(_))
    }

    /// True when the transport did not answer in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::MultiLineTimeout(_))
    }
}
