//! Hardware adapter implementations
//!
//! The protocol engine talks to the camera through the [`Transport`] trait,
//! a blocking line-oriented serial link. Camera synchronisation also needs a
//! couple of primitives from the frame grabber the camera is plugged into,
//! exposed by [`FrameGrabberLink`].
//!
//! - [`SerialAdapter`] drives a real RS-232 port (feature `instrument_serial`).
//! - [`mock::MockFrelon`] simulates a camera for tests and offline work.

use std::time::Duration;

use crate::error::Result;

/// Simulated camera.
pub mod mock;
/// Serial port transport.
#[cfg(feature = "instrument_serial")]
pub mod serial_adapter;

pub use mock::MockFrelon;
#[cfg(feature = "instrument_serial")]
pub use serial_adapter::SerialAdapter;

/// Blocking line-oriented serial transport.
pub trait Transport: Send {
    /// Send raw bytes. With `no_wait` the call may return before the bytes
    /// have left the output buffer.
    fn write(&mut self, data: &[u8], no_wait: bool) -> Result<()>;

    /// Read one line, terminator included, of at most `max_len` bytes.
    ///
    /// Fails with [`FrelonError::Timeout`](crate::error::FrelonError::Timeout)
    /// when no complete line arrives within `timeout`.
    fn read_line(&mut self, max_len: usize, timeout: Duration) -> Result<String>;

    /// Drop any pending input.
    fn flush(&mut self) -> Result<()>;

    /// Bytes waiting in the input buffer.
    fn available_bytes(&mut self) -> Result<usize>;

    /// Default reply timeout.
    fn timeout(&self) -> Duration;

    /// Change the reply timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
}

/// Frame-grabber primitives used while synchronising with the camera.
pub trait FrameGrabberLink: Send + Sync {
    /// CCD status byte forwarded by the camera to the frame grabber.
    fn ccd_status(&self) -> Result<i32>;

    /// Whether the optical link to the camera is up.
    fn chan_up(&self) -> Result<bool>;

    /// Reset the optical link.
    fn reset_link(&self) -> Result<()>;
}
