//! Control core for Frelon CCD area detectors.
//!
//! The camera is driven over a blocking ASCII register protocol on a serial
//! line. The crate is layered bottom-up:
//!
//! - [`protocol::SerialLine`]: framing, reply decoding, the register cache
//!   and the one-operation-at-a-time session discipline.
//! - [`registers::RegisterAccess`]: typed register access with the busy/fail
//!   write retry policy of [`error_recovery`].
//! - [`model::Model`]: capabilities decoded from the firmware version and
//!   serial number word.
//! - [`geometry::Geometry`]: channel modes, binning, flip, and ROI
//!   conversion between channel, image and final coordinates.
//! - [`timing::TimingCtrl`]: readout/transfer/dead time and the sequencer
//!   timing measurement cache.
//! - [`camera::Camera`]: the facade tying everything together.
//!
//! [`adapters`] holds the transport seam: the real serial port and the
//! [`adapters::MockFrelon`] simulated camera used by the tests.

/// Serial port and simulated camera.
pub mod adapters;
/// Camera facade.
pub mod camera;
/// Register, command and mode tables.
pub mod catalog;
/// Layered settings.
pub mod config;
/// Error type.
pub mod error;
/// Retry policy for busy or failing commands.
pub mod error_recovery;
/// Readout geometry and ROI transforms.
pub mod geometry;
/// Camera model decoded from the identification registers.
pub mod model;
/// Serial protocol engine.
pub mod protocol;
/// Typed register access with retry.
pub mod registers;
/// Sequencer timing readback and cache.
pub mod timing;

pub use camera::Camera;
pub use config::Settings;
pub use error::{FrelonError, Result};
