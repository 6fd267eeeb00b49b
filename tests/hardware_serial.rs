//! Frelon hardware validation over a real serial line.
//!
//! Hardware: any Frelon with firmware >= 3.0i on the port named by
//! `FRELON_TEST_PORT` (default /dev/ttyS0). Frame grabber status is not
//! available here, so only the serial-line status path is exercised.
//!
//! Run with: cargo test --features hardware_tests --test hardware_serial -- --ignored --nocapture

#![cfg(feature = "hardware_tests")]

use std::sync::Arc;

use frelon_daq::adapters::{FrameGrabberLink, SerialAdapter};
use frelon_daq::catalog::{Reg, Status};
use frelon_daq::error::FrelonError;
use frelon_daq::geometry::{Bin, Roi};
use frelon_daq::{Camera, Result, Settings};

/// Link stand-in when no frame grabber is attached.
struct SerialOnlyLink;

impl FrameGrabberLink for SerialOnlyLink {
    fn ccd_status(&self) -> Result<i32> {
        Err(FrelonError::NotSupported("no frame grabber attached".into()))
    }

    fn chan_up(&self) -> Result<bool> {
        Ok(true)
    }

    fn reset_link(&self) -> Result<()> {
        Ok(())
    }
}

fn open_camera() -> Camera {
    let mut settings = Settings::default();
    settings.serial.port =
        std::env::var("FRELON_TEST_PORT").unwrap_or_else(|_| "/dev/ttyS0".to_string());

    let transport = SerialAdapter::open(&settings.serial, &settings.timeouts)
        .unwrap_or_else(|e| panic!("Failed to open {}: {}", settings.serial.port, e));
    Camera::new(Box::new(transport), Arc::new(SerialOnlyLink), &settings).unwrap()
}

#[test]
#[ignore]
fn test_identify_camera() {
    let cam = open_camera();
    let name = cam.model().name().unwrap();
    println!("Found Frelon {} #{} FW:{}", name, cam.model().serial_nb().unwrap(), cam.model().firmware());
    assert!(!name.is_empty());
    assert_eq!(cam.status(true, false).unwrap(), Status::WAIT);
}

#[test]
#[ignore]
fn test_register_roundtrip_and_restore() {
    let mut cam = open_camera();
    let orig_bin = cam.bin().unwrap();

    cam.set_bin(Bin::new(2, 2)).unwrap();
    // bypass the cache
    let line = cam.serial_line().clone();
    line.set_cache_active(false);
    assert_eq!(cam.registers().read_register(Reg::BinHorz).unwrap(), 2);
    line.set_cache_active(true);

    cam.set_roi(&Roi::from_xywh(0, 0, 256, 128)).unwrap();
    println!("hw roi: {}", cam.roi().unwrap());

    cam.set_roi(&Roi::default()).unwrap();
    cam.set_bin(orig_bin).unwrap();
}
