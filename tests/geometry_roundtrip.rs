//! ROI transforms, channel modes and binning side effects through the
//! camera facade.
//!
//! Run with: cargo test --test geometry_roundtrip

use std::sync::Arc;

use frelon_daq::adapters::MockFrelon;
use frelon_daq::catalog::{
    calc_chan_mode, calc_ftm_input_chan, FrameTransferMode, InputChan, Reg, RegisterCatalog,
    RoiMode,
};
use frelon_daq::geometry::{Bin, Flip, Point, Roi, Size};
use frelon_daq::Camera;

fn camera(mock: &MockFrelon) -> Camera {
    Camera::with_catalog(
        Box::new(mock.clone()),
        Arc::new(mock.clone()),
        RegisterCatalog::default().without_settle_delays(),
        &MockFrelon::settings(),
    )
    .unwrap()
}

#[test]
fn test_chan_mode_bijection() {
    for chan_mode in 1..=16 {
        let (ftm, chan) = calc_ftm_input_chan(chan_mode).unwrap();
        assert_eq!(calc_chan_mode(ftm, chan), Some(chan_mode));
    }
    assert_eq!(calc_ftm_input_chan(17), None);
}

#[test]
fn test_mirrored_quad_roi() {
    let mock = MockFrelon::new();
    let mut cam = camera(&mock);
    cam.set_input_chan(InputChan::CHAN12).unwrap();
    assert_eq!(mock.register(Reg::ChanMode), Some(7));
    assert_eq!(cam.chan_mode_name().unwrap(), "FFM-1&2");

    cam.set_roi(&Roi::from_xywh(10, 0, 100, 50)).unwrap();
    assert_eq!(mock.register(Reg::RoiPixelBegin), Some(0));
    assert_eq!(mock.register(Reg::RoiPixelWidth), Some(128));
    assert_eq!(mock.register(Reg::RoiLineBegin), Some(0));
    assert_eq!(mock.register(Reg::RoiLineWidth), Some(50));

    let roi = cam.roi().unwrap();
    assert_eq!(roi.size(), Size::new(256, 50));
    assert_eq!(cam.check_roi(&Roi::from_xywh(10, 0, 100, 50)).unwrap(), roi);
}

#[test]
fn test_single_channel_roundtrip_is_idempotent() {
    let chans = [
        InputChan::CHAN1,
        InputChan::CHAN2,
        InputChan::CHAN3,
        InputChan::CHAN4,
    ];
    let flips = [
        Flip::new(false, false),
        Flip::new(true, false),
        Flip::new(false, true),
        Flip::new(true, true),
    ];

    for chan in chans {
        for flip in flips {
            for bin in [Bin::new(1, 1), Bin::new(2, 2)] {
                let mock = MockFrelon::new();
                let mut cam = camera(&mock);
                cam.set_input_chan(chan).unwrap();
                cam.set_flip(flip).unwrap();
                cam.set_bin(bin).unwrap();

                let req = Roi::from_xywh(64, 100, 128, 50);
                cam.set_roi(&req).unwrap();
                let hw_roi = cam.roi().unwrap();
                assert_eq!(hw_roi, req, "chan={chan:?} flip={flip:?} bin={bin}");

                let before = mock.writes().len();
                cam.set_roi(&hw_roi).unwrap();
                assert_eq!(cam.roi().unwrap(), hw_roi);
                assert_eq!(mock.writes().len(), before, "chan={chan:?} flip={flip:?}");
            }
        }
    }
}

#[test]
fn test_unaligned_roi_grows_to_hardware_grid() {
    let mock = MockFrelon::new();
    let mut cam = camera(&mock);
    cam.set_input_chan(InputChan::CHAN1).unwrap();

    let hw_roi = cam.check_roi(&Roi::from_xywh(40, 7, 50, 9)).unwrap();
    assert_eq!(hw_roi, Roi::from_xywh(32, 7, 64, 9));
    // nothing written by a check
    assert_eq!(cam.roi_mode().unwrap(), RoiMode::None);
}

#[test]
fn test_bin_change_resets_roi_and_offset() {
    let mock = MockFrelon::new();
    let mut cam = camera(&mock);
    cam.set_input_chan(InputChan::CHAN1).unwrap();
    cam.set_bin(Bin::new(1, 4)).unwrap();
    cam.set_roi(&Roi::from_xywh(0, 10, 128, 20)).unwrap();
    cam.set_roi_bin_offset(Point::new(0, 2)).unwrap();
    assert_eq!(mock.register(Reg::RoiLineBegin), Some(42));

    cam.set_bin(Bin::new(2, 8)).unwrap();
    assert_eq!(cam.roi_mode().unwrap(), RoiMode::None);
    assert_eq!(cam.roi().unwrap(), Roi::default());
    assert_eq!(cam.roi_bin_offset().unwrap(), Point::default());
    assert_eq!(mock.register(Reg::RoiLineBegin), Some(40));
    assert_eq!(cam.bin().unwrap(), Bin::new(2, 8));
}

#[test]
fn test_bin_limits() {
    let mock = MockFrelon::new();
    let mut cam = camera(&mock);
    assert_eq!(cam.check_bin(Bin::new(32, 2000)), Bin::new(8, 1024));
    assert!(cam.set_bin(Bin::new(16, 1)).is_err());
    assert_eq!(cam.bin().unwrap(), Bin::new(1, 1));
}

#[test]
fn test_frame_transfer_halves_the_frame() {
    let mock = MockFrelon::new();
    let mut cam = camera(&mock);
    assert_eq!(cam.max_frame_size().unwrap(), Size::new(2048, 2048));

    cam.set_frame_transfer_mode(FrameTransferMode::Ftm).unwrap();
    assert_eq!(cam.frame_transfer_mode().unwrap(), FrameTransferMode::Ftm);
    assert_eq!(cam.input_chan().unwrap(), InputChan::CHAN1234);
    assert_eq!(cam.frame_size().unwrap(), Size::new(2048, 1024));
    assert_eq!(cam.default_input_chan(FrameTransferMode::Ftm).unwrap(), Some(InputChan::CHAN1234));
}
