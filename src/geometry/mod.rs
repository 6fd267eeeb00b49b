//! Geometry engine.
//!
//! Holds the channel / binning / flip / ROI configuration of the camera and
//! converts regions of interest between three coordinate spaces:
//!
//! - **channel space**: the rectangle written to the `RPB/RPW/RLB/RLW`
//!   registers, relative to one readout channel;
//! - **image space**: the binned rectangle of the composed sensor image;
//! - **final space**: what the caller sees, once the channel offset has been
//!   applied and the mirrored channels tiled along each axis.
//!
//! When two channels are active on an axis the second half of the sensor is
//! read out in the opposite direction, so every pixel is expressed as an
//! offset from its nearest readout corner (see [`Layout::xform`]).
//!
//! The device bins from its own corner, not from the ROI corner. The part of
//! a ROI origin that does not fall on the binning grid is kept as the *bin
//! offset*; the shift that makes two mirrored halves form one continuous
//! image is kept as the *channel offset*. Neither is written to hardware.
//!
//! All operations take a [`HwContext`] borrowing the register access layer,
//! the capability model and the timing cache owned by the camera.

/// ROI, binning and flip value types.
pub mod coords;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::catalog::{
    calc_chan_mode, calc_ftm_input_chan, chan_mode_bit, input_chan_mode_name, FrameTransferMode,
    InputChan, Reg, RoiMode, Spb2Config, ATMEL_MODES_AVAIL, DEF_INPUT_CHAN_LIST,
    KODAK_MODES_AVAIL, MAX_BIN_X, MAX_BIN_Y, ROI_ALIGN_X, ROI_ALIGN_Y,
};
use crate::error::{FrelonError, Result};
use crate::model::{ChipType, Feature, GeomType, Model};
use crate::registers::RegisterAccess;
use crate::timing::TimingCtrl;

pub use coords::{Bin, Corner, Flip, Point, Roi, Size};

/// Hardware collaborators borrowed by every geometry operation.
#[derive(Clone, Copy)]
pub struct HwContext<'a> {
    /// Register access for the camera.
    pub regs: &'a RegisterAccess,
    /// Decoded camera model.
    pub model: &'a Model,
    /// Sequencer timing controller.
    pub timing: &'a TimingCtrl,
}

/// Receives the new dead time whenever a geometry change alters it.
pub trait DeadTimeListener: Send + Sync {
    /// Called with the new dead time in seconds.
    fn dead_time_changed(&self, dead_time: f64);
}

/// Token identifying the registered [`DeadTimeListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Readout topology of the current configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Layout {
    /// Flip needed to bring each readout channel to the image orientation.
    pub chan_flip: Flip,
    /// Flip requested on the readout.
    pub readout_flip: Flip,
    /// Axes along which the channels are mirrored.
    pub mirror: Flip,
    /// Full sensor size.
    pub ccd_size: Size,
    /// Area read by a single channel.
    pub chan_size: Size,
    /// Current binning.
    pub bin: Bin,
}

impl Layout {
    /// Active channels per axis (1 or 2).
    pub fn nb_chan(&self) -> Point {
        Point::from(self.mirror) + 1
    }

    /// Express an unbinned sensor point relative to the corner its channel
    /// is read out from.
    pub fn xform(&self, p: Point) -> (Point, Corner) {
        let mut effect = self.chan_flip.compose(self.readout_flip);
        if self.mirror.x {
            effect.x = p.x >= self.chan_size.w;
        }
        if self.mirror.y {
            effect.y = p.y >= self.chan_size.h;
        }
        let corner = effect.ref_corner();
        (self.ccd_size.corner_coords(p, corner), corner)
    }

    /// Channel-space rectangle of an image-space ROI, and the axes on which
    /// the ROI lies entirely inside the mirrored half.
    pub fn calc_chan_roi(&self, image_roi: &Roi, roi_bin_offset: Point) -> (Roi, Flip) {
        let mut unbinned = image_roi.unbinned(self.bin);
        let image_tl = unbinned.top_left() + roi_bin_offset;
        unbinned.set_top_left(image_tl);
        let image_br = unbinned.bottom_right();

        let (chan_tl, c_tl) = self.xform(image_tl);
        let (chan_br, c_br) = self.xform(image_br);
        let chan_roi = Roi::from_corners(chan_tl, chan_br);

        let tl = chan_roi.top_left();
        let mut br = chan_roi.bottom_right();
        // ROI spans both channels: read each one up to its inner edge
        if c_tl.right != c_br.right {
            br.x = self.chan_size.w - 1;
        }
        if c_tl.bottom != c_br.bottom {
            br.y = self.chan_size.h - 1;
        }
        let chan_roi = Roi::from_corners(tl, br);

        let inside_mirror = Flip::new(
            self.mirror.x && image_tl.x > br.x,
            self.mirror.y && image_tl.y > br.y,
        );
        trace!("chan_roi={} inside_mirror={:?}", chan_roi, inside_mirror);
        (chan_roi, inside_mirror)
    }

    /// Image-space ROI and bin offset of a channel-space rectangle.
    pub fn calc_image_roi(&self, chan_roi: &Roi, inside_mirror: Flip) -> (Roi, Point) {
        let (tl, _) = self.xform(chan_roi.top_left());
        let (br, _) = self.xform(chan_roi.bottom_right());
        let mut unbinned = Roi::from_corners(tl, br);

        let bin_size = Point::from(self.bin);
        let mirr_shift = Point::from(inside_mirror) * (bin_size - 1);
        let image_tl = unbinned.top_left() + mirr_shift;
        unbinned.set_top_left(image_tl);

        let image_roi = unbinned.binned(self.bin);
        let corner = inside_mirror.ref_corner();
        let roi_bin_offset = Size::from(bin_size).corner_coords(image_tl % bin_size, corner) % bin_size;
        trace!("image_roi={} roi_bin_offset={}", image_roi, roi_bin_offset);
        (image_roi, roi_bin_offset)
    }

    /// Shift joining the two mirrored halves when the requested origin lies
    /// past the image-space rectangle.
    pub fn calc_chan_roi_offset(&self, req_roi: &Roi, image_roi: &Roi) -> Point {
        let ccd = Point::from(self.ccd_size) / Point::from(self.bin);
        let image_br = image_roi.bottom_right();
        let mirror_tl = ccd - (image_br + 1) - Point::from(image_roi.size());

        let req_tl = req_roi.top_left();
        let mut virt_tl = image_roi.top_left();
        if req_tl.x > image_br.x {
            virt_tl.x = mirror_tl.x;
        }
        if req_tl.y > image_br.y {
            virt_tl.y = mirror_tl.y;
        }
        virt_tl - image_roi.top_left()
    }

    /// Caller-visible ROI: every active channel contributes a full copy of
    /// the image-space size.
    pub fn calc_final_roi(&self, image_roi: &Roi, chan_roi_offset: Point) -> Roi {
        let size = Point::from(image_roi.size()) * self.nb_chan();
        Roi::new(image_roi.top_left() + chan_roi_offset, Size::from(size))
    }
}

/// Result of the forward ROI transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiPlan {
    /// ROI as seen in the binned image.
    pub hw_roi: Roi,
    /// ROI programmed in the channel registers.
    pub chan_roi: Roi,
    /// Offset of the image ROI inside the channel ROI.
    pub chan_roi_offset: Point,
}

/// Geometry state owned by the camera.
#[derive(Default)]
pub struct Geometry {
    chan_roi_offset: Point,
    roi_bin_offset: Point,
    dead_time: Option<f64>,
    listener: Option<(ListenerHandle, Arc<dyn DeadTimeListener>)>,
    next_handle: u64,
}

impl fmt::Debug for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Geometry")
            .field("chan_roi_offset", &self.chan_roi_offset)
            .field("roi_bin_offset", &self.roi_bin_offset)
            .field("dead_time", &self.dead_time)
            .field("listener", &self.listener.as_ref().map(|(h, _)| *h))
            .finish()
    }
}

impl Geometry {
    /// Fresh state: no offset, no listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-derive the software-side state from the hardware.
    #[instrument(skip_all, err)]
    pub fn sync(&mut self, ctx: &HwContext<'_>) -> Result<()> {
        self.chan_roi_offset = Point::default();
        self.roi_bin_offset = self.roi_bin_offset(ctx)?;
        self.dead_time_changed(ctx)
    }

    /// Offset of the last programmed ROI inside its channel ROI.
    pub fn chan_roi_offset(&self) -> Point {
        self.chan_roi_offset
    }

    // =========================================================================
    // Channel modes
    // =========================================================================

    /// Bitmask of the channel modes this camera supports.
    pub fn modes_avail(&self, ctx: &HwContext<'_>) -> Result<i32> {
        if ctx.model.has(Feature::ModesAvail) {
            ctx.regs.read_register(Reg::CcdModesAvail)
        } else if ctx.model.chip_type()? == ChipType::Kodak {
            Ok(KODAK_MODES_AVAIL)
        } else {
            Ok(ATMEL_MODES_AVAIL)
        }
    }

    /// Raw `CHM` value.
    pub fn chan_mode(&self, ctx: &HwContext<'_>) -> Result<i32> {
        ctx.regs.read_register(Reg::ChanMode)
    }

    /// Write the channel mode and refresh the derived state.
    #[instrument(skip(self, ctx), err)]
    pub fn set_chan_mode(&mut self, ctx: &HwContext<'_>, chan_mode: i32) -> Result<()> {
        let valid = (1..=31).contains(&chan_mode)
            && self.modes_avail(ctx)? & chan_mode_bit(chan_mode) != 0;
        if !valid {
            let mode_name = calc_ftm_input_chan(chan_mode)
                .map(|(ftm, chan)| input_chan_mode_name(ftm, chan))
                .unwrap_or_else(|| "Unknown".to_string());
            let model_name = ctx.model.name().unwrap_or_else(|_| "Unknown".to_string());
            return Err(FrelonError::InvalidValue(format!(
                "Channel mode {mode_name} [chan_mode={chan_mode}] not supported in {model_name}"
            )));
        }
        ctx.regs.write_register(Reg::ChanMode, chan_mode)?;
        self.dead_time_changed(ctx)
    }

    /// Human readable name of the current channel mode.
    pub fn chan_mode_name(&self, ctx: &HwContext<'_>) -> Result<String> {
        let chan_mode = self.chan_mode(ctx)?;
        let (ftm, chan) = Self::decode_chan_mode(chan_mode)?;
        Ok(input_chan_mode_name(ftm, chan))
    }

    fn decode_chan_mode(chan_mode: i32) -> Result<(FrameTransferMode, InputChan)> {
        calc_ftm_input_chan(chan_mode)
            .ok_or_else(|| FrelonError::Camera(format!("Invalid chan_mode={chan_mode}")))
    }

    /// First default channel combination available in `ftm`.
    pub fn default_input_chan(
        &self,
        ctx: &HwContext<'_>,
        ftm: FrameTransferMode,
    ) -> Result<Option<InputChan>> {
        let modes_avail = self.modes_avail(ctx)?;
        let found = DEF_INPUT_CHAN_LIST.iter().copied().find(|&chan| {
            calc_chan_mode(ftm, chan)
                .map(|mode| modes_avail & chan_mode_bit(mode) != 0)
                .unwrap_or(false)
        });
        match found {
            Some(chan) => debug!("Default input channel for {}: {}", ftm, input_chan_mode_name(ftm, chan)),
            None => debug!("No default input channel for {}: modes_avail={:#x}", ftm, modes_avail),
        }
        Ok(found)
    }

    /// Channels read out in the current mode.
    pub fn input_chan(&self, ctx: &HwContext<'_>) -> Result<InputChan> {
        Ok(Self::decode_chan_mode(self.chan_mode(ctx)?)?.1)
    }

    /// Select the readout channels, keeping the frame transfer mode.
    pub fn set_input_chan(&mut self, ctx: &HwContext<'_>, input_chan: InputChan) -> Result<()> {
        let ftm = self.frame_transfer_mode(ctx)?;
        let chan_mode = calc_chan_mode(ftm, input_chan).ok_or_else(|| {
            FrelonError::InvalidValue(format!("Invalid input channel {input_chan:?} in {ftm}"))
        })?;
        self.set_chan_mode(ctx, chan_mode)
    }

    /// Frame transfer mode encoded in the channel mode.
    pub fn frame_transfer_mode(&self, ctx: &HwContext<'_>) -> Result<FrameTransferMode> {
        let chan_mode = self.chan_mode(ctx)?;
        FrameTransferMode::from_chan_mode(chan_mode)
            .ok_or_else(|| FrelonError::Camera(format!("Invalid chan_mode={chan_mode}")))
    }

    /// Switch between full-frame and frame-transfer operation, keeping the
    /// channel combination when the new mode has it.
    #[instrument(skip(self, ctx), err)]
    pub fn set_frame_transfer_mode(&mut self, ctx: &HwContext<'_>, ftm: FrameTransferMode) -> Result<()> {
        if self.frame_transfer_mode(ctx)? == ftm {
            trace!("Nothing to do");
            return Ok(());
        }

        let input_chan = self.input_chan(ctx)?;
        if let Some(chan_mode) = calc_chan_mode(ftm, input_chan) {
            match self.set_chan_mode(ctx, chan_mode) {
                Ok(()) => return Ok(()),
                Err(FrelonError::InvalidValue(msg)) => debug!("{}", msg),
                Err(e) => return Err(e),
            }
        } else {
            debug!("{:?} not available in {}", input_chan, ftm);
        }

        debug!("Trying default input channel");
        let input_chan = self
            .default_input_chan(ctx, ftm)?
            .ok_or_else(|| FrelonError::Camera(format!("No input channel found for {ftm}")))?;
        let chan_mode = calc_chan_mode(ftm, input_chan)
            .ok_or_else(|| FrelonError::Camera(format!("No input channel found for {ftm}")))?;
        self.set_chan_mode(ctx, chan_mode)
    }

    // =========================================================================
    // Frame dimensions
    // =========================================================================

    /// Sensor size of this camera model.
    pub fn max_frame_size(&self, ctx: &HwContext<'_>) -> Result<Size> {
        let size = ctx.model.chip_type()?.max_frame_size();
        Ok(match ctx.model.geom_type()? {
            GeomType::Spb8F16Single => Size::new(size.w, size.h / 2),
            _ => size,
        })
    }

    /// Image size in the current frame-transfer mode.
    pub fn frame_size(&self, ctx: &HwContext<'_>) -> Result<Size> {
        let size = self.max_frame_size(ctx)?;
        let ftm = self.frame_transfer_mode(ctx)?;
        if ftm == FrameTransferMode::Ftm && !ctx.model.has(Feature::HamamatsuChip) {
            Ok(Size::new(size.w, size.h / 2))
        } else {
            Ok(size)
        }
    }

    fn mirror_of(model: &Model, chan: InputChan) -> Flip {
        if model.is_frelon16() {
            return Flip::default();
        }
        Flip::new(
            chan.is_active(InputChan::CHAN12) || chan.is_active(InputChan::CHAN34),
            chan.is_active(InputChan::CHAN13) || chan.is_active(InputChan::CHAN24),
        )
    }

    /// Axes on which two channels are read out towards each other.
    pub fn mirror(&self, ctx: &HwContext<'_>) -> Result<Flip> {
        Ok(Self::mirror_of(ctx.model, self.input_chan(ctx)?))
    }

    /// Readout topology of the current configuration.
    pub fn layout(&self, ctx: &HwContext<'_>) -> Result<Layout> {
        let chan = self.input_chan(ctx)?;
        let mirror = Self::mirror_of(ctx.model, chan);
        let ccd_size = self.frame_size(ctx)?;
        let nb_chan = Point::from(mirror) + 1;
        let readout_flip = Flip::new(
            !chan.is_active(InputChan::CHAN1) && !chan.is_active(InputChan::CHAN3),
            !chan.is_active(InputChan::CHAN1) && !chan.is_active(InputChan::CHAN2),
        );
        Ok(Layout {
            chan_flip: self.flip(ctx)?,
            readout_flip,
            mirror,
            ccd_size,
            chan_size: Size::from(Point::from(ccd_size) / nb_chan),
            bin: self.bin(ctx)?,
        })
    }

    /// Axes on which the current ROI lies inside the mirrored half.
    pub fn roi_inside_mirror(&self) -> Flip {
        Flip::new(self.chan_roi_offset.x > 0, self.chan_roi_offset.y > 0)
    }

    // =========================================================================
    // Flip
    // =========================================================================

    /// Raw `FLI` value.
    pub fn flip_mode(&self, ctx: &HwContext<'_>) -> Result<i32> {
        ctx.regs.read_register(Reg::FlipMode)
    }

    /// Write the flip register and refresh the derived state.
    pub fn set_flip_mode(&mut self, ctx: &HwContext<'_>, flip_mode: i32) -> Result<()> {
        ctx.regs.write_register(Reg::FlipMode, flip_mode)
    }

    /// Closest supported flip.
    pub fn check_flip(&self, ctx: &HwContext<'_>, flip: Flip) -> Flip {
        if ctx.model.is_frelon16() {
            Flip::default()
        } else {
            flip
        }
    }

    /// Readout flip in image coordinates.
    pub fn flip(&self, ctx: &HwContext<'_>) -> Result<Flip> {
        let flip_mode = self.flip_mode(ctx)?;
        Ok(Flip::new((flip_mode >> 1) & 1 != 0, flip_mode & 1 != 0))
    }

    /// Program a readout flip.
    pub fn set_flip(&mut self, ctx: &HwContext<'_>, flip: Flip) -> Result<()> {
        let flip_mode = (i32::from(flip.x) << 1) | i32::from(flip.y);
        self.set_flip_mode(ctx, flip_mode)
    }

    // =========================================================================
    // Binning
    // =========================================================================

    /// Closest supported binning.
    pub fn check_bin(&self, ctx: &HwContext<'_>, bin: Bin) -> Bin {
        let (max_x, max_y) = if ctx.model.is_frelon16() {
            (1, 1)
        } else {
            (MAX_BIN_X, MAX_BIN_Y)
        };
        Bin::new(bin.x.clamp(1, max_x), bin.y.clamp(1, max_y))
    }

    /// Current horizontal and vertical binning.
    pub fn bin(&self, ctx: &HwContext<'_>) -> Result<Bin> {
        Ok(Bin::new(
            ctx.regs.read_register(Reg::BinHorz)?,
            ctx.regs.read_register(Reg::BinVert)?,
        ))
    }

    /// Change the binning. A new factor resets the ROI to full frame and
    /// the bin offset to zero.
    #[instrument(skip_all, fields(bin = %bin), err)]
    pub fn set_bin(&mut self, ctx: &HwContext<'_>, bin: Bin) -> Result<()> {
        if !(1..=MAX_BIN_X).contains(&bin.x) || !(1..=MAX_BIN_Y).contains(&bin.y) {
            return Err(FrelonError::InvalidValue(format!(
                "Invalid bin={}. Max. HW binning is {}",
                bin,
                Bin::new(MAX_BIN_X, MAX_BIN_Y)
            )));
        }

        let curr = self.bin(ctx)?;
        if bin == curr {
            return Ok(());
        }

        debug!("Resetting Roi");
        self.set_roi(ctx, &Roi::default())?;

        ctx.regs.write_register(Reg::BinHorz, bin.x)?;
        ctx.regs.write_register(Reg::BinVert, bin.y)?;

        self.reset_roi_bin_offset(ctx)?;
        self.dead_time_changed(ctx)
    }

    // =========================================================================
    // ROI
    // =========================================================================

    /// ROI mode as programmed in the camera.
    pub fn roi_mode(&self, ctx: &HwContext<'_>) -> Result<RoiMode> {
        let roi_hw = ctx.regs.read_flag(Reg::RoiEnable)?;
        let roi_fast = ctx.regs.read_flag(Reg::RoiFast)?;
        let roi_kin = ctx.regs.read_flag(Reg::RoiKinetic)?;
        Ok(if roi_kin {
            RoiMode::Kinetic
        } else if roi_fast && roi_hw {
            RoiMode::Fast
        } else if roi_hw {
            RoiMode::Slow
        } else {
            RoiMode::None
        })
    }

    /// Change the ROI mode. Leaving ROI mode clears the bin offset.
    pub fn set_roi_mode(&mut self, ctx: &HwContext<'_>, roi_mode: RoiMode) -> Result<()> {
        let roi_hw = matches!(roi_mode, RoiMode::Slow | RoiMode::Fast);
        ctx.regs.write_flag(Reg::RoiEnable, roi_hw)?;
        ctx.regs.write_flag(Reg::RoiFast, roi_mode == RoiMode::Fast)?;
        ctx.regs.write_flag(Reg::RoiKinetic, roi_mode == RoiMode::Kinetic)?;

        if roi_mode == RoiMode::None {
            self.reset_roi_bin_offset(ctx)?;
        }
        self.dead_time_changed(ctx)
    }

    fn check_roi_mode(&mut self, ctx: &HwContext<'_>, roi: &Roi) -> Result<()> {
        let roi_mode = match self.roi_mode(ctx)? {
            _ if !roi.is_active() => RoiMode::None,
            RoiMode::None => RoiMode::Slow,
            mode => mode,
        };
        self.set_roi_mode(ctx, roi_mode)
    }

    /// Forward transform of a requested ROI, without touching the hardware.
    pub fn process_set_roi(&self, ctx: &HwContext<'_>, set_roi: &Roi) -> Result<RoiPlan> {
        let layout = self.layout(ctx)?;
        let aligned = set_roi.align_corners_to(Point::new(ROI_ALIGN_X, ROI_ALIGN_Y));
        let (chan_roi, inside_mirror) = layout.calc_chan_roi(&aligned, self.roi_bin_offset);
        let (image_roi, _) = layout.calc_image_roi(&chan_roi, inside_mirror);
        let chan_roi_offset = layout.calc_chan_roi_offset(set_roi, &image_roi);
        let hw_roi = layout.calc_final_roi(&image_roi, chan_roi_offset);
        trace!("set_roi={} -> hw_roi={} chan_roi={}", set_roi, hw_roi, chan_roi);
        Ok(RoiPlan {
            hw_roi,
            chan_roi,
            chan_roi_offset,
        })
    }

    /// ROI the hardware would apply for `set_roi`.
    pub fn check_roi(&self, ctx: &HwContext<'_>, set_roi: &Roi) -> Result<Roi> {
        if set_roi.is_active() {
            Ok(self.process_set_roi(ctx, set_roi)?.hw_roi)
        } else {
            Ok(*set_roi)
        }
    }

    /// Apply a ROI; an empty ROI selects the full frame.
    #[instrument(skip_all, fields(roi = %set_roi), err)]
    pub fn set_roi(&mut self, ctx: &HwContext<'_>, set_roi: &Roi) -> Result<()> {
        self.check_roi_mode(ctx, set_roi)?;
        if !set_roi.is_active() {
            debug!("Roi deactivated");
            return Ok(());
        }

        let plan = self.process_set_roi(ctx, set_roi)?;
        self.write_chan_roi(ctx, &plan.chan_roi)?;
        self.chan_roi_offset = plan.chan_roi_offset;
        Ok(())
    }

    /// Current ROI in final space; empty when no hardware ROI is active.
    pub fn roi(&self, ctx: &HwContext<'_>) -> Result<Roi> {
        if self.roi_mode(ctx)? == RoiMode::None {
            return Ok(Roi::default());
        }
        let layout = self.layout(ctx)?;
        let chan_roi = self.read_chan_roi(ctx)?;
        let (image_roi, _) = layout.calc_image_roi(&chan_roi, self.roi_inside_mirror());
        Ok(layout.calc_final_roi(&image_roi, self.chan_roi_offset))
    }

    fn write_chan_roi(&mut self, ctx: &HwContext<'_>, chan_roi: &Roi) -> Result<()> {
        let tl = chan_roi.top_left();
        let size = chan_roi.size();
        ctx.regs.write_register(Reg::RoiPixelBegin, tl.x)?;
        ctx.regs.write_register(Reg::RoiPixelWidth, size.w)?;
        ctx.regs.write_register(Reg::RoiLineBegin, tl.y)?;
        ctx.regs.write_register(Reg::RoiLineWidth, size.h)?;
        self.dead_time_changed(ctx)
    }

    /// Channel-space rectangle currently in the registers.
    pub fn read_chan_roi(&self, ctx: &HwContext<'_>) -> Result<Roi> {
        let rpb = ctx.regs.read_register(Reg::RoiPixelBegin)?;
        let rpw = ctx.regs.read_register(Reg::RoiPixelWidth)?;
        let rlb = ctx.regs.read_register(Reg::RoiLineBegin)?;
        let rlw = ctx.regs.read_register(Reg::RoiLineWidth)?;
        Ok(Roi::from_xywh(rpb, rlb, rpw, rlw))
    }

    // =========================================================================
    // Bin offset
    // =========================================================================

    /// Bin offset of the ROI; null without ROI.
    pub fn roi_bin_offset(&self, ctx: &HwContext<'_>) -> Result<Point> {
        if self.roi_mode(ctx)? == RoiMode::None {
            return Ok(Point::default());
        }
        let layout = self.layout(ctx)?;
        let chan_roi = self.read_chan_roi(ctx)?;
        Ok(layout.calc_image_roi(&chan_roi, self.roi_inside_mirror()).1)
    }

    /// Shift the ROI origin inside its vertical bin cell.
    #[instrument(skip_all, fields(offset = %roi_bin_offset), err)]
    pub fn set_roi_bin_offset(&mut self, ctx: &HwContext<'_>, roi_bin_offset: Point) -> Result<()> {
        if roi_bin_offset == self.roi_bin_offset {
            return Ok(());
        }

        if self.roi_mode(ctx)? == RoiMode::None {
            if !roi_bin_offset.is_null() {
                return Err(FrelonError::InvalidValue("HW Roi not active".into()));
            }
            return Ok(());
        }

        let layout = self.layout(ctx)?;
        let bin_size = Point::from(layout.bin);
        let valid_range = Roi::new(Point::default(), Size::from(bin_size));
        if !valid_range.contains_point(roi_bin_offset) {
            return Err(FrelonError::InvalidValue(format!(
                "Invalid unaligned roi_bin_offset={roi_bin_offset}"
            )));
        }
        if roi_bin_offset.x != 0 {
            return Err(FrelonError::InvalidValue(format!(
                "Invalid roi_bin_offset={}. Must be horizontally aligned to bin={}",
                roi_bin_offset, layout.bin
            )));
        }

        let chan_roi = self.read_chan_roi(ctx)?;
        let (image_tl, _) = layout.xform(chan_roi.top_left());
        let (image_br, _) = layout.xform(chan_roi.bottom_right());
        let mut image_roi = Roi::from_corners(image_tl, image_br);

        let inside_mirror = self.roi_inside_mirror();
        let mut tl = image_roi.top_left() + Point::from(inside_mirror) * (bin_size - 1);
        tl -= tl % bin_size;
        tl += roi_bin_offset * inside_mirror.ref_corner().dir();

        let max_chan_roi = Roi::new(Point::default(), layout.chan_size);
        let fits = max_chan_roi.contains_point(tl) && {
            image_roi.set_top_left(tl);
            max_chan_roi.contains_roi(&image_roi)
        };
        if !fits {
            return Err(FrelonError::InvalidValue(format!(
                "Cannot apply requested roi_bin_offset={roi_bin_offset}"
            )));
        }

        let (chan_tl, _) = layout.xform(image_roi.top_left());
        let (chan_br, _) = layout.xform(image_roi.bottom_right());
        self.write_chan_roi(ctx, &Roi::from_corners(chan_tl, chan_br))?;
        self.roi_bin_offset = roi_bin_offset;
        Ok(())
    }

    /// Zero the bin offset, moving the ROI line begin down onto the vertical
    /// binning grid when needed.
    pub fn reset_roi_bin_offset(&mut self, ctx: &HwContext<'_>) -> Result<()> {
        self.roi_bin_offset = Point::default();

        let bin_y = ctx.regs.read_register(Reg::BinVert)?;
        if bin_y <= 1 {
            return Ok(());
        }
        let line_begin = ctx.regs.read_register(Reg::RoiLineBegin)?;
        let misalign = line_begin % bin_y;
        if misalign != 0 {
            debug!("Forcing alignment bin_y={} roi_line_begin={}", bin_y, line_begin - misalign);
            ctx.regs.write_register(Reg::RoiLineBegin, line_begin - misalign)?;
            self.dead_time_changed(ctx)?;
        }
        Ok(())
    }

    // =========================================================================
    // SPB2 configuration
    // =========================================================================

    fn require_spb2_config(ctx: &HwContext<'_>) -> Result<()> {
        if ctx.model.has(Feature::Spb1) {
            return Err(FrelonError::NotSupported(
                "Camera is SPB1: SPB2 config not supported by hardware!".into(),
            ));
        }
        Ok(())
    }

    /// Select the SPB2 pixel clock configuration.
    pub fn set_spb2_config(&mut self, ctx: &HwContext<'_>, config: Spb2Config) -> Result<()> {
        Self::require_spb2_config(ctx)?;
        debug!("SPB2 config: {}", config.name());
        ctx.regs.write_register(Reg::ConfigHD, config as i32)?;
        self.dead_time_changed(ctx)
    }

    /// Current SPB2 pixel clock configuration.
    pub fn spb2_config(&self, ctx: &HwContext<'_>) -> Result<Spb2Config> {
        Self::require_spb2_config(ctx)?;
        let val = ctx.regs.read_register(Reg::ConfigHD)?;
        Spb2Config::from_reg(val)
            .ok_or_else(|| FrelonError::Camera(format!("Invalid SPB2 config {val}")))
    }

    // =========================================================================
    // Dead time
    // =========================================================================

    /// Last dead time reported to the listener.
    pub fn last_dead_time(&self) -> Option<f64> {
        self.dead_time
    }

    /// Install the callback fired on dead time changes. Only one may be active.
    pub fn register_dead_time_listener(
        &mut self,
        listener: Arc<dyn DeadTimeListener>,
    ) -> Result<ListenerHandle> {
        if self.listener.is_some() {
            return Err(FrelonError::InvalidValue(
                "a dead time listener is already registered".into(),
            ));
        }
        self.next_handle += 1;
        let handle = ListenerHandle(self.next_handle);
        self.listener = Some((handle, listener));
        Ok(handle)
    }

    /// Remove the dead time callback.
    pub fn unregister_dead_time_listener(&mut self, handle: ListenerHandle) -> Result<()> {
        match &self.listener {
            Some((registered, _)) if *registered == handle => {
                self.listener = None;
                Ok(())
            }
            _ => Err(FrelonError::InvalidValue(
                "the dead time listener is not registered".into(),
            )),
        }
    }

    /// Recompute the dead time and notify the listener if it changed.
    pub fn dead_time_changed(&mut self, ctx: &HwContext<'_>) -> Result<()> {
        let dead_time = match ctx.timing.dead_time(ctx.regs, ctx.model) {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!("Dead time unknown until measured");
                return Ok(());
            }
            Err(e) if e.is_not_supported() => {
                debug!("Dead time not available: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.dead_time == Some(dead_time) {
            return Ok(());
        }
        trace!("Dead time changed: {:?} -> {}", self.dead_time, dead_time);
        self.dead_time = Some(dead_time);
        if let Some((_, listener)) = &self.listener {
            listener.dead_time_changed(dead_time);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockFrelon;
    use crate::catalog::RegisterCatalog;
    use crate::error_recovery::RetryPolicy;
    use crate::protocol::SerialLine;
    use parking_lot::Mutex;

    struct Fixture {
        regs: RegisterAccess,
        model: Model,
        timing: TimingCtrl,
        mock: MockFrelon,
    }

    impl Fixture {
        fn new() -> Self {
            let mock = MockFrelon::new();
            let line = SerialLine::new(
                Box::new(mock.clone()),
                RegisterCatalog::default().without_settle_delays(),
                &MockFrelon::settings(),
            );
            let mut model = Model::new();
            model.set_version_str("3.1c").unwrap();
            model.set_complex_serial_nb(0x2121).unwrap();
            Self {
                regs: RegisterAccess::new(Arc::new(line), RetryPolicy::default()),
                model,
                timing: TimingCtrl::new(),
                mock,
            }
        }

        fn ctx(&self) -> HwContext<'_> {
            HwContext {
                regs: &self.regs,
                model: &self.model,
                timing: &self.timing,
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    impl DeadTimeListener for Recorder {
        fn dead_time_changed(&self, dead_time: f64) {
            self.0.lock().push(dead_time);
        }
    }

    fn chan_mode(ftm: FrameTransferMode, chan: InputChan) -> i32 {
        calc_chan_mode(ftm, chan).unwrap()
    }

    #[test]
    fn test_mirror_and_layout() {
        let fx = Fixture::new();
        let geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN12));
        let layout = geom.layout(&fx.ctx()).unwrap();
        assert_eq!(layout.mirror, Flip::new(true, false));
        assert_eq!(layout.nb_chan(), Point::new(2, 1));
        assert_eq!(layout.chan_size, Size::new(1024, 2048));

        let (p, c) = layout.xform(Point::new(1030, 5));
        assert_eq!(c, Corner { right: true, bottom: false });
        assert_eq!(p, Point::new(1017, 5));
    }

    #[test]
    fn test_readout_flip_of_single_channel() {
        let fx = Fixture::new();
        let geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN4));
        let layout = geom.layout(&fx.ctx()).unwrap();
        assert_eq!(layout.readout_flip, Flip::new(true, true));
        assert_eq!(layout.mirror, Flip::default());
        assert_eq!(layout.xform(Point::new(0, 0)).0, Point::new(2047, 2047));
    }

    #[test]
    fn test_mirrored_roi_scenario() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN12));

        let req = Roi::from_xywh(10, 0, 100, 50);
        let plan = geom.process_set_roi(&fx.ctx(), &req).unwrap();
        assert_eq!(plan.chan_roi, Roi::from_xywh(0, 0, 128, 50));
        assert_eq!(plan.hw_roi.size().w, 128 * 2);

        geom.set_roi(&fx.ctx(), &req).unwrap();
        assert_eq!(fx.mock.register(Reg::RoiPixelWidth), Some(128));
        assert_eq!(fx.mock.register(Reg::RoiEnable), Some(1));
        assert_eq!(geom.roi(&fx.ctx()).unwrap(), plan.hw_roi);
    }

    #[test]
    fn test_roi_inside_mirrored_half() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN12));

        geom.set_roi(&fx.ctx(), &Roi::from_xywh(1100, 0, 100, 10)).unwrap();
        assert_eq!(fx.mock.register(Reg::RoiPixelBegin), Some(832));
        assert_eq!(geom.chan_roi_offset(), Point::new(128, 0));
        assert_eq!(geom.roi_inside_mirror(), Flip::new(true, false));
        assert_eq!(geom.roi(&fx.ctx()).unwrap(), Roi::from_xywh(960, 0, 256, 10));
    }

    #[test]
    fn test_flipped_single_channel_roundtrip() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN1));
        geom.set_flip(&fx.ctx(), Flip::new(true, false)).unwrap();

        geom.set_roi(&fx.ctx(), &Roi::from_xywh(0, 0, 128, 50)).unwrap();
        assert_eq!(fx.mock.register(Reg::RoiPixelBegin), Some(1920));
        assert_eq!(geom.roi(&fx.ctx()).unwrap(), Roi::from_xywh(0, 0, 128, 50));
    }

    #[test]
    fn test_set_bin_resets_roi() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN1));
        geom.set_roi(&fx.ctx(), &Roi::from_xywh(64, 3, 64, 20)).unwrap();
        assert_eq!(geom.roi_mode(&fx.ctx()).unwrap(), RoiMode::Slow);

        geom.set_bin(&fx.ctx(), Bin::new(2, 2)).unwrap();
        assert_eq!(geom.roi_mode(&fx.ctx()).unwrap(), RoiMode::None);
        assert_eq!(geom.roi(&fx.ctx()).unwrap(), Roi::default());
        assert_eq!(geom.bin(&fx.ctx()).unwrap(), Bin::new(2, 2));
        // line begin 3 moved onto the binning grid
        assert_eq!(fx.mock.register(Reg::RoiLineBegin), Some(2));
        assert_eq!(geom.roi_bin_offset(&fx.ctx()).unwrap(), Point::default());

        fx.mock.clear_log();
        geom.set_bin(&fx.ctx(), Bin::new(2, 2)).unwrap();
        assert!(fx.mock.writes().is_empty());
    }

    #[test]
    fn test_set_bin_rejects_out_of_range() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        for bin in [Bin::new(9, 1), Bin::new(1, 2048), Bin::new(0, 1)] {
            let err = geom.set_bin(&fx.ctx(), bin).unwrap_err();
            assert!(matches!(err, FrelonError::InvalidValue(_)));
        }
        assert_eq!(geom.check_bin(&fx.ctx(), Bin::new(16, 4096)), Bin::new(8, 1024));
    }

    #[test]
    fn test_roi_bin_offset() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN1));
        geom.set_bin(&fx.ctx(), Bin::new(1, 4)).unwrap();

        let err = geom.set_roi_bin_offset(&fx.ctx(), Point::new(0, 1)).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value: HW Roi not active");

        geom.set_roi(&fx.ctx(), &Roi::from_xywh(0, 10, 128, 20)).unwrap();
        assert_eq!(fx.mock.register(Reg::RoiLineBegin), Some(40));

        geom.set_roi_bin_offset(&fx.ctx(), Point::new(0, 3)).unwrap();
        assert_eq!(fx.mock.register(Reg::RoiLineBegin), Some(43));
        assert_eq!(geom.roi_bin_offset(&fx.ctx()).unwrap(), Point::new(0, 3));

        assert!(geom.set_roi_bin_offset(&fx.ctx(), Point::new(1, 0)).is_err());
        assert!(geom.set_roi_bin_offset(&fx.ctx(), Point::new(0, 4)).is_err());
    }

    #[test]
    fn test_chan_mode_validation() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::CcdModesAvail, 0x0100);
        let err = geom.set_chan_mode(&fx.ctx(), 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value: Channel mode FFM-1 [chan_mode=1] not supported in HD E230-42"
        );
        geom.set_chan_mode(&fx.ctx(), 9).unwrap();
        assert_eq!(geom.chan_mode_name(&fx.ctx()).unwrap(), "FFM-1&2&3&4");
    }

    #[test]
    fn test_frame_transfer_mode_fallback() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        fx.mock.set_register(Reg::ChanMode, chan_mode(FrameTransferMode::Ffm, InputChan::CHAN2));

        // CHAN2 has no frame-transfer counterpart: first default is 1&2&3&4
        geom.set_frame_transfer_mode(&fx.ctx(), FrameTransferMode::Ftm).unwrap();
        assert_eq!(fx.mock.register(Reg::ChanMode), Some(10));
        assert_eq!(geom.frame_size(&fx.ctx()).unwrap(), Size::new(2048, 1024));

        // back to full frame keeps the combination
        geom.set_frame_transfer_mode(&fx.ctx(), FrameTransferMode::Ffm).unwrap();
        assert_eq!(fx.mock.register(Reg::ChanMode), Some(9));

        fx.mock.set_register(Reg::CcdModesAvail, 0x00ff);
        let err = geom.set_frame_transfer_mode(&fx.ctx(), FrameTransferMode::Ftm).unwrap_err();
        assert_eq!(err.to_string(), "Camera error: No input channel found for FTM");
    }

    #[test]
    fn test_dead_time_listener() {
        let fx = Fixture::new();
        let mut geom = Geometry::new();
        let recorder = Arc::new(Recorder::default());
        let handle = geom.register_dead_time_listener(recorder.clone()).unwrap();
        assert!(geom.register_dead_time_listener(recorder.clone()).is_err());

        geom.dead_time_changed(&fx.ctx()).unwrap();
        geom.dead_time_changed(&fx.ctx()).unwrap();
        fx.mock.set_register(Reg::TransferTime, 1394);
        geom.dead_time_changed(&fx.ctx()).unwrap();

        let seen = recorder.0.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!((seen[0] - 0.099072).abs() < 1e-9);
        assert!((seen[1] - 0.001394).abs() < 1e-9);

        geom.unregister_dead_time_listener(handle).unwrap();
        assert!(geom.unregister_dead_time_listener(handle).is_err());
    }

    #[test]
    fn test_spb2_config() {
        let mut fx = Fixture::new();
        let mut geom = Geometry::new();
        geom.set_spb2_config(&fx.ctx(), Spb2Config::Speed).unwrap();
        assert_eq!(geom.spb2_config(&fx.ctx()).unwrap(), Spb2Config::Speed);

        fx.model.set_complex_serial_nb(0x0005).unwrap();
        assert!(geom.spb2_config(&fx.ctx()).unwrap_err().is_not_supported());
    }
}
