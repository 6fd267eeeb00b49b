//! Camera facade.
//!
//! [`Camera`] owns the protocol stack, the capability model, the timing
//! cache and the geometry engine, and exposes the acquisition-level
//! operations: synchronisation, exposure and trigger control, external
//! sync, status polling, start/stop and sequencer timing measurement.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = MockFrelon::new();
//! let mut cam = Camera::new(Box::new(mock.clone()), Arc::new(mock), &MockFrelon::settings())?;
//! cam.set_exp_time(0.5)?;
//! cam.set_bin(Bin::new(2, 2))?;
//! cam.start()?;
//! ```

use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};

use crate::adapters::{FrameGrabberLink, Transport};
use crate::catalog::{
    Cmd, ExtSync, FrameTransferMode, InputChan, Reg, RegisterCatalog, RoiMode, ShutMode,
    Spb2Config, Status, TimeUnitFactor, TrigMode, MAX_REG_VAL, SPB2_TST_ENV_MASK,
    SPB2_TST_INIT_GOOD, SPB2_TST_INIT_MASK,
};
use crate::config::{Settings, TimeoutSettings};
use crate::error::{FrelonError, Result};
use crate::geometry::{
    Bin, DeadTimeListener, Flip, Geometry, HwContext, ListenerHandle, Point, Roi, Size,
};
use crate::model::{Feature, GeomType, Model, SpbType};
use crate::protocol::SerialLine;
use crate::registers::RegisterAccess;
use crate::timing::{SeqTimValues, TimingCtrl};

/// Pause between two status polls.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Register value overridden for the lifetime of the guard.
struct TempRegVal<'a> {
    regs: &'a RegisterAccess,
    reg: Reg,
    orig: i32,
}

impl<'a> TempRegVal<'a> {
    fn new(regs: &'a RegisterAccess, reg: Reg, val: i32) -> Result<Self> {
        let orig = regs.read_register(reg)?;
        regs.write_register(reg, val)?;
        Ok(Self { regs, reg, orig })
    }
}

impl Drop for TempRegVal<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.regs.write_register(self.reg, self.orig) {
            warn!("Could not restore {} to {}: {}", self.reg, self.orig, e);
        }
    }
}

/// A Frelon camera on a serial line.
pub struct Camera {
    regs: RegisterAccess,
    link: Arc<dyn FrameGrabberLink>,
    model: Model,
    timing: TimingCtrl,
    geometry: Geometry,
    timeouts: TimeoutSettings,
    trig_mode: TrigMode,
    nb_frames: i32,
    started: bool,
}

impl Camera {
    /// Build the protocol stack on `transport` and synchronise with the
    /// camera.
    pub fn new(
        transport: Box<dyn Transport>,
        link: Arc<dyn FrameGrabberLink>,
        settings: &Settings,
    ) -> Result<Self> {
        Self::with_catalog(transport, link, RegisterCatalog::default(), settings)
    }

    /// Like [`Camera::new`] with an explicit register catalog.
    pub fn with_catalog(
        transport: Box<dyn Transport>,
        link: Arc<dyn FrameGrabberLink>,
        catalog: RegisterCatalog,
        settings: &Settings,
    ) -> Result<Self> {
        settings.validate()?;
        let line = Arc::new(SerialLine::new(transport, catalog, settings));
        let mut cam = Self {
            regs: RegisterAccess::new(line, settings.retry.clone()),
            link,
            model: Model::new(),
            timing: TimingCtrl::new(),
            geometry: Geometry::new(),
            timeouts: settings.timeouts.clone(),
            trig_mode: TrigMode::IntTrig,
            nb_frames: 1,
            started: false,
        };
        cam.sync()?;
        Ok(cam)
    }

    fn ctx(&self) -> HwContext<'_> {
        HwContext {
            regs: &self.regs,
            model: &self.model,
            timing: &self.timing,
        }
    }

    fn geometry_parts(&mut self) -> (&mut Geometry, HwContext<'_>) {
        (
            &mut self.geometry,
            HwContext {
                regs: &self.regs,
                model: &self.model,
                timing: &self.timing,
            },
        )
    }

    /// Typed register access.
    pub fn registers(&self) -> &RegisterAccess {
        &self.regs
    }

    /// Shared protocol engine.
    pub fn serial_line(&self) -> &Arc<SerialLine> {
        self.regs.line()
    }

    /// Decoded camera model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Sequencer timing controller.
    pub fn timing_ctrl(&self) -> &TimingCtrl {
        &self.timing
    }

    // =========================================================================
    // Synchronisation
    // =========================================================================

    /// Re-read the camera identity and bring it to a known idle state.
    #[instrument(skip(self), err)]
    pub fn sync(&mut self) -> Result<()> {
        if !self.link.chan_up()? {
            warn!("Link down. Forcing a link reset!");
            self.reset_link()?;
        }

        debug!("Synchronizing with the camera");
        self.model.reset();
        self.started = false;

        match self.sync_regs() {
            Err(e) if e.is_timeout() => {
                debug!("Error in sync: {}", e);
                return Err(FrelonError::Camera(
                    "Serial connection timeout: is camera ON and connected?".into(),
                ));
            }
            other => other?,
        }

        info!(
            "Found Frelon {} #{}, FW:{}",
            self.model.name()?,
            self.model.serial_nb()?,
            self.model.firmware()
        );
        Ok(())
    }

    /// Send a reset command and synchronise again.
    pub fn hard_reset(&mut self) -> Result<()> {
        debug!("Resetting the camera");
        self.regs.send_cmd(Cmd::Reset)?;
        self.sync()
    }

    fn reset_link(&self) -> Result<()> {
        self.link.reset_link()?;
        trace!("Sleeping additional {:?}", self.timeouts.reset_link_wait);
        sleep(self.timeouts.reset_link_wait);
        Ok(())
    }

    fn sync_regs(&mut self) -> Result<()> {
        self.regs.line().clear_cache();

        let ver = self.regs.read_camera_register(Reg::Version)?;
        self.model.set_version_str(ver.trim())?;
        let complex_ser_nb = self.regs.read_register(Reg::CompSerNb)?;
        self.model.set_complex_serial_nb(complex_ser_nb)?;
        if self.model.has(Feature::CameraCharacteristics) {
            let cam_char = self.regs.read_register(Reg::CamChar)?;
            self.model.set_cam_char(cam_char)?;
        }

        let geom_type = self.model.geom_type()?;
        if geom_type == GeomType::Spb8F16Dual {
            return Err(FrelonError::NotSupported(format!(
                "Geometry {geom_type:?} not supported"
            )));
        }

        if self.model.has(Feature::GoodResetProtocol) {
            self.sync_regs_good_reset()?;
        } else {
            self.sync_regs_bad_reset()?;
        }

        let exp_time = self.exp_time()?;
        self.trig_mode = if exp_time == 0.0 {
            TrigMode::ExtGate
        } else {
            TrigMode::IntTrig
        };

        // a sequencer command forwards the CCD status byte to the frame grabber
        self.nb_frames = 1;
        self.regs.write_register(Reg::NbFrames, self.nb_frames)?;
        sleep(self.timeouts.update_ccd_status);

        let (geometry, ctx) = self.geometry_parts();
        geometry.sync(&ctx)
    }

    fn sync_regs_good_reset(&mut self) -> Result<()> {
        let status = self.status(true, true)?;
        if status != Status::WAIT {
            warn!("Camera not IDLE: status={:#x}", status.bits());
        }

        let mut status = status;
        for retry in 0..2 {
            self.set_ext_sync_enable(ExtSync::None)?;
            self.regs.send_cmd(Cmd::Stop)?;
            let (idle, last) = self.wait_idle(true, true)?;
            status = last;
            if idle {
                if retry > 0 {
                    debug!("Succeeded after {} retries", retry);
                }
                break;
            } else if retry == 0 {
                warn!("Trying a hard reset ...");
                self.regs.send_cmd(Cmd::Reset)?;
            }
        }

        if status != Status::WAIT {
            return Err(FrelonError::Camera(format!(
                "Wrong camera BUSY status: {:#x}",
                status.bits()
            )));
        }
        Ok(())
    }

    fn sync_regs_bad_reset(&mut self) -> Result<()> {
        let status = self.status(false, false)?;
        if !status.is_empty() && status != Status::WAIT {
            warn!("Camera not IDLE: status={:#x}", status.bits());
            if self.exp_time()? > 0.0 {
                debug!("Sending software STOP ...");
                self.regs.send_cmd(Cmd::Stop)?;
            }
            let (idle, status) = self.wait_idle(false, false)?;
            if !idle {
                warn!("Camera still not IDLE: status={:#x}", status.bits());
            }
        }

        debug!("Forcing link reset on old firmware!");
        self.reset_link()?;

        if self.model.has(Feature::HtdCommand) {
            self.set_ext_sync_enable(ExtSync::Both)?;
        }
        Ok(())
    }

    // =========================================================================
    // Trigger, exposure, shutter, latency
    // =========================================================================

    /// Current trigger mode.
    pub fn trig_mode(&self) -> TrigMode {
        self.trig_mode
    }

    /// Select the trigger mode. Gate mode forces a null exposure time; any
    /// other mode needs a non-null one.
    pub fn set_trig_mode(&mut self, trig_mode: TrigMode) -> Result<()> {
        debug!("Trigger mode: {:?}", trig_mode);
        self.trig_mode = trig_mode;
        let exp_time = self.exp_time()?;
        if trig_mode == TrigMode::ExtGate && exp_time != 0.0 {
            self.set_exp_time(0.0)?;
        } else if trig_mode != TrigMode::ExtGate && exp_time == 0.0 {
            self.set_exp_time(1.0)?;
        }
        self.set_nb_frames(self.nb_frames)
    }

    /// Unit of the exposure and latency registers.
    pub fn time_unit_factor(&self) -> Result<TimeUnitFactor> {
        let val = self.regs.read_register(Reg::TimeUnit)?;
        TimeUnitFactor::from_reg(val)
            .ok_or_else(|| FrelonError::Camera(format!("Invalid time unit {val}")))
    }

    /// Change the time unit. The dead time listener is notified.
    pub fn set_time_unit_factor(&mut self, factor: TimeUnitFactor) -> Result<()> {
        self.regs.write_register(Reg::TimeUnit, factor as i32)?;
        self.dead_time_changed()
    }

    /// Set the exposure time in seconds, picking the finest time unit able
    /// to represent it.
    #[instrument(skip(self), err)]
    pub fn set_exp_time(&mut self, exp_time: f64) -> Result<()> {
        if self.trig_mode == TrigMode::ExtGate && exp_time != 0.0 {
            debug!("Ignoring exp_time={} in ExtGate trigger mode", exp_time);
            return Ok(());
        }
        if exp_time < 0.0 {
            return Err(FrelonError::InvalidValue(format!(
                "Invalid negative exp_time={exp_time}"
            )));
        }
        let max_exp = f64::from(MAX_REG_VAL) * TimeUnitFactor::Milliseconds.factor();
        if exp_time > max_exp {
            return Err(FrelonError::InvalidValue(format!(
                "Exp. time too high: exp_time={exp_time}, max={max_exp}"
            )));
        }
        let min_exp = TimeUnitFactor::Microseconds.factor();
        let exp_time = if exp_time > 0.0 && exp_time < min_exp {
            warn!("Rounding non-null exp_time={} to {}", exp_time, min_exp);
            min_exp
        } else {
            exp_time
        };

        let exp_us = TimeUnitFactor::Microseconds.calc_units(exp_time);
        let exp_ms = TimeUnitFactor::Milliseconds.calc_units(exp_time);
        let (exp_val, unit) = if exp_us <= MAX_REG_VAL && exp_us != exp_ms * 1000 {
            (exp_us, TimeUnitFactor::Microseconds)
        } else {
            (exp_ms, TimeUnitFactor::Milliseconds)
        };

        self.set_time_unit_factor(unit)?;
        self.regs.write_register(Reg::ExpTime, exp_val)
    }

    /// Exposure time in seconds.
    pub fn exp_time(&self) -> Result<f64> {
        let factor = self.time_unit_factor()?;
        Ok(f64::from(self.regs.read_register(Reg::ExpTime)?) * factor.factor())
    }

    /// Select the shutter mode.
    pub fn set_shut_mode(&mut self, shut_mode: ShutMode) -> Result<()> {
        self.regs.write_flag(Reg::ShutEnable, shut_mode == ShutMode::AutoFrame)
    }

    /// Current shutter mode.
    pub fn shut_mode(&self) -> Result<ShutMode> {
        Ok(if self.regs.read_register(Reg::ShutEnable)? == 1 {
            ShutMode::AutoFrame
        } else {
            ShutMode::Off
        })
    }

    /// Shutter close time in seconds.
    pub fn set_shut_close_time(&mut self, shut_time: f64) -> Result<()> {
        let shut_val = self.time_unit_factor()?.calc_units(shut_time);
        if !(0..=MAX_REG_VAL).contains(&shut_val) {
            return Err(FrelonError::InvalidValue(format!(
                "Shutter close time out of range: {shut_time}"
            )));
        }
        self.regs.write_register(Reg::ShutCloseTime, shut_val)
    }

    /// Shutter close time in seconds.
    pub fn shut_close_time(&self) -> Result<f64> {
        let factor = self.time_unit_factor()?;
        Ok(f64::from(self.regs.read_register(Reg::ShutCloseTime)?) * factor.factor())
    }

    /// Extra latency between frames, in seconds.
    pub fn set_user_lat_time(&mut self, lat_time: f64) -> Result<()> {
        let lat_val = self.time_unit_factor()?.calc_units(lat_time);
        self.regs.write_register(Reg::LatencyTime, lat_val)
    }

    /// Extra latency between frames, in seconds.
    pub fn user_lat_time(&self) -> Result<f64> {
        let factor = self.time_unit_factor()?;
        Ok(f64::from(self.regs.read_register(Reg::LatencyTime)?) * factor.factor())
    }

    fn known_dead_time(&self) -> Result<f64> {
        self.dead_time()?.ok_or_else(|| {
            FrelonError::Camera("Dead time unknown: sequencer timing must be measured".into())
        })
    }

    /// Set the frame-to-frame latency, dead time included.
    pub fn set_total_lat_time(&mut self, lat_time: f64) -> Result<()> {
        let dead_time = self.known_dead_time()?;
        self.set_user_lat_time((lat_time - dead_time).max(0.0))
    }

    /// Frame-to-frame latency, dead time included.
    pub fn total_lat_time(&self) -> Result<f64> {
        Ok(self.user_lat_time()? + self.known_dead_time()?)
    }

    /// Number of frames to acquire. Multi-trigger modes program the camera
    /// for one frame per trigger.
    pub fn set_nb_frames(&mut self, nb_frames: i32) -> Result<()> {
        let one_frame = matches!(self.trig_mode, TrigMode::IntTrigMult | TrigMode::ExtTrigMult);
        let cam_nb_frames = if one_frame { 1 } else { nb_frames };
        self.regs.write_register(Reg::NbFrames, cam_nb_frames)?;
        self.nb_frames = nb_frames;
        Ok(())
    }

    /// Frames requested for the next acquisition.
    pub fn nb_frames(&self) -> i32 {
        self.nb_frames
    }

    // =========================================================================
    // External sync and status
    // =========================================================================

    fn require_htd(&self) -> Result<()> {
        if self.model.has(Feature::HtdCommand) {
            Ok(())
        } else {
            Err(FrelonError::NotSupported(
                "Camera does not have HTD cmd: upgrade firmware".into(),
            ))
        }
    }

    /// Select the external sync inputs.
    pub fn set_ext_sync_enable(&mut self, ext_sync: ExtSync) -> Result<()> {
        self.require_htd()?;
        let hard_trig_dis = !(ext_sync as i32) & ExtSync::Both as i32;
        self.regs.write_register(Reg::HardTrigDisable, hard_trig_dis)
    }

    /// External sync inputs in use.
    pub fn ext_sync_enable(&self) -> Result<ExtSync> {
        self.require_htd()?;
        let hard_trig_dis = self.regs.read_register(Reg::HardTrigDisable)?;
        Ok(ExtSync::from_bits(!hard_trig_dis))
    }

    /// Sequencer status, from the serial line or the frame grabber, with
    /// the SPB2 board state folded in on request.
    pub fn status(&self, use_ser_line: bool, read_spb2: bool) -> Result<Status> {
        let read_spb2 = if read_spb2 && self.model.spb_type()? == SpbType::Spb8 {
            trace!("SPB8: ignoring read_spb2");
            false
        } else {
            read_spb2
        };

        if (use_ser_line || read_spb2) && !self.model.has(Feature::GoodResetProtocol) {
            return Err(FrelonError::NotSupported(
                "SPB2/ser. line status not supported: must upgrade firmware".into(),
            ));
        }

        let spb2_status = if read_spb2 {
            self.regs.read_register(Reg::StatusAMTA)?
        } else {
            0
        };

        let ccd_status = if use_ser_line {
            self.regs.read_register(Reg::StatusSeqA)?
        } else {
            self.link.ccd_status()?
        };

        let mut status = Status::from_bits_retain(ccd_status as u32);
        if read_spb2 {
            if spb2_status & SPB2_TST_ENV_MASK != 0 {
                status |= Status::ESPIA_XFER;
            }
            if spb2_status & SPB2_TST_INIT_MASK != SPB2_TST_INIT_GOOD {
                status |= Status::IN_INIT;
            }
        }
        trace!("status={:#x}", status.bits());
        Ok(status)
    }

    /// Poll until `status & mask == want`.
    ///
    /// Returns whether the status was reached and the last status read.
    /// A timeout of `None` or zero waits forever.
    pub fn wait_status(
        &self,
        want: Status,
        mask: Status,
        timeout: Option<Duration>,
        use_ser_line: bool,
        read_spb2: bool,
    ) -> Result<(bool, Status)> {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);

        let mut curr = Status::from_bits_retain(0xffff);
        loop {
            if deadline.is_some_and(|end| Instant::now() >= end) {
                warn!(
                    "Timeout waiting for status={:#x}: curr_status={:#x}",
                    want.bits(),
                    curr.bits()
                );
                return Ok((false, curr));
            }
            curr = self.status(use_ser_line, read_spb2)?;
            if curr & mask == want {
                return Ok((true, curr));
            }
            sleep(STATUS_POLL_INTERVAL);
        }
    }

    fn wait_idle(&self, use_ser_line: bool, read_spb2: bool) -> Result<(bool, Status)> {
        let timeout = self.max_idle_wait_time()?;
        self.wait_status(Status::WAIT, Status::MASK, Some(timeout), use_ser_line, read_spb2)
    }

    /// Longest expected wait for the camera to become idle.
    pub fn max_idle_wait_time(&self) -> Result<Duration> {
        let mut max_wait = self.timeouts.max_idle_wait;
        if !self.model.has(Feature::GoodResetProtocol) {
            let exp_time = self.exp_time()?;
            if exp_time > 0.0 {
                max_wait += Duration::from_secs_f64(exp_time);
                trace!("Adjusted max_wait={:?}", max_wait);
            }
        }
        Ok(max_wait)
    }

    /// Frames acquired since the last start.
    pub fn image_count(&self, only_lsw: bool) -> Result<u32> {
        let mut count = self.regs.read_register(Reg::StatusAMTC)? as u32;
        if !only_lsw {
            count |= (self.regs.read_register(Reg::StatusAMTD)? as u32) << 16;
        }
        Ok(count)
    }

    // =========================================================================
    // Acquisition control
    // =========================================================================

    /// Start an acquisition.
    #[instrument(skip(self), err)]
    pub fn start(&mut self) -> Result<()> {
        if self.started && self.trig_mode != TrigMode::IntTrigMult {
            return Err(FrelonError::InvalidValue("Camera already running!".into()));
        }

        if matches!(self.trig_mode, TrigMode::IntTrig | TrigMode::IntTrigMult) {
            debug!("Starting camera by software");
            self.regs.send_cmd(Cmd::Start)?;
        } else if self.model.has(Feature::GoodResetProtocol) {
            debug!("Enabling Ext. Sync. signals");
            self.set_ext_sync_enable(ExtSync::Both)?;
        }
        self.started = true;
        Ok(())
    }

    /// Stop the acquisition and wait for the camera to go idle.
    #[instrument(skip(self), err)]
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        let good_reset = self.model.has(Feature::GoodResetProtocol);
        if good_reset && self.trig_mode != TrigMode::IntTrig {
            debug!("Disabling Ext. Sync. signals");
            self.set_ext_sync_enable(ExtSync::None)?;
        }

        if self.status(false, false)? == Status::WAIT {
            self.started = false;
            return Ok(());
        }

        let send_stop = if good_reset {
            true
        } else if self.trig_mode == TrigMode::ExtGate {
            false
        } else {
            self.regs.read_register(Reg::NbFrames)? != 1
        };
        if send_stop {
            debug!("Aborting current acquisition");
            self.regs.send_cmd(Cmd::Stop)?;
        }

        let t0 = Instant::now();
        let (idle, _) = self.wait_idle(false, false)?;
        if !idle {
            warn!("Camera not idle after {:?}", t0.elapsed());
        }
        self.started = false;
        Ok(())
    }

    /// True between start and stop.
    pub fn is_running(&self) -> bool {
        self.started
    }

    // =========================================================================
    // Timing
    // =========================================================================

    /// Readout time of the current configuration, if known.
    pub fn readout_time(&self) -> Result<Option<f64>> {
        self.timing.readout_time(&self.regs, &self.model)
    }

    /// Frame transfer time of the current configuration, if known.
    pub fn transfer_time(&self) -> Result<Option<f64>> {
        self.timing.transfer_time(&self.regs, &self.model)
    }

    /// Dead time between frames, if known.
    pub fn dead_time(&self) -> Result<Option<f64>> {
        self.timing.dead_time(&self.regs, &self.model)
    }

    /// True when the current configuration has no sequencer timing entry.
    pub fn need_timing_measure(&self) -> Result<bool> {
        self.timing.need_measure(&self.regs, &self.model)
    }

    /// Run a short internal acquisition and cache the latched sequencer
    /// timing of the current configuration.
    #[instrument(skip(self), err)]
    pub fn measure_seq_tim_values(&mut self, timeout: Option<Duration>) -> Result<SeqTimValues> {
        let timeout = timeout.unwrap_or(self.timeouts.measure);
        if !self.model.has(Feature::SequencerTiming) {
            return Err(FrelonError::NotSupported(
                "Camera does not have sequencer timing feature".into(),
            ));
        }

        let config = self.timing.config(&self.regs, &self.model)?;
        if self.ext_sync_enable()? != ExtSync::None {
            return Err(FrelonError::Camera("Camera ExtSyncEnable is not None".into()));
        }

        let values = {
            let _n = TempRegVal::new(&self.regs, Reg::NbFrames, 3)?;
            let _i = TempRegVal::new(&self.regs, Reg::ExpTime, 1)?;
            let _t = TempRegVal::new(&self.regs, Reg::LatencyTime, 0)?;
            let _u = TempRegVal::new(&self.regs, Reg::ShutEnable, 0)?;

            self.regs.send_cmd(Cmd::Start)?;
            let (idle, _) = self.wait_status(Status::WAIT, Status::MASK, Some(timeout), true, true)?;
            if !idle {
                return Err(FrelonError::Camera(format!(
                    "Camera not ready after {timeout:?}"
                )));
            }
            self.timing.latch_seq_tim_values(&self.regs, &self.model)?
        };

        debug!("Measured {}: {:?}", config, values);
        self.timing.insert(config, values);
        self.dead_time_changed()?;
        Ok(values)
    }

    // =========================================================================
    // Geometry
    // =========================================================================

    fn dead_time_changed(&mut self) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.dead_time_changed(&ctx)
    }

    /// Install the callback fired on dead time changes.
    pub fn register_dead_time_listener(
        &mut self,
        listener: Arc<dyn DeadTimeListener>,
    ) -> Result<ListenerHandle> {
        self.geometry.register_dead_time_listener(listener)
    }

    /// Remove the dead time callback.
    pub fn unregister_dead_time_listener(&mut self, handle: ListenerHandle) -> Result<()> {
        self.geometry.unregister_dead_time_listener(handle)
    }

    /// Display name of the channel mode.
    pub fn chan_mode_name(&self) -> Result<String> {
        self.geometry.chan_mode_name(&self.ctx())
    }

    /// Channels used by default with `ftm`, if any.
    pub fn default_input_chan(&self, ftm: FrameTransferMode) -> Result<Option<InputChan>> {
        self.geometry.default_input_chan(&self.ctx(), ftm)
    }

    /// Channels read out.
    pub fn input_chan(&self) -> Result<InputChan> {
        self.geometry.input_chan(&self.ctx())
    }

    /// Select the readout channels.
    pub fn set_input_chan(&mut self, input_chan: InputChan) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_input_chan(&ctx, input_chan)
    }

    /// Current frame transfer mode.
    pub fn frame_transfer_mode(&self) -> Result<FrameTransferMode> {
        self.geometry.frame_transfer_mode(&self.ctx())
    }

    /// Select the frame transfer mode.
    pub fn set_frame_transfer_mode(&mut self, ftm: FrameTransferMode) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_frame_transfer_mode(&ctx, ftm)
    }

    /// Largest frame in the current frame transfer mode.
    pub fn max_frame_size(&self) -> Result<Size> {
        self.geometry.max_frame_size(&self.ctx())
    }

    /// Binned frame size.
    pub fn frame_size(&self) -> Result<Size> {
        self.geometry.frame_size(&self.ctx())
    }

    /// Flip the camera is able to apply, closest to `flip`.
    pub fn check_flip(&self, flip: Flip) -> Flip {
        self.geometry.check_flip(&self.ctx(), flip)
    }

    /// Current readout flip.
    pub fn flip(&self) -> Result<Flip> {
        self.geometry.flip(&self.ctx())
    }

    /// Program a readout flip.
    pub fn set_flip(&mut self, flip: Flip) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_flip(&ctx, flip)
    }

    /// Binning clamped to the supported range.
    pub fn check_bin(&self, bin: Bin) -> Bin {
        self.geometry.check_bin(&self.ctx(), bin)
    }

    /// Current binning.
    pub fn bin(&self) -> Result<Bin> {
        self.geometry.bin(&self.ctx())
    }

    /// Program a binning. The ROI is reset.
    pub fn set_bin(&mut self, bin: Bin) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_bin(&ctx, bin)
    }

    /// Current ROI mode.
    pub fn roi_mode(&self) -> Result<RoiMode> {
        self.geometry.roi_mode(&self.ctx())
    }

    /// Select the ROI mode.
    pub fn set_roi_mode(&mut self, roi_mode: RoiMode) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_roi_mode(&ctx, roi_mode)
    }

    /// ROI the hardware would apply for `roi`.
    pub fn check_roi(&self, roi: &Roi) -> Result<Roi> {
        self.geometry.check_roi(&self.ctx(), roi)
    }

    /// ROI currently applied, in binned coordinates.
    pub fn roi(&self) -> Result<Roi> {
        self.geometry.roi(&self.ctx())
    }

    /// Program the smallest hardware ROI holding `roi`.
    pub fn set_roi(&mut self, roi: &Roi) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_roi(&ctx, roi)
    }

    /// Bin offset of the ROI.
    pub fn roi_bin_offset(&self) -> Result<Point> {
        self.geometry.roi_bin_offset(&self.ctx())
    }

    /// Shift the ROI by a bin offset.
    pub fn set_roi_bin_offset(&mut self, offset: Point) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_roi_bin_offset(&ctx, offset)
    }

    /// SPB2 pixel clock configuration.
    pub fn spb2_config(&self) -> Result<Spb2Config> {
        self.geometry.spb2_config(&self.ctx())
    }

    /// Select the SPB2 pixel clock configuration.
    pub fn set_spb2_config(&mut self, config: Spb2Config) -> Result<()> {
        let (geometry, ctx) = self.geometry_parts();
        geometry.set_spb2_config(&ctx, config)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Error stopping camera: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockFrelon;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

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
    fn test_sync_detects_model() {
        let mock = MockFrelon::new();
        let cam = camera(&mock);
        assert_eq!(cam.model().name().unwrap(), "HD E230-42");
        assert_eq!(cam.model().serial_nb().unwrap(), 0x21);
        assert_eq!(cam.trig_mode(), TrigMode::IntTrig);
        assert_eq!(cam.nb_frames(), 1);
        // good reset protocol: ext sync off, stop sent
        assert_eq!(mock.register(Reg::HardTrigDisable), Some(3));
        assert_eq!(mock.commands(), vec![Cmd::Stop]);
        assert_eq!(mock.link_resets(), 0);
    }

    #[test]
    fn test_sync_resets_link_when_down() {
        let mock = MockFrelon::new();
        mock.set_chan_up(false);
        let _cam = camera(&mock);
        assert_eq!(mock.link_resets(), 1);
    }

    #[test]
    fn test_sync_old_firmware_resets_link() {
        let mock = MockFrelon::new();
        mock.set_register_text(Reg::Version, "2.0c");
        let cam = camera(&mock);
        assert!(!cam.model().has(Feature::GoodResetProtocol));
        assert_eq!(mock.link_resets(), 1);
        assert_eq!(mock.register(Reg::HardTrigDisable), Some(0));
        assert!(cam.status(true, false).unwrap_err().is_not_supported());
    }

    #[test]
    #[traced_test]
    fn test_sync_busy_camera_hard_reset() {
        let mock = MockFrelon::new();
        mock.set_register(Reg::StatusSeqA, Status::EXPOSURE.bits() as i32);
        let _cam = camera(&mock);
        // the reset restored an idle sequencer
        assert_eq!(mock.commands(), vec![Cmd::Stop, Cmd::Reset, Cmd::Stop]);
        assert!(logs_contain("Trying a hard reset"));
    }

    #[test]
    fn test_sync_rejects_dual_f16() {
        let mock = MockFrelon::new();
        mock.set_register_text(Reg::Version, "4.1");
        // SPB8, Andanta chip, XY connection
        mock.set_register(Reg::CompSerNb, 0x7201);
        mock.set_register(Reg::CamChar, 0x0300);
        let err = Camera::with_catalog(
            Box::new(mock.clone()),
            Arc::new(mock.clone()),
            RegisterCatalog::default().without_settle_delays(),
            &MockFrelon::settings(),
        )
        .err()
        .unwrap();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_exp_time_units() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);

        cam.set_exp_time(1.5e-3).unwrap();
        assert_eq!(mock.register(Reg::TimeUnit), Some(1));
        assert_eq!(mock.register(Reg::ExpTime), Some(1500));

        cam.set_exp_time(2.0).unwrap();
        assert_eq!(mock.register(Reg::TimeUnit), Some(0));
        assert_eq!(mock.register(Reg::ExpTime), Some(2000));
        assert_eq!(cam.exp_time().unwrap(), 2.0);

        cam.set_exp_time(1e-9).unwrap();
        assert_eq!(mock.register(Reg::TimeUnit), Some(1));
        assert_eq!(mock.register(Reg::ExpTime), Some(1));

        assert!(matches!(cam.set_exp_time(-1.0), Err(FrelonError::InvalidValue(_))));
        assert!(matches!(cam.set_exp_time(70.0), Err(FrelonError::InvalidValue(_))));
    }

    #[test]
    fn test_gate_mode_forces_null_exposure() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        cam.set_trig_mode(TrigMode::ExtGate).unwrap();
        assert_eq!(cam.exp_time().unwrap(), 0.0);

        // ignored while gated
        cam.set_exp_time(0.1).unwrap();
        assert_eq!(cam.exp_time().unwrap(), 0.0);

        cam.set_trig_mode(TrigMode::IntTrig).unwrap();
        assert_eq!(cam.exp_time().unwrap(), 1.0);
    }

    #[test]
    fn test_multi_trigger_programs_one_frame() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        cam.set_nb_frames(10).unwrap();
        assert_eq!(mock.register(Reg::NbFrames), Some(10));
        cam.set_trig_mode(TrigMode::ExtTrigMult).unwrap();
        assert_eq!(mock.register(Reg::NbFrames), Some(1));
        assert_eq!(cam.nb_frames(), 10);
    }

    #[test]
    fn test_ext_sync() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        cam.set_ext_sync_enable(ExtSync::Start).unwrap();
        assert_eq!(mock.register(Reg::HardTrigDisable), Some(2));
        assert_eq!(cam.ext_sync_enable().unwrap(), ExtSync::Start);
    }

    #[test]
    fn test_status_folds_spb2_bits() {
        let mock = MockFrelon::new();
        let cam = camera(&mock);
        assert_eq!(cam.status(true, true).unwrap(), Status::WAIT);

        mock.set_register(Reg::StatusAMTA, 0x7f);
        assert_eq!(
            cam.status(true, true).unwrap(),
            Status::WAIT | Status::ESPIA_XFER
        );
        mock.set_register(Reg::StatusAMTA, 0x01);
        assert_eq!(cam.status(true, true).unwrap(), Status::WAIT | Status::IN_INIT);
        assert_eq!(cam.status(false, false).unwrap(), Status::WAIT);
    }

    #[test]
    fn test_wait_status_timeout() {
        let mock = MockFrelon::new();
        let cam = camera(&mock);
        mock.set_register(Reg::StatusSeqA, Status::READOUT.bits() as i32);
        let t0 = Instant::now();
        let (ok, status) = cam
            .wait_status(Status::WAIT, Status::MASK, Some(Duration::from_millis(20)), true, false)
            .unwrap();
        assert!(!ok);
        assert_eq!(status, Status::READOUT);
        assert!(t0.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_start_stop() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        mock.clear_log();

        cam.set_nb_frames(4).unwrap();
        cam.start().unwrap();
        assert!(cam.is_running());
        assert!(matches!(cam.start(), Err(FrelonError::InvalidValue(_))));
        assert_eq!(cam.image_count(false).unwrap(), 4);

        cam.stop().unwrap();
        assert!(!cam.is_running());
        assert_eq!(mock.commands(), vec![Cmd::Start]);
    }

    #[test]
    fn test_external_start_enables_sync() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        cam.set_trig_mode(TrigMode::ExtTrigSingle).unwrap();
        cam.start().unwrap();
        assert_eq!(mock.register(Reg::HardTrigDisable), Some(0));

        mock.set_register(Reg::StatusSeqA, Status::EXPOSURE.bits() as i32);
        mock.clear_log();
        cam.stop().unwrap();
        assert_eq!(mock.register(Reg::HardTrigDisable), Some(3));
        assert_eq!(mock.commands(), vec![Cmd::Stop]);
        mock.set_register(Reg::StatusSeqA, Status::WAIT.bits() as i32);
    }

    #[test]
    fn test_max_idle_wait_time() {
        let mock = MockFrelon::new();
        let cam = camera(&mock);
        assert_eq!(cam.max_idle_wait_time().unwrap(), Duration::from_millis(100));

        let mock = MockFrelon::new();
        mock.set_register_text(Reg::Version, "2.0c");
        let cam = camera(&mock);
        // exposure of one second is added on old firmware
        assert_eq!(cam.max_idle_wait_time().unwrap(), Duration::from_millis(1100));
    }

    #[test]
    fn test_measure_seq_tim_values() {
        let mock = MockFrelon::new();
        mock.set_register_text(Reg::Version, "4.1");
        let mut cam = camera(&mock);

        cam.set_bin(Bin::new(1, 4)).unwrap();
        assert!(cam.need_timing_measure().unwrap());
        assert_eq!(cam.dead_time().unwrap(), None);
        assert!(cam.set_total_lat_time(0.5).is_err());

        mock.clear_log();
        let values = cam.measure_seq_tim_values(None).unwrap();
        assert!((values.readout_time - 0.099072).abs() < 1e-9);
        assert!(!cam.need_timing_measure().unwrap());
        assert_eq!(cam.dead_time().unwrap(), Some(values.readout_time));

        // temporary values restored
        assert_eq!(mock.register(Reg::NbFrames), Some(1));
        assert_eq!(mock.register(Reg::ExpTime), Some(1000));
        let writes = mock.writes();
        assert!(writes.contains(&(Reg::NbFrames, 3)));
        assert!(writes.contains(&(Reg::ExpTime, 1)));
        assert_eq!(mock.commands(), vec![Cmd::Start]);
    }

    #[test]
    fn test_measure_requires_ext_sync_none() {
        let mock = MockFrelon::new();
        mock.set_register_text(Reg::Version, "4.1");
        let mut cam = camera(&mock);
        cam.set_ext_sync_enable(ExtSync::Both).unwrap();
        let err = cam.measure_seq_tim_values(None).unwrap_err();
        assert_eq!(err.to_string(), "Camera error: Camera ExtSyncEnable is not None");

        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        assert!(cam.measure_seq_tim_values(None).unwrap_err().is_not_supported());
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<f64>>);

    impl DeadTimeListener for Recorder {
        fn dead_time_changed(&self, dead_time: f64) {
            self.0.lock().push(dead_time);
        }
    }

    #[test]
    fn test_time_unit_change_notifies_listener_once() {
        let mock = MockFrelon::new();
        let mut cam = camera(&mock);
        let recorder = Arc::new(Recorder::default());
        cam.register_dead_time_listener(recorder.clone()).unwrap();

        cam.set_time_unit_factor(TimeUnitFactor::Microseconds).unwrap();
        mock.set_register(Reg::ReadoutTime, 50880);
        cam.set_time_unit_factor(TimeUnitFactor::Milliseconds).unwrap();

        // sync already recorded the initial value
        let seen = recorder.0.lock().clone();
        assert_eq!(seen.len(), 1);
        assert!((seen[0] - 0.05088).abs() < 1e-9);
    }
}
