//! Hardware capability model.
//!
//! A [`Model`] turns the firmware version string, the complex serial number
//! word and (on recent firmware) the camera characteristics word into a set
//! of [`Feature`] flags plus derived hardware enums. It is recomputed on
//! every setter and stays invalid until both the firmware and the serial
//! number have been supplied.
//!
//! # Serial number layout
//!
//! ```text
//! bit  15     taper
//! bits 14..11 chip code (non-SPB1 boards)
//! bit  14     16-bit ADC (SPB1 boards)
//! bit  13     Kodak chip (SPB1 boards)
//! bits 10..8  SPB type
//! bits 7..0   serial number
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let mut model = Model::new();
//! model.set_version_str("3.1c")?;
//! model.set_complex_serial_nb(0x2121)?;
//! assert!(model.has(Feature::GoodResetProtocol));
//! assert_eq!(model.name()?, "HD E230-42");
//! ```

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{FrelonError, Result};
use crate::geometry::coords::Size;

// =============================================================================
// Serial number bit fields
// =============================================================================

/// Serial number field of the `SN` word.
pub const SER_NB_MASK: i32 = 0x00ff;
/// SPB generation field.
pub const SPB_TYPE_MASK: i32 = 0x0700;
/// SPB1 Kodak sensor flag.
pub const SPB1_KODAK: i32 = 0x2000;
/// SPB1 16-bit ADC flag.
pub const SPB1_ADC16: i32 = 0x4000;
/// Chip type field.
pub const CHIP_TYPE_MASK: i32 = 0x7800;
/// Fibre optic taper flag.
pub const TAPER_FLAG: i32 = 0x8000;

// =============================================================================
// Firmware
// =============================================================================

static FIRMWARE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<major>[0-9]+)\.(?P<minor>[0-9]+)(?P<rel>[a-z]+)?$")
        .unwrap_or_else(|e| unreachable!("invalid firmware regex: {e}"))
});

/// Firmware version, ordered by (major, minor, release letters).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Firmware {
    major: u32,
    minor: u32,
    release: String,
}

impl Firmware {
    /// Parse a version string such as `3.1c` or `4.1`.
    pub fn parse(ver: &str) -> Result<Firmware> {
        let ver = ver.trim();
        let caps = FIRMWARE_RE
            .captures(ver)
            .ok_or_else(|| FrelonError::InvalidValue(format!("Invalid firmware version {ver:?}")))?;

        let number = |name: &str| -> Result<u32> {
            caps[name]
                .parse()
                .map_err(|_| FrelonError::InvalidValue(format!("Invalid firmware version {ver:?}")))
        };
        let firmware = Firmware {
            major: number("major")?,
            minor: number("minor")?,
            release: caps.name("rel").map(|m| m.as_str().to_string()).unwrap_or_default(),
        };
        if !firmware.is_valid() {
            return Err(FrelonError::InvalidValue(format!(
                "Invalid firmware version {ver:?}"
            )));
        }
        Ok(firmware)
    }

    /// True once parsed from a `VER` reply.
    pub fn is_valid(&self) -> bool {
        self.major > 0 || self.minor > 0
    }

    /// Major version.
    pub fn major(&self) -> u32 {
        self.major
    }

    /// Minor version.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Release letter, possibly empty.
    pub fn release(&self) -> &str {
        &self.release
    }

    fn at_least(&self, ver: (u32, u32, &str)) -> bool {
        (self.major, self.minor, self.release.as_str()) >= ver
    }
}

impl PartialOrd for Firmware {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Firmware {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, &self.release).cmp(&(other.major, other.minor, &other.release))
    }
}

impl fmt::Display for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}.{}{}", self.major, self.minor, self.release)
        } else {
            f.write_str("Unknown")
        }
    }
}

const FW_V2_0C: (u32, u32, &str) = (2, 0, "c");
const FW_V2_1B: (u32, u32, &str) = (2, 1, "b");
const FW_V3_0I: (u32, u32, &str) = (3, 0, "i");
const FW_V3_1C: (u32, u32, &str) = (3, 1, "c");
const FW_V4_1: (u32, u32, &str) = (4, 1, "");

// =============================================================================
// Hardware enums
// =============================================================================

/// Sequencer/processing board generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpbType {
    /// First generation board.
    Spb1,
    /// Second generation board.
    Spb2,
    /// Frelon16 board.
    Spb8,
}

impl SpbType {
    fn from_code(code: i32) -> Option<SpbType> {
        match code {
            0 => Some(SpbType::Spb1),
            1 => Some(SpbType::Spb2),
            2 => Some(SpbType::Spb8),
            _ => None,
        }
    }
}

/// CCD sensor family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipType {
    /// Atmel sensor.
    Atmel,
    /// Kodak sensor.
    Kodak,
    /// E2V 2k sensor.
    E2v2k,
    /// E2V 2k sensor without MPP.
    E2v2kNotMpp,
    /// E2V 4k sensor.
    E2v4k,
    /// E2V 4k sensor without MPP.
    E2v4kNotMpp,
    /// Hamamatsu sensor.
    Hama,
    /// Andanta frame transfer 2k sensor.
    AndantaCcdFt2k,
}

impl ChipType {
    fn from_code(code: i32) -> Option<ChipType> {
        match code {
            0 => Some(ChipType::Atmel),
            1 => Some(ChipType::Kodak),
            2 => Some(ChipType::E2v2k),
            3 => Some(ChipType::E2v2kNotMpp),
            4 => Some(ChipType::E2v4k),
            5 => Some(ChipType::E2v4kNotMpp),
            6 => Some(ChipType::Hama),
            7 => Some(ChipType::AndantaCcdFt2k),
            _ => None,
        }
    }

    /// Sensor model token used in camera names.
    pub const fn model_name(self) -> &'static str {
        match self {
            ChipType::Atmel => "A7899",
            ChipType::Kodak => "K4320",
            ChipType::E2v2k => "E230-42",
            ChipType::E2v2kNotMpp => "E231-42",
            ChipType::E2v4k => "E230-84",
            ChipType::E2v4kNotMpp => "E231-84",
            ChipType::Hama => "Hama",
            ChipType::AndantaCcdFt2k => "CcdFT2k-F16",
        }
    }

    /// Full sensor size in pixels.
    pub const fn max_frame_size(self) -> Size {
        match self {
            ChipType::E2v4k | ChipType::E2v4kNotMpp => Size::new(4096, 4096),
            ChipType::Hama => Size::new(2048, 1),
            _ => Size::new(2048, 2048),
        }
    }

    /// Pixel pitch in meters.
    pub const fn pixel_size(self) -> f64 {
        match self {
            ChipType::Atmel | ChipType::Hama | ChipType::AndantaCcdFt2k => 14e-6,
            ChipType::Kodak => 24e-6,
            _ => 15e-6,
        }
    }
}

/// How several SPB8 boards are connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpbConType {
    /// Single board.
    None = 0,
    /// Boards side by side.
    X = 1,
    /// Boards stacked.
    Y = 2,
    /// Boards in a 2x2 grid.
    XY = 3,
}

impl SpbConType {
    fn from_bits(bits: i32) -> SpbConType {
        match bits & 3 {
            1 => SpbConType::X,
            2 => SpbConType::Y,
            3 => SpbConType::XY,
            _ => SpbConType::None,
        }
    }
}

/// Readout geometry family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeomType {
    /// Four-channel quadrant readout (SPB1/SPB2).
    Spb12Quad,
    /// Hamamatsu line sensor on SPB2.
    Hamamatsu,
    /// Frelon16 on a single SPB8 board.
    Spb8F16Single,
    /// Frelon16 on two SPB8 boards.
    Spb8F16Dual,
}

/// Capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// SPB1 board.
    Spb1,
    /// SPB2 board.
    Spb2,
    /// SPB8 board.
    Spb8,
    /// Fibre optic taper.
    Taper,
    /// Hamamatsu sensor.
    HamamatsuChip,
    /// Hard trigger disable register.
    HtdCommand,
    /// `CMA` register.
    ModesAvail,
    /// Readout/transfer time registers.
    TimingReadback,
    /// Reliable stop/reset sequence and serial-line status.
    GoodResetProtocol,
    /// Images per end-of-frame signal.
    ImagesPerEof,
    /// Camera characteristics word.
    CameraCharacteristics,
    /// Sequencer timing counters.
    SequencerTiming,
}

// =============================================================================
// Model
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct Derived {
    spb_type: SpbType,
    chip_type: ChipType,
    spb_con_type: SpbConType,
    features: HashSet<Feature>,
}

/// Capability model of the connected camera.
#[derive(Debug, Clone, Default)]
pub struct Model {
    firmware: Firmware,
    complex_ser_nb: i32,
    cam_char: i32,
    f16_force_single: bool,
    derived: Option<Derived>,
}

impl Model {
    /// Empty, invalid model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every input.
    pub fn reset(&mut self) {
        self.firmware = Firmware::default();
        self.complex_ser_nb = 0;
        self.cam_char = 0;
        self.derived = None;
    }

    /// Set the firmware version from the `VER` reply.
    pub fn set_version_str(&mut self, ver: &str) -> Result<()> {
        self.derived = None;
        self.firmware = Firmware::default();
        self.firmware = Firmware::parse(ver)?;
        self.update()
    }

    /// Firmware version.
    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    /// Set the `SN` word.
    pub fn set_complex_serial_nb(&mut self, complex_ser_nb: i32) -> Result<()> {
        self.complex_ser_nb = complex_ser_nb;
        self.update()
    }

    /// Raw `SN` word.
    pub fn complex_serial_nb(&self) -> i32 {
        self.complex_ser_nb
    }

    /// Set the camera characteristics word.
    pub fn set_cam_char(&mut self, cam_char: i32) -> Result<()> {
        self.cam_char = cam_char;
        self.update()
    }

    /// Raw camera characteristics word.
    pub fn cam_char(&self) -> i32 {
        self.cam_char
    }

    /// Treat a dual SPB8 Frelon16 as a single-board camera.
    pub fn set_f16_force_single(&mut self, force: bool) -> Result<()> {
        self.f16_force_single = force;
        self.update()
    }

    /// True when a dual SPB8 Frelon16 is treated as single-board.
    pub fn f16_force_single(&self) -> bool {
        self.f16_force_single
    }

    /// True once version and serial number decode to a known camera.
    pub fn is_valid(&self) -> bool {
        self.derived.is_some()
    }

    fn update(&mut self) -> Result<()> {
        self.derived = None;
        if self.complex_ser_nb <= 0 || !self.firmware.is_valid() {
            return Ok(());
        }

        let sn = self.complex_ser_nb;
        let spb_code = (sn & SPB_TYPE_MASK) >> 8;
        let spb_type = SpbType::from_code(spb_code)
            .ok_or_else(|| FrelonError::InvalidValue(format!("Unknown SPB type code {spb_code}")))?;
        let is_spb1 = spb_type == SpbType::Spb1;

        let chip_type = if is_spb1 {
            if sn & SPB1_KODAK != 0 {
                ChipType::Kodak
            } else {
                ChipType::Atmel
            }
        } else {
            let raw = (sn & CHIP_TYPE_MASK) >> 11;
            let code = ((raw & 1) << 3) | (raw >> 1);
            ChipType::from_code(code)
                .ok_or_else(|| FrelonError::InvalidValue(format!("Unknown chip type code {code}")))?
        };

        let mut features = HashSet::new();
        let mut set = |feature: Feature, on: bool| {
            if on {
                features.insert(feature);
            } else {
                features.remove(&feature);
            }
        };

        set(Feature::Spb1, spb_type == SpbType::Spb1);
        set(Feature::Spb2, spb_type == SpbType::Spb2);
        set(Feature::Spb8, spb_type == SpbType::Spb8);
        set(Feature::Taper, sn & TAPER_FLAG != 0);
        set(Feature::HamamatsuChip, chip_type == ChipType::Hama);

        let fw = |ver| !is_spb1 && self.firmware.at_least(ver);
        set(Feature::HtdCommand, fw(FW_V2_0C));
        set(Feature::ModesAvail, fw(FW_V2_1B));
        set(Feature::TimingReadback, fw(FW_V2_1B));
        set(Feature::GoodResetProtocol, fw(FW_V3_0I));
        set(Feature::ImagesPerEof, fw(FW_V3_1C));
        set(Feature::CameraCharacteristics, fw(FW_V4_1));
        set(Feature::SequencerTiming, fw(FW_V4_1));
        if fw(FW_V4_1) {
            set(Feature::TimingReadback, false);
        }

        let mut spb_con_type = SpbConType::X;
        if fw(FW_V4_1) && self.cam_char != 0 {
            let con = SpbConType::from_bits(self.cam_char >> 8);
            let con = if con == SpbConType::XY && self.f16_force_single {
                SpbConType::X
            } else {
                con
            };
            if con != SpbConType::None {
                spb_con_type = con;
            }
        }

        debug!(
            ?spb_type,
            ?chip_type,
            ?spb_con_type,
            firmware = %self.firmware,
            "Model updated"
        );
        self.derived = Some(Derived {
            spb_type,
            chip_type,
            spb_con_type,
            features,
        });
        Ok(())
    }

    fn derived(&self) -> Result<&Derived> {
        self.derived
            .as_ref()
            .ok_or_else(|| FrelonError::InvalidValue("Frelon model not fully initialised yet".into()))
    }

    /// Capability flag; false while the model is invalid.
    pub fn has(&self, feature: Feature) -> bool {
        self.derived
            .as_ref()
            .map(|d| d.features.contains(&feature))
            .unwrap_or(false)
    }

    /// Serial number.
    pub fn serial_nb(&self) -> Result<i32> {
        self.derived()?;
        Ok(self.complex_ser_nb & SER_NB_MASK)
    }

    /// Board generation.
    pub fn spb_type(&self) -> Result<SpbType> {
        Ok(self.derived()?.spb_type)
    }

    /// Sensor family.
    pub fn chip_type(&self) -> Result<ChipType> {
        Ok(self.derived()?.chip_type)
    }

    /// SPB8 board arrangement.
    pub fn spb_con_type(&self) -> Result<SpbConType> {
        Ok(self.derived()?.spb_con_type)
    }

    /// True for a Frelon16.
    pub fn is_frelon16(&self) -> bool {
        matches!(self.chip_type(), Ok(ChipType::AndantaCcdFt2k))
    }

    /// ADC resolution in bits.
    pub fn adc_bits(&self) -> Result<u32> {
        self.derived()?;
        if self.has(Feature::Spb1) && self.complex_ser_nb & SPB1_ADC16 == 0 {
            Ok(14)
        } else {
            Ok(16)
        }
    }

    /// Pixel size in metres.
    pub fn pixel_size(&self) -> Result<f64> {
        Ok(self.chip_type()?.pixel_size())
    }

    /// Readout geometry family.
    pub fn geom_type(&self) -> Result<GeomType> {
        let chip_type = self.chip_type()?;
        if self.has(Feature::Spb2) {
            match chip_type {
                ChipType::Hama => Ok(GeomType::Hamamatsu),
                ChipType::AndantaCcdFt2k => Err(FrelonError::NotSupported(
                    "Obsolete Frelon16 with SPB2".into(),
                )),
                _ => Ok(GeomType::Spb12Quad),
            }
        } else if self.has(Feature::Spb8) {
            if chip_type != ChipType::AndantaCcdFt2k {
                return Err(FrelonError::NotSupported("SPB8 only supports Frelon16".into()));
            }
            if self.spb_con_type()? == SpbConType::XY {
                Ok(GeomType::Spb8F16Dual)
            } else {
                Ok(GeomType::Spb8F16Single)
            }
        } else {
            Ok(GeomType::Spb12Quad)
        }
    }

    /// Human readable camera name, e.g. `HD E230-42T`.
    pub fn name(&self) -> Result<String> {
        let chip_type = self.chip_type()?;

        let prefix = if chip_type == ChipType::AndantaCcdFt2k {
            if self.has(Feature::Spb2) {
                "SPB2".to_string()
            } else if self.spb_con_type()? == SpbConType::XY {
                "SPB8x2".to_string()
            } else {
                "SPB8".to_string()
            }
        } else if self.has(Feature::Spb2) {
            "HD".to_string()
        } else {
            String::new()
        };

        let mut name = if prefix.is_empty() {
            chip_type.model_name().to_string()
        } else {
            format!("{} {}", prefix, chip_type.model_name())
        };
        if self.has(Feature::Spb1) && self.adc_bits()? == 16 {
            name.push_str(" 16bit");
        }
        if self.has(Feature::Taper) {
            name.push('T');
        }
        Ok(name)
    }
}
