//! Simulated Frelon camera.
//!
//! [`MockFrelon`] answers the ASCII register protocol from an in-memory
//! register file and also plays the frame-grabber side of the link. It is a
//! cheap handle: clones share the same state, so a test can hand one clone
//! to the protocol engine and keep another to inspect what went over the
//! wire or to inject faults.
//!
//! # Example
//!
//! ```rust,ignore
//! let mock = MockFrelon::new();
//! let line = SerialLine::new(Box::new(mock.clone()), catalog, &MockFrelon::settings());
//! mock.fail_next("BH", 1);
//! regs.write_register(Reg::BinHorz, 2)?; // retried once, then succeeds
//! assert_eq!(mock.register(Reg::BinHorz), Some(2));
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{FrameGrabberLink, Transport};
use crate::catalog::{Cmd, MultiLineCmd, Reg, Status, SPB2_TST_INIT_GOOD};
use crate::config::{Settings, TimeoutSettings};
use crate::error::{FrelonError, Result};

/// Default firmware reported by the simulated camera.
pub const MOCK_VERSION: &str = "3.1c";
/// SPB2 board with an E2V 2k sensor, serial number 0x21.
pub const MOCK_SERIAL_NB: i32 = 0x2121;

#[derive(Debug, Clone)]
struct Fault {
    reply: String,
    remaining: Option<u32>,
}

#[derive(Debug)]
struct MockState {
    registers: HashMap<Reg, String>,
    rx: VecDeque<String>,
    scripted: VecDeque<String>,
    faults: HashMap<String, Fault>,
    multi_line: HashMap<String, Vec<String>>,
    sent: Vec<String>,
    writes: Vec<(Reg, String)>,
    commands: Vec<Cmd>,
    timeout: Duration,
    link_resets: u32,
    chan_up: bool,
}

fn default_registers() -> HashMap<Reg, String> {
    let status = Status::WAIT.bits() as i32;
    [
        (Reg::Version, MOCK_VERSION.to_string()),
        (Reg::CompSerNb, MOCK_SERIAL_NB.to_string()),
        (Reg::ChanMode, "9".to_string()),
        (Reg::BinHorz, "1".to_string()),
        (Reg::BinVert, "1".to_string()),
        (Reg::CcdModesAvail, "4095".to_string()),
        (Reg::StatusSeqA, status.to_string()),
        (Reg::StatusAMTA, SPB2_TST_INIT_GOOD.to_string()),
        (Reg::HardTrigDisable, "0".to_string()),
        (Reg::TimeUnit, "0".to_string()),
        (Reg::ExpTime, "1000".to_string()),
        (Reg::NbFrames, "1".to_string()),
        (Reg::ReadoutTime, "99072".to_string()),
        (Reg::TransferTime, "0".to_string()),
        (Reg::SeqTimRdOutH, "15".to_string()),
        (Reg::SeqTimRdOutL, "7680".to_string()),
    ]
    .into_iter()
    .collect()
}

/// In-memory camera implementing [`Transport`] and [`FrameGrabberLink`].
#[derive(Debug, Clone)]
pub struct MockFrelon {
    state: Arc<Mutex<MockState>>,
}

impl MockFrelon {
    /// Simulated camera with power-on register defaults.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                registers: default_registers(),
                rx: VecDeque::new(),
                scripted: VecDeque::new(),
                faults: HashMap::new(),
                multi_line: HashMap::new(),
                sent: Vec::new(),
                writes: Vec::new(),
                commands: Vec::new(),
                timeout: Duration::from_millis(200),
                link_resets: 0,
                chan_up: true,
            })),
        }
    }

    /// Settings with short timeouts suitable for the simulated camera.
    pub fn settings() -> Settings {
        Settings {
            timeouts: TimeoutSettings {
                normal: Duration::from_millis(200),
                single_line: Duration::from_millis(10),
                multi_line: Duration::from_millis(50),
                reset_factor: 5,
                reset_link_wait: Duration::from_millis(1),
                update_ccd_status: Duration::from_millis(1),
                max_idle_wait: Duration::from_millis(100),
                measure: Duration::from_millis(200),
            },
            ..Settings::default()
        }
    }

    // -------------------------------------------------------------------------
    // Scenario setup
    // -------------------------------------------------------------------------

    /// Set a register as if the camera had changed it.
    pub fn set_register(&self, reg: Reg, val: i32) {
        self.state.lock().registers.insert(reg, val.to_string());
    }

    /// Set a register to a non-numeric value such as `VER`.
    pub fn set_register_text(&self, reg: Reg, text: &str) {
        self.state.lock().registers.insert(reg, text.to_string());
    }

    /// Answer the next frame with `reply` instead of executing it.
    pub fn push_reply(&self, reply: &str) {
        self.state.lock().scripted.push_back(reply.to_string());
    }

    /// Answer the next `count` frames for `mnemonic` with `!E:FAI`.
    pub fn fail_next(&self, mnemonic: &str, count: u32) {
        self.inject(mnemonic, "!E:FAI\r\n", Some(count));
    }

    /// Answer the next `count` frames for `mnemonic` with `!E:BSY`.
    pub fn busy_next(&self, mnemonic: &str, count: u32) {
        self.inject(mnemonic, "!E:BSY\r\n", Some(count));
    }

    /// Answer every frame for `mnemonic` with `reply`.
    pub fn always_reply(&self, mnemonic: &str, reply: &str) {
        self.inject(mnemonic, reply, None);
    }

    /// Drop every injected reply.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    fn inject(&self, mnemonic: &str, reply: &str, remaining: Option<u32>) {
        if remaining == Some(0) {
            return;
        }
        self.state.lock().faults.insert(
            mnemonic.to_string(),
            Fault {
                reply: reply.to_string(),
                remaining,
            },
        );
    }

    /// Lines answered to a multi-line query.
    pub fn set_multi_line_reply(&self, mnemonic: &str, lines: &[&str]) {
        self.state.lock().multi_line.insert(
            mnemonic.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// State reported for the frame grabber channel.
    pub fn set_chan_up(&self, up: bool) {
        self.state.lock().chan_up = up;
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Integer value of a register.
    pub fn register(&self, reg: Reg) -> Option<i32> {
        self.state
            .lock()
            .registers
            .get(&reg)
            .and_then(|v| v.parse().ok())
    }

    /// Raw frames received, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Frames received so far; each one gets exactly one reply.
    pub fn round_trips(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Register writes the camera executed, in order.
    pub fn writes(&self) -> Vec<(Reg, i32)> {
        self.state
            .lock()
            .writes
            .iter()
            .filter_map(|(r, v)| v.parse().ok().map(|v| (*r, v)))
            .collect()
    }

    /// Registers written, in order, without values.
    pub fn written_regs(&self) -> Vec<Reg> {
        self.state.lock().writes.iter().map(|(r, _)| *r).collect()
    }

    /// Commands the camera executed, in order.
    pub fn commands(&self) -> Vec<Cmd> {
        self.state.lock().commands.clone()
    }

    /// Link resets requested so far.
    pub fn link_resets(&self) -> u32 {
        self.state.lock().link_resets
    }

    /// Forget the recorded traffic, keeping the register file.
    pub fn clear_log(&self) {
        let mut s = self.state.lock();
        s.sent.clear();
        s.writes.clear();
        s.commands.clear();
    }
}

impl Default for MockFrelon {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn take_fault(&mut self, mnemonic: &str) -> Option<String> {
        let fault = self.faults.get_mut(mnemonic)?;
        let reply = fault.reply.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(mnemonic);
        }
        Some(reply)
    }

    fn execute(&mut self, frame: &str) -> Vec<String> {
        let body = frame.trim_start_matches('>').trim_end_matches(['\r', '\n']);
        let split = body
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(body.len());
        let (mnemonic, arg) = body.split_at(split);

        if let Some(reply) = self.scripted.pop_front() {
            return vec![reply];
        }
        if let Some(reply) = self.take_fault(mnemonic) {
            return vec![reply];
        }

        if let Some(cmd) = Cmd::ALL.iter().copied().find(|c| c.mnemonic() == mnemonic) {
            self.commands.push(cmd);
            match cmd {
                Cmd::Reset => self.registers = default_registers(),
                Cmd::Start => {
                    // Frames complete instantly.
                    let frames = self.registers.get(&Reg::NbFrames).cloned().unwrap_or_default();
                    self.registers.insert(Reg::StatusAMTC, frames);
                    self.registers.insert(Reg::StatusAMTD, "0".to_string());
                }
                _ => {}
            }
            return vec!["!OK\r\n".to_string()];
        }

        if let Some(cmd) = MultiLineCmd::from_mnemonic(mnemonic) {
            return self
                .multi_line
                .get(mnemonic)
                .cloned()
                .unwrap_or_else(|| vec![format!("{} output\r\n", cmd.mnemonic())]);
        }

        let Some(reg) = Reg::from_mnemonic(mnemonic) else {
            return vec!["!E:CMD not valid\r\n".to_string()];
        };
        if arg == "?" {
            let val = self.registers.get(&reg).cloned().unwrap_or_else(|| "0".to_string());
            return vec![format!("!OK:{val}\r\n")];
        }
        if arg.is_empty() {
            return vec!["!E:Missing value\r\n".to_string()];
        }
        self.registers.insert(reg, arg.to_string());
        self.writes.push((reg, arg.to_string()));
        vec!["!OK\r\n".to_string()]
    }
}

impl Transport for MockFrelon {
    fn write(&mut self, data: &[u8], _no_wait: bool) -> Result<()> {
        let frame = String::from_utf8_lossy(data).into_owned();
        trace!("Mock received {:?}", frame);
        let mut s = self.state.lock();
        let replies = s.execute(&frame);
        s.sent.push(frame);
        s.rx.extend(replies);
        Ok(())
    }

    fn read_line(&mut self, max_len: usize, timeout: Duration) -> Result<String> {
        let line = {
            let mut s = self.state.lock();
            s.rx.pop_front()
        };
        match line {
            Some(mut line) => {
                line.truncate(max_len);
                Ok(line)
            }
            None => {
                thread::sleep(timeout);
                Err(FrelonError::Timeout(timeout))
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.state.lock().rx.clear();
        Ok(())
    }

    fn available_bytes(&mut self) -> Result<usize> {
        Ok(self.state.lock().rx.iter().map(String::len).sum())
    }

    fn timeout(&self) -> Duration {
        self.state.lock().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(FrelonError::InvalidValue("serial timeout must be non-zero".into()));
        }
        self.state.lock().timeout = timeout;
        Ok(())
    }
}

impl FrameGrabberLink for MockFrelon {
    fn ccd_status(&self) -> Result<i32> {
        let s = self.state.lock();
        Ok(s.registers
            .get(&Reg::StatusSeqA)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    fn chan_up(&self) -> Result<bool> {
        Ok(self.state.lock().chan_up)
    }

    fn reset_link(&self) -> Result<()> {
        let mut s = self.state.lock();
        s.link_resets += 1;
        s.chan_up = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(mock: &mut MockFrelon, frame: &str) -> String {
        mock.write(frame.as_bytes(), false).unwrap();
        mock.read_line(256, Duration::from_millis(1)).unwrap()
    }

    #[test]
    fn test_register_file() {
        let mut mock = MockFrelon::new();
        assert_eq!(exchange(&mut mock, ">VER?\r\n"), "!OK:3.1c\r\n");
        assert_eq!(exchange(&mut mock, ">RLB12\r\n"), "!OK\r\n");
        assert_eq!(exchange(&mut mock, ">RLB?\r\n"), "!OK:12\r\n");
        assert_eq!(mock.writes(), vec![(Reg::RoiLineBegin, 12)]);
        assert_eq!(mock.round_trips(), 3);
    }

    #[test]
    fn test_fault_injection_is_counted() {
        let mut mock = MockFrelon::new();
        mock.fail_next("BH", 2);
        assert_eq!(exchange(&mut mock, ">BH2\r\n"), "!E:FAI\r\n");
        assert_eq!(exchange(&mut mock, ">BH2\r\n"), "!E:FAI\r\n");
        assert_eq!(exchange(&mut mock, ">BH2\r\n"), "!OK\r\n");
        assert_eq!(mock.register(Reg::BinHorz), Some(2));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut mock = MockFrelon::new();
        exchange(&mut mock, ">BV4\r\n");
        exchange(&mut mock, ">RST\r\n");
        assert_eq!(mock.register(Reg::BinVert), Some(1));
        assert_eq!(mock.commands(), vec![Cmd::Reset]);
    }

    #[test]
    fn test_empty_queue_times_out() {
        let mut mock = MockFrelon::new();
        let err = mock.read_line(16, Duration::from_millis(1)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_link() {
        let mock = MockFrelon::new();
        assert_eq!(mock.ccd_status().unwrap(), Status::WAIT.bits() as i32);
        mock.set_chan_up(false);
        assert!(!mock.chan_up().unwrap());
        mock.reset_link().unwrap();
        assert!(mock.chan_up().unwrap());
        assert_eq!(mock.link_resets(), 1);
    }
}
