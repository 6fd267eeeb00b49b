//! Register access layer.
//!
//! Typed register reads and writes on top of [`SerialLine`]. Writes go
//! through the busy/fail retry policy; reads and commands never retry.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::catalog::{Cmd, MultiLineCmd, Reg};
use crate::error::Result;
use crate::error_recovery::{retry_write, RetryPolicy};
use crate::protocol::SerialLine;

/// Register reads and retried register writes.
#[derive(Clone)]
pub struct RegisterAccess {
    line: Arc<SerialLine>,
    policy: RetryPolicy,
}

impl RegisterAccess {
    /// Wrap a shared protocol engine with a write-retry policy.
    pub fn new(line: Arc<SerialLine>, policy: RetryPolicy) -> Self {
        Self { line, policy }
    }

    /// Underlying protocol engine.
    pub fn line(&self) -> &Arc<SerialLine> {
        &self.line
    }

    /// Write-retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Write `val` to `reg`, retrying on `FAI` and `BSY` device errors.
    #[instrument(skip(self, reg), fields(reg = %reg), err)]
    pub fn write_register(&self, reg: Reg, val: i32) -> Result<()> {
        let retries = retry_write(&self.policy, || self.line.write_register(reg, val))?;
        if retries > 0 {
            debug!("{} = {} written after {} retrie(s)", reg, val, retries);
        }
        Ok(())
    }

    /// Read an integer register, from the cache when possible.
    pub fn read_register(&self, reg: Reg) -> Result<i32> {
        self.line.read_register(reg)
    }

    /// Read a float register.
    pub fn read_float_register(&self, reg: Reg) -> Result<f64> {
        self.line.read_float_register(reg)
    }

    /// Boolean view of an integer register.
    pub fn read_flag(&self, reg: Reg) -> Result<bool> {
        Ok(self.read_register(reg)? != 0)
    }

    /// Write a boolean as 0 or 1.
    pub fn write_flag(&self, reg: Reg, on: bool) -> Result<()> {
        self.write_register(reg, i32::from(on))
    }

    /// Raw text of a register query reply.
    pub fn read_camera_register(&self, reg: Reg) -> Result<String> {
        self.line.read_camera_register(reg)
    }

    /// Send a command and wait for its acknowledge.
    pub fn send_cmd(&self, cmd: Cmd) -> Result<()> {
        self.line.send_cmd(cmd)
    }

    /// Send a multi-line query and collect its reply.
    pub fn multi_line_query(&self, cmd: MultiLineCmd) -> Result<String> {
        self.line.multi_line_query(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockFrelon;
    use crate::catalog::RegisterCatalog;
    use crate::error::FrelonError;
    use std::time::{Duration, Instant};

    fn access(policy: RetryPolicy) -> (RegisterAccess, MockFrelon) {
        let mock = MockFrelon::new();
        let line = SerialLine::new(
            Box::new(mock.clone()),
            RegisterCatalog::default().without_settle_delays(),
            &MockFrelon::settings(),
        );
        (RegisterAccess::new(Arc::new(line), policy), mock)
    }

    #[test]
    fn test_fail_is_retried_once() {
        let (regs, mock) = access(RetryPolicy::default());
        mock.fail_next("BV", 1);
        regs.write_register(Reg::BinVert, 4).unwrap();
        assert_eq!(mock.register(Reg::BinVert), Some(4));
        assert_eq!(mock.round_trips(), 2);

        mock.fail_next("BV", 2);
        let err = regs.write_register(Reg::BinVert, 8).unwrap_err();
        assert!(matches!(err, FrelonError::StillFailing(1)));
        assert_eq!(mock.round_trips(), 4);
    }

    #[test]
    fn test_busy_is_bounded() {
        let policy = RetryPolicy {
            busy_budget: Duration::from_millis(50),
            busy_backoff: Duration::from_millis(5),
            fail_retries: 1,
        };
        let (regs, mock) = access(policy);
        mock.always_reply("RLW", "!E:BSY\r\n");

        let t0 = Instant::now();
        let err = regs.write_register(Reg::RoiLineWidth, 100).unwrap_err();
        assert!(matches!(err, FrelonError::StillBusy(_)));
        assert!(t0.elapsed() >= Duration::from_millis(50));
        assert!(t0.elapsed() < Duration::from_secs(1));
        // nothing was confirmed, so nothing is cached
        assert_eq!(regs.line().cached_value(Reg::RoiLineWidth), None);
    }

    #[test]
    fn test_reads_are_not_retried() {
        let (regs, mock) = access(RetryPolicy::default());
        mock.fail_next("SSA", 1);
        let err = regs.read_register(Reg::StatusSeqA).unwrap_err();
        assert_eq!(err.to_string(), "Frelon Error: FAI");
        assert_eq!(mock.round_trips(), 1);
    }

    #[test]
    fn test_other_device_errors_propagate() {
        let (regs, mock) = access(RetryPolicy::default());
        mock.push_reply("!E:Value out of range\r\n");
        let err = regs.write_register(Reg::LatencyTime, 10).unwrap_err();
        assert!(matches!(err, FrelonError::Device(ref t) if t == "Value out of range"));
        assert_eq!(mock.round_trips(), 1);
    }

    #[test]
    fn test_flags() {
        let (regs, mock) = access(RetryPolicy::default());
        regs.write_flag(Reg::RoiEnable, true).unwrap();
        assert!(regs.read_flag(Reg::RoiEnable).unwrap());
        assert_eq!(mock.writes(), vec![(Reg::RoiEnable, 1)]);
    }
}
