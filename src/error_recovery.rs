//! Busy/fail retry policy for register writes.
//
// Register reads are never retried: a failed read means the line is
// unusable. Writes may hit two transient device conditions, reported in the
// `!E` reply text, and are retried here.

use std::thread::sleep;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::{DeviceFault, FrelonError, Result};

/// Defines a policy for retrying a register write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Time budget for retries while the camera answers `BSY`.
    /// Must exceed the worst-case full-frame transfer time.
    #[serde(with = "humantime_serde")]
    pub busy_budget: Duration,
    /// Pause between two busy retries.
    #[serde(with = "humantime_serde")]
    pub busy_backoff: Duration,
    /// Number of retries after a `FAI` reply.
    pub fail_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            busy_budget: Duration::from_millis(200),
            busy_backoff: Duration::from_millis(5),
            fail_retries: 1,
        }
    }
}

/// Run `attempt` until it succeeds or the policy gives up.
///
/// On success returns the number of retries that were needed. Errors without
/// a [`DeviceFault`] classification propagate immediately. When the fault
/// type changes between two attempts, the retry counter and the busy budget
/// restart from scratch.
pub fn retry_write<F>(policy: &RetryPolicy, mut attempt: F) -> Result<u32>
where
    F: FnMut() -> Result<()>,
{
    let mut t0 = Instant::now();
    let mut retry: u32 = 0;
    let mut prev_fault: Option<DeviceFault> = None;

    loop {
        let fault = match attempt() {
            Ok(()) => {
                if retry > 0 {
                    warn!("Succeeded after {} retrie(s)", retry);
                }
                return Ok(retry);
            }
            Err(e) => match e.device_fault() {
                Some(fault) => {
                    trace!("Error in write: {}", e);
                    fault
                }
                None => return Err(e),
            },
        };

        if retry > 0 && prev_fault != Some(fault) {
            warn!(
                "Write error type changed after {} retrie(s)! Restarting ...",
                retry
            );
            retry = 0;
            t0 = Instant::now();
        }
        prev_fault = Some(fault);

        let end = match fault {
            DeviceFault::Busy => t0.elapsed() >= policy.busy_budget,
            DeviceFault::Fail => retry >= policy.fail_retries,
        };
        if end {
            return Err(match fault {
                DeviceFault::Busy => FrelonError::StillBusy(policy.busy_budget),
                DeviceFault::Fail => FrelonError::StillFailing(retry),
            });
        }

        trace!("Retrying ...");
        if fault == DeviceFault::Busy && !policy.busy_backoff.is_zero() {
            sleep(policy.busy_backoff);
        }
        retry += 1;
    }
}
