#![forbid(unsafe_code)]

use std::thread;
use std::time::Duration;

use idreset_engines::process::ProcessControl;
use idreset_kernel_contracts::ResetError;
use tracing::{info, warn};

/// Fixed wait between a termination request and the liveness re-check.
pub const SETTLE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessGateOutcome {
    NotRunning,
    Stopped,
}

/// Detect, request termination once, settle, re-check. No retries.
pub struct ProcessLifecycleGate<'a> {
    control: &'a dyn ProcessControl,
    settle: Duration,
}

impl<'a> ProcessLifecycleGate<'a> {
    pub fn new(control: &'a dyn ProcessControl) -> Self {
        Self::with_settle(control, SETTLE_INTERVAL)
    }

    pub fn with_settle(control: &'a dyn ProcessControl, settle: Duration) -> Self {
        Self { control, settle }
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn ensure_stopped(&self) -> Result<ProcessGateOutcome, ResetError> {
        if !self.control.is_running() {
            return Ok(ProcessGateOutcome::NotRunning);
        }

        let target = self.control.target_label();
        info!(process = %target, "requesting termination");
        if let Err(reason) = self.control.request_termination() {
            warn!(process = %target, reason = %reason, "termination request reported failure");
        }
        thread::sleep(self.settle);

        if self.control.is_running() {
            return Err(ResetError::ProcessStillRunning { process: target });
        }
        info!(process = %target, "process stopped");
        Ok(ProcessGateOutcome::Stopped)
    }
}
