//! Waiting for the flash erase that follows `set_data_length`.
//!
//! A T31-family firmware stage starts a full-chip erase once it learns the
//! write length. Bulk data sent before the erase finishes is lost, so the
//! status word is polled until it settles. Other variants get a fixed delay.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::device::{DeviceHandle, DeviceStage};
use crate::protocol::ProcessorVariant;
use crate::protocol::commands::read_status;
use crate::transport::UsbTransport;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErasePolicy {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    /// Identical reads after `min_wait` that count as ready.
    pub stable_polls: u32,
}

impl ErasePolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            min_wait: Duration::from_millis(config.erase_min_wait_ms),
            max_wait: Duration::from_millis(config.erase_max_wait_ms),
            poll_interval: Duration::from_millis(config.erase_poll_interval_ms),
            stable_polls: config.erase_stable_polls,
        }
    }
}

/// How the wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseOutcome {
    /// Same status for `stable_polls` reads.
    Stable(u32),
    /// Status changed after the minimum wait.
    Changed { from: u32, to: u32 },
    /// Variant without status polling; slept for `min_wait`.
    FixedDelay,
    /// `max_wait` passed without a verdict. The write proceeds anyway.
    TimedOut,
}

fn polls_status(stage: Option<DeviceStage>, variant: ProcessorVariant) -> bool {
    stage == Some(DeviceStage::Firmware)
        && matches!(
            variant,
            ProcessorVariant::T31 | ProcessorVariant::T31X | ProcessorVariant::T31ZX
        )
}

/// Block until the device looks ready for bulk data. Status read errors
/// count as "still busy".
pub fn wait_for_erase_ready<T: UsbTransport>(
    device: &mut DeviceHandle<T>,
    policy: &ErasePolicy,
) -> EraseOutcome {
    if !polls_status(device.stage(), device.variant()) {
        debug!(wait_ms = policy.min_wait.as_millis() as u64, "Fixed erase delay");
        thread::sleep(policy.min_wait);
        return EraseOutcome::FixedDelay;
    }

    info!("Waiting for flash erase");
    let timeouts = *device.timeouts();
    let max_wait = policy.max_wait.max(policy.min_wait);
    // A zero interval would never advance `elapsed`.
    let interval = policy.poll_interval.max(MIN_POLL_INTERVAL);
    let mut elapsed = Duration::ZERO;
    let mut last: Option<u32> = None;
    let mut stable = 0u32;

    while elapsed < max_wait {
        match read_status(device.transport_mut(), &timeouts) {
            Ok(status) => {
                debug!(status = %format!("0x{:08X}", status), elapsed_ms = elapsed.as_millis() as u64, "Erase status");
                if elapsed >= policy.min_wait {
                    match last {
                        Some(prev) if prev == status => stable += 1,
                        Some(prev) => {
                            info!(from = %format!("0x{:08X}", prev), to = %format!("0x{:08X}", status), "Erase status changed");
                            return EraseOutcome::Changed { from: prev, to: status };
                        }
                        None => {
                            last = Some(status);
                            stable = 1;
                        }
                    }
                    if stable >= policy.stable_polls {
                        info!(status = %format!("0x{:08X}", status), "Erase status stable");
                        return EraseOutcome::Stable(status);
                    }
                }
            }
            Err(e) => debug!(error = %e, "Erase status poll failed"),
        }

        thread::sleep(interval);
        elapsed += interval;
    }

    warn!(
        elapsed_ms = elapsed.as_millis() as u64,
        "Timed out waiting for erase status, continuing"
    );
    EraseOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandTimeouts;
    use crate::transport::{MockOp, MockTransport};

    fn policy() -> ErasePolicy {
        ErasePolicy {
            min_wait: Duration::from_millis(2),
            max_wait: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
            stable_polls: 3,
        }
    }

    fn firmware_device(mock: &MockTransport, magic: &[u8]) -> DeviceHandle<MockTransport> {
        mock.queue_control_in(magic);
        let mut device = DeviceHandle::new(
            mock.clone(),
            CommandTimeouts {
                settle: Duration::ZERO,
                ..Default::default()
            },
        );
        device.query_stage().unwrap();
        device
    }

    fn status_reads(mock: &MockTransport) -> usize {
        mock.ops()
            .iter()
            .filter(|op| matches!(op, MockOp::ControlIn { request, .. } if request.request == 0x19))
            .count()
    }

    #[test]
    fn test_stable_status() {
        let mock = MockTransport::new();
        // "BOOT4731": firmware stage, classified as T31.
        let mut device = firmware_device(&mock, b"BOOT4731");
        for _ in 0..8 {
            mock.queue_control_in(&[1, 0, 0, 0]);
        }
        assert_eq!(
            wait_for_erase_ready(&mut device, &policy()),
            EraseOutcome::Stable(1)
        );
        // Two polls before min_wait, then three identical ones.
        assert_eq!(status_reads(&mock), 5);
    }

    #[test]
    fn test_changed_status() {
        let mock = MockTransport::new();
        let mut device = firmware_device(&mock, b"BOOT4731");
        for status in [1u8, 1, 1, 2] {
            mock.queue_control_in(&[status, 0, 0, 0]);
        }
        assert_eq!(
            wait_for_erase_ready(&mut device, &policy()),
            EraseOutcome::Changed { from: 1, to: 2 }
        );
    }

    #[test]
    fn test_poll_errors_time_out() {
        let mock = MockTransport::new();
        let mut device = firmware_device(&mock, b"BOOT4731");
        // Nothing queued: every poll times out.
        assert_eq!(
            wait_for_erase_ready(&mut device, &policy()),
            EraseOutcome::TimedOut
        );
        assert_eq!(status_reads(&mock), 20);
    }

    #[test]
    fn test_zero_poll_interval_terminates() {
        let mock = MockTransport::new();
        let mut device = firmware_device(&mock, b"BOOT4731");
        let policy = ErasePolicy {
            min_wait: Duration::ZERO,
            max_wait: Duration::from_millis(5),
            poll_interval: Duration::ZERO,
            stable_polls: 3,
        };
        assert_eq!(
            wait_for_erase_ready(&mut device, &policy),
            EraseOutcome::TimedOut
        );
        assert_eq!(status_reads(&mock), 5);
    }

    #[test]
    fn test_other_variants_use_fixed_delay() {
        let mock = MockTransport::new();
        let mut device = firmware_device(&mock, b"BOOT4740");
        assert_eq!(
            wait_for_erase_ready(&mut device, &policy()),
            EraseOutcome::FixedDelay
        );
        assert_eq!(status_reads(&mock), 0);
    }
}
