//! Device handle and stage tracking.
//!
//! A [`DeviceHandle`] owns one open transport. Every transaction borrows it
//! mutably, so two operations can never interleave on the same device.

use std::fmt;

use tracing::{debug, info};

use crate::error::{ClonerError, Result};
use crate::protocol::commands::get_cpu_info;
use crate::protocol::constants::FIRMWARE_PIDS;
use crate::protocol::{CommandTimeouts, CpuIdentification, ProcessorVariant};
use crate::transport::UsbTransport;

/// Boot stage the device is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStage {
    /// ROM code, accepts a bootstrap payload.
    Bootrom,
    /// Bootstrapped firmware, accepts addressed flash reads and writes.
    Firmware,
}

impl DeviceStage {
    /// Stage implied by the enumerated PID. May be stale until queried.
    pub fn from_product_id(pid: u16) -> Self {
        if FIRMWARE_PIDS.contains(&pid) {
            DeviceStage::Firmware
        } else {
            DeviceStage::Bootrom
        }
    }
}

impl fmt::Display for DeviceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStage::Bootrom => write!(f, "bootrom"),
            DeviceStage::Firmware => write!(f, "firmware"),
        }
    }
}

/// Enumeration snapshot of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub address: u8,
    pub stage: DeviceStage,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} ({})",
            self.bus, self.address, self.vendor_id, self.product_id, self.stage
        )
    }
}

/// Per-handle lifecycle. There is no "unopened" state: a handle only
/// exists once its transport is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    StageKnown(DeviceStage),
    TransferInProgress,
    Idle,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Opened => write!(f, "OPENED"),
            SessionState::StageKnown(stage) => write!(f, "STAGE_KNOWN({})", stage),
            SessionState::TransferInProgress => write!(f, "TRANSFER_IN_PROGRESS"),
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// An open device session.
pub struct DeviceHandle<T: UsbTransport> {
    transport: T,
    state: SessionState,
    stage: Option<DeviceStage>,
    identification: Option<CpuIdentification>,
    timeouts: CommandTimeouts,
}

impl<T: UsbTransport> DeviceHandle<T> {
    /// Wrap an already opened transport.
    pub fn new(transport: T, timeouts: CommandTimeouts) -> Self {
        Self {
            transport,
            state: SessionState::Opened,
            stage: None,
            identification: None,
            timeouts,
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.transport.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.transport.product_id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last queried stage, `None` until [`query_stage`](Self::query_stage) runs.
    pub fn stage(&self) -> Option<DeviceStage> {
        self.stage
    }

    pub fn identification(&self) -> Option<&CpuIdentification> {
        self.identification.as_ref()
    }

    /// Variant from the last identification, `Unknown` before one exists.
    pub fn variant(&self) -> ProcessorVariant {
        self.identification
            .as_ref()
            .map(CpuIdentification::variant)
            .unwrap_or(ProcessorVariant::Unknown)
    }

    pub fn timeouts(&self) -> &CommandTimeouts {
        &self.timeouts
    }

    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn goto_state(&mut self, new_state: SessionState) {
        if self.state != new_state {
            debug!(from = %self.state, to = %new_state, "Session state transition");
            self.state = new_state;
        }
    }

    /// Ask the device for its CPU info and record the stage.
    ///
    /// A `BOOT...` magic means firmware; anything else, zeroed bytes
    /// included, means bootrom. Failing to get an answer is an error.
    pub fn query_stage(&mut self) -> Result<DeviceStage> {
        self.ensure_open()?;
        let id = get_cpu_info(&mut self.transport, &self.timeouts)?;
        let stage = if id.is_firmware_stage() {
            DeviceStage::Firmware
        } else {
            DeviceStage::Bootrom
        };

        info!(
            stage = %stage,
            magic = %id.clean_magic,
            variant = %id.variant(),
            "Device stage detected"
        );

        self.identification = Some(id);
        self.stage = Some(stage);
        self.goto_state(SessionState::StageKnown(stage));
        Ok(stage)
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            SessionState::Closed => Err(ClonerError::Protocol("device handle is closed".into())),
            SessionState::TransferInProgress => Err(ClonerError::Protocol(
                "another transfer is in progress on this device".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Fails without any I/O unless the stage is known to be firmware.
    pub fn require_firmware_stage(&self) -> Result<()> {
        self.ensure_open()?;
        match self.stage {
            Some(DeviceStage::Firmware) => Ok(()),
            Some(DeviceStage::Bootrom) => Err(ClonerError::Protocol(
                "operation requires firmware stage, device is in bootrom".into(),
            )),
            None => Err(ClonerError::Protocol(
                "device stage unknown, query it before transferring".into(),
            )),
        }
    }

    pub(crate) fn begin_transfer(&mut self) -> Result<()> {
        self.require_firmware_stage()?;
        self.goto_state(SessionState::TransferInProgress);
        Ok(())
    }

    pub(crate) fn end_transfer(&mut self) {
        if self.state == SessionState::TransferInProgress {
            self.goto_state(SessionState::Idle);
        }
    }

    fn release(&mut self) {
        if self.state != SessionState::Closed {
            self.transport.close();
            self.goto_state(SessionState::Closed);
        }
    }

    /// Close the device.
    pub fn close(mut self) {
        self.release();
    }
}

impl<T: UsbTransport> Drop for DeviceHandle<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run `f` on `device` and close it afterwards, whatever `f` returned.
pub fn scoped<T, R, F>(mut device: DeviceHandle<T>, f: F) -> Result<R>
where
    T: UsbTransport,
    F: FnOnce(&mut DeviceHandle<T>) -> Result<R>,
{
    let result = f(&mut device);
    device.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::{MockOp, MockTransport};
    use std::time::Duration;

    fn fast_timeouts() -> CommandTimeouts {
        CommandTimeouts {
            settle: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_stage_from_pid() {
        assert_eq!(DeviceStage::from_product_id(0x8887), DeviceStage::Firmware);
        assert_eq!(DeviceStage::from_product_id(0x601E), DeviceStage::Firmware);
        assert_eq!(DeviceStage::from_product_id(0x4770), DeviceStage::Bootrom);
        assert_eq!(DeviceStage::from_product_id(0xC309), DeviceStage::Bootrom);
    }

    #[test]
    fn test_query_stage_bootrom() {
        let mock = MockTransport::new();
        mock.queue_control_in(b"t20     ");
        let mut device = DeviceHandle::new(mock, fast_timeouts());
        assert_eq!(device.state(), SessionState::Opened);
        assert_eq!(device.variant(), ProcessorVariant::Unknown);

        assert_eq!(device.query_stage().unwrap(), DeviceStage::Bootrom);
        assert_eq!(device.identification().unwrap().clean_magic, "t20");
        assert_eq!(device.variant(), ProcessorVariant::T20);
        assert_eq!(
            device.state(),
            SessionState::StageKnown(DeviceStage::Bootrom)
        );
    }

    #[test]
    fn test_query_stage_firmware() {
        let mock = MockTransport::new();
        mock.queue_control_in(b"BOOT4775");
        let mut device = DeviceHandle::new(mock, fast_timeouts());
        assert_eq!(device.query_stage().unwrap(), DeviceStage::Firmware);
        assert!(device.require_firmware_stage().is_ok());
    }

    #[test]
    fn test_zeroed_identification_is_bootrom() {
        let mock = MockTransport::new();
        mock.queue_control_in(&[0u8; 16]);
        let mut device = DeviceHandle::new(mock, fast_timeouts());
        assert_eq!(device.query_stage().unwrap(), DeviceStage::Bootrom);
    }

    #[test]
    fn test_query_failure_is_not_bootrom() {
        let mock = MockTransport::new();
        let mut device = DeviceHandle::new(mock, fast_timeouts());
        let err = device.query_stage().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(device.stage(), None);
    }

    #[test]
    fn test_unknown_stage_is_rejected_without_io() {
        let mock = MockTransport::new();
        let device = DeviceHandle::new(mock.clone(), fast_timeouts());
        let err = device.require_firmware_stage().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_scoped_closes_on_error() {
        let mock = MockTransport::new();
        let device = DeviceHandle::new(mock.clone(), fast_timeouts());
        let result: Result<()> = scoped(device, |d| {
            d.require_firmware_stage()?;
            Ok(())
        });
        assert!(result.is_err());
        assert!(mock.is_closed());
        assert_eq!(mock.ops(), vec![MockOp::Close]);
    }

    #[test]
    fn test_drop_closes() {
        let mock = MockTransport::new();
        drop(DeviceHandle::new(mock.clone(), fast_timeouts()));
        assert!(mock.is_closed());
    }
}
