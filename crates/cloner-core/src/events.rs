//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow progress without the
//! engine knowing how it is displayed.

use std::fmt;
use std::sync::Mutex;

use crate::device::DeviceStage;
use crate::error::ErrorKind;
use crate::protocol::ProcessorVariant;

/// Cloner operation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonerPhase {
    /// Waiting for device connection.
    WaitingForDevice,
    /// Reading CPU info.
    Identify,
    /// Flash read in progress.
    Reading,
    /// Waiting for the device to finish erasing.
    EraseWait,
    /// Flash write in progress.
    Writing,
    Flushing,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for ClonerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClonerPhase::WaitingForDevice => write!(f, "Waiting for Device"),
            ClonerPhase::Identify => write!(f, "Identify"),
            ClonerPhase::Reading => write!(f, "Reading"),
            ClonerPhase::EraseWait => write!(f, "Erase Wait"),
            ClonerPhase::Writing => write!(f, "Writing"),
            ClonerPhase::Flushing => write!(f, "Flushing"),
            ClonerPhase::Complete => write!(f, "Complete"),
            ClonerPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ClonerEvent {
    /// Device opened.
    DeviceOpened { vid: u16, pid: u16 },
    DeviceClosed,
    /// CPU info answered.
    StageDetected {
        stage: DeviceStage,
        variant: ProcessorVariant,
        magic: String,
    },
    /// Phase changed.
    PhaseChanged { from: ClonerPhase, to: ClonerPhase },
    /// Progress update for current operation, in bytes.
    Progress {
        phase: ClonerPhase,
        current: u64,
        total: u64,
    },
    /// A chunk is being retried.
    Retry {
        address: u32,
        attempt: u32,
        max_retries: u32,
        reason: String,
    },
    /// Error occurred.
    Error { kind: ErrorKind, message: String },
    /// USB Packet sent/received.
    Packet {
        direction: PacketDirection,
        kind: PacketKind,
        length: usize,
        data: Vec<u8>,
    },
    /// All operations completed successfully.
    Complete { bytes: u64, crc32: u32 },
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Transmit (Host -> Device)
    Rx, // Receive (Device -> Host)
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Vendor control request with its bRequest.
    Control(u8),
    Bulk,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketKind::Control(req) => write!(f, "Control(0x{:02X})", req),
            PacketKind::Bulk => write!(f, "Bulk"),
        }
    }
}

/// Observer trait for receiving engine events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ClonerObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ClonerEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ClonerObserver for NullObserver {
    fn on_event(&self, _event: &ClonerEvent) {}
}

/// Observer that keeps every event, mostly for tests.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ClonerEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ClonerEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ClonerObserver for RecordingObserver {
    fn on_event(&self, event: &ClonerEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ClonerObserver for TracingObserver {
    fn on_event(&self, event: &ClonerEvent) {
        match event {
            ClonerEvent::DeviceOpened { vid, pid } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), "Device opened");
            }
            ClonerEvent::DeviceClosed => {
                tracing::debug!("Device closed");
            }
            ClonerEvent::StageDetected {
                stage,
                variant,
                magic,
            } => {
                tracing::info!(stage = %stage, variant = %variant, magic = %magic, "Stage detected");
            }
            ClonerEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            ClonerEvent::Progress {
                phase,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(phase = %phase, progress = %format!("{}%", pct), "Progress");
            }
            ClonerEvent::Retry {
                address,
                attempt,
                max_retries,
                reason,
            } => {
                tracing::warn!(
                    address = %format!("0x{:08X}", address),
                    attempt,
                    max_retries,
                    "Retrying chunk: {}",
                    reason
                );
            }
            ClonerEvent::Error { kind, message } => {
                tracing::error!(kind = %kind, "Error: {}", message);
            }
            ClonerEvent::Packet {
                direction,
                kind,
                length,
                ..
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %kind,
                    len = length,
                    "USB Packet"
                );
            }
            ClonerEvent::Complete { bytes, crc32 } => {
                tracing::info!(bytes, crc32 = %format!("0x{:08X}", crc32), "Operation complete");
            }
        }
    }
}
