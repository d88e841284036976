//! Transaction sequencer.
//!
//! Turns high-level reads and writes into ordered command/bulk sequences:
//! address, then length, then data, with bounded retries on data-phase
//! timeouts. Every operation requires a firmware-stage device.

pub mod erase;
pub mod layout;
pub mod plan;
pub mod read;
pub mod retry;
pub mod write;

use std::cell::Cell;
use std::thread;

use crate::config::EngineConfig;
use crate::error::ClonerError;
use crate::events::{ClonerEvent, ClonerObserver, ClonerPhase};

pub use erase::{EraseOutcome, ErasePolicy};
pub use layout::{LengthSpec, Region, TransferSize, WriteLayout, WriteStep, layouts};
pub use plan::{Chunk, TransferPlan};
pub use read::FirmwareBuffer;
pub use retry::{Deadline, RetryPolicy};
pub use write::WriteOptions;

/// Runs read and write operations against a [`DeviceHandle`](crate::device::DeviceHandle).
pub struct Sequencer<'a> {
    config: &'a EngineConfig,
    observer: &'a dyn ClonerObserver,
    phase: Cell<ClonerPhase>,
}

impl<'a> Sequencer<'a> {
    pub fn new(config: &'a EngineConfig, observer: &'a dyn ClonerObserver) -> Self {
        Self {
            config,
            observer,
            phase: Cell::new(ClonerPhase::Identify),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries)
    }

    fn deadline(&self) -> Deadline {
        Deadline::new(self.config.operation_timeout())
    }

    /// Handshake steps need the device to catch up between requests.
    fn pause(&self) {
        let delay = self.config.handshake_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    fn enter(&self, to: ClonerPhase) {
        let from = self.phase.replace(to);
        if from != to {
            self.observer.on_event(&ClonerEvent::PhaseChanged { from, to });
        }
    }

    fn progress(&self, current: u64, total: u64) {
        self.observer.on_event(&ClonerEvent::Progress {
            phase: self.phase.get(),
            current,
            total,
        });
    }

    fn retry(&self, address: u32, attempt: u32, reason: String) {
        self.observer.on_event(&ClonerEvent::Retry {
            address,
            attempt,
            max_retries: self.config.max_retries,
            reason,
        });
    }

    fn complete(&self, bytes: u64, crc32: u32) {
        self.enter(ClonerPhase::Complete);
        self.observer
            .on_event(&ClonerEvent::Complete { bytes, crc32 });
    }

    fn failed(&self, err: &ClonerError) {
        self.enter(ClonerPhase::Error);
        self.observer.on_event(&ClonerEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}
