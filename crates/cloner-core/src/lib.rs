//! Cloner-Core: USB flash read/write engine for Ingenic SoCs.
//!
//! Talks to a device that has been bootstrapped into its firmware stage and
//! moves flash contents over vendor control requests and bulk transfers.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: USB abstraction (nusb, mock, observable wrapper)
//! - **Protocol**: Request codes, vendor commands, CPU identification
//! - **Device**: Open handle with stage tracking
//! - **Transfer**: Chunked reads, layout-driven writes, retries, erase wait
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use cloner_core::{ClonerSession, EngineConfig};
//!
//! let session = ClonerSession::new(EngineConfig::default());
//! let device = session.open(None).expect("no device");
//! let firmware = session.read_to_file(device, "flash.bin").expect("read failed");
//! println!("CRC32 0x{:08X}", firmware.crc32());
//! ```

pub mod checksum;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use checksum::{Crc32, crc32};
pub use config::{EngineConfig, ReadProtocol};
pub use device::{DeviceHandle, DeviceInfo, DeviceStage, SessionState};
pub use error::{ClonerError, ErrorKind, Result};
pub use events::{ClonerEvent, ClonerObserver, ClonerPhase, NullObserver, TracingObserver};
pub use protocol::{CpuIdentification, ProcessorVariant};
pub use session::ClonerSession;
pub use transfer::{FirmwareBuffer, Sequencer, WriteLayout, WriteOptions, layouts};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
