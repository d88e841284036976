//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for vendor control requests and bulk
//! transfers, allowing different implementations (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("USB initialization failed: {0}")]
    InitFailed(String),

    #[error("Device not found: bus={bus} address={address}")]
    DeviceNotFound { bus: u8, address: u8 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, address=0x{address:02X}")]
    EndpointNotFound { ep_type: String, address: u8 },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Endpoint stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Transport already closed")]
    Closed,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl TransportError {
    pub fn timeout(timeout: Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

/// Control request recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Device => write!(f, "device"),
            Recipient::Interface => write!(f, "interface"),
        }
    }
}

/// Vendor control request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorRequest {
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl VendorRequest {
    pub fn device(request: u8, value: u16, index: u16) -> Self {
        Self {
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }

    pub fn to_recipient(self, recipient: Recipient) -> Self {
        Self { recipient, ..self }
    }
}

/// Abstract USB transport interface.
///
/// Every call blocks until it completes or its timeout elapses. Methods
/// take `&mut self`: a transport is driven by exactly one caller.
pub trait UsbTransport: Send {
    /// Vendor control request with a device-to-host data stage.
    fn control_in(
        &mut self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Vendor control request with an optional host-to-device data stage.
    fn control_out(
        &mut self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Read up to `len` bytes from the bulk IN endpoint.
    fn bulk_in(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Write `data` to the bulk OUT endpoint, returning the bytes accepted.
    /// An empty slice sends a zero-length packet.
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;

    /// Release the interface. Further calls fail with `Closed`.
    fn close(&mut self);
}
