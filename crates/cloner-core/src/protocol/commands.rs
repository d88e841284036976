//! Vendor control commands.
//!
//! Address and length are 32-bit values carried in the setup packet:
//! `wValue` holds the upper 16 bits and `wIndex` the lower 16 bits. None of
//! the OUT commands has a data stage.

use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, instrument};

use super::constants::*;
use super::handshake::{HandshakeCommand, HandshakeStatus};
use super::identify::CpuIdentification;
use crate::error::{ClonerError, Result};
use crate::transport::{Recipient, UsbTransport, VendorRequest};

/// Per-command timeouts and the settle delay that follows each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    /// Plain control requests (flush, status).
    pub control: Duration,
    /// Address/length requests.
    pub command: Duration,
    /// CPU info request.
    pub identify: Duration,
    pub settle: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_millis(CONTROL_TIMEOUT_MS),
            command: Duration::from_millis(COMMAND_TIMEOUT_MS),
            identify: Duration::from_millis(IDENTIFY_TIMEOUT_MS),
            settle: Duration::from_millis(COMMAND_SETTLE_MS),
        }
    }
}

impl CommandTimeouts {
    fn settle(&self) {
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }
    }
}

/// Split a 32-bit value into (`wValue`, `wIndex`).
pub fn split_u32(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, (value & 0xFFFF) as u16)
}

fn send_u32<T: UsbTransport + ?Sized>(
    transport: &mut T,
    request: u8,
    value: u32,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    let (hi, lo) = split_u32(value);
    transport.control_out(VendorRequest::device(request, hi, lo), &[], timeouts.command)?;
    timeouts.settle();
    Ok(())
}

/// Set the device-side target address for the next transfer.
#[instrument(level = "debug", skip_all, fields(address = %format!("0x{:08X}", address)))]
pub fn set_data_address<T: UsbTransport + ?Sized>(
    transport: &mut T,
    address: u32,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    send_u32(transport, VR_SET_DATA_ADDR, address, timeouts)?;
    debug!("Data address set");
    Ok(())
}

/// Set the byte count for the next transfer.
#[instrument(level = "debug", skip_all, fields(length = length))]
pub fn set_data_length<T: UsbTransport + ?Sized>(
    transport: &mut T,
    length: u32,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    send_u32(transport, VR_SET_DATA_LEN, length, timeouts)?;
    debug!("Data length set");
    Ok(())
}

/// Commit previously transferred data.
#[instrument(level = "debug", skip_all)]
pub fn flush_cache<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    transport.control_out(
        VendorRequest::device(VR_FLUSH_CACHE, 0, 0),
        &[],
        timeouts.control,
    )?;
    timeouts.settle();
    debug!("Cache flushed");
    Ok(())
}

/// Read the CPU identification.
///
/// Some bootroms only answer when the request is addressed to the
/// interface, so a failed device-recipient request is retried once that way.
#[instrument(level = "debug", skip_all)]
pub fn get_cpu_info<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<CpuIdentification> {
    let request = VendorRequest::device(VR_GET_CPU_INFO, 0, 0);
    let data = match transport.control_in(request, CPU_INFO_REQUEST_LEN, timeouts.identify) {
        Ok(data) => data,
        Err(e) => {
            debug!(error = %e, "CPU info failed, retrying with interface recipient");
            transport.control_in(
                request.to_recipient(Recipient::Interface),
                CPU_INFO_REQUEST_LEN,
                timeouts.identify,
            )?
        }
    };

    let id = CpuIdentification::from_response(&data)?;
    debug!(magic = %id.clean_magic, raw = %id.raw_hex(), "CPU info");
    Ok(id)
}

/// Read the firmware stage's 32-bit status word.
pub fn read_status<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<u32> {
    let data = transport.control_in(
        VendorRequest::device(VR_FW_READ_STATUS, 0, 0),
        STATUS_LEN,
        timeouts.control,
    )?;
    if data.len() < STATUS_LEN as usize {
        return Err(ClonerError::Protocol(format!(
            "status response too short: {} bytes",
            data.len()
        )));
    }
    Ok(LittleEndian::read_u32(&data))
}

/// Switch the firmware stage to the handshake transfer protocol.
#[instrument(level = "debug", skip_all)]
pub fn fw_handshake<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    transport.control_out(
        VendorRequest::device(VR_FW_HANDSHAKE, 0, 0),
        &[],
        timeouts.control,
    )?;
    timeouts.settle();
    debug!("Handshake protocol enabled");
    Ok(())
}

/// Send a chunk handshake as the data stage of its request.
#[instrument(level = "debug", skip_all, fields(request = %format!("0x{:02X}", command.request())))]
pub fn send_handshake<T: UsbTransport + ?Sized>(
    transport: &mut T,
    command: &HandshakeCommand,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    transport.control_out(
        VendorRequest::device(command.request(), 0, 0),
        command.as_bytes(),
        timeouts.command,
    )?;
    Ok(())
}

/// Read the 8-byte status that follows a chunk handshake.
pub fn read_handshake_status<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<HandshakeStatus> {
    let data = transport.control_in(
        VendorRequest::device(VR_FW_READ_STATUS, 0, 0),
        HANDSHAKE_STATUS_LEN,
        timeouts.control,
    )?;
    if data.len() < HANDSHAKE_STATUS_LEN as usize {
        debug!(len = data.len(), "Short handshake status");
    }
    Ok(HandshakeStatus::parse(&data))
}

/// Acknowledge a completed handshake read.
pub fn acknowledge_read<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<Vec<u8>> {
    Ok(transport.control_in(
        VendorRequest::device(VR_FW_READ, 0, 0),
        HANDSHAKE_STATUS_LEN,
        timeouts.control,
    )?)
}

/// Start a NAND read of the range set by address/length.
#[instrument(level = "debug", skip_all)]
pub fn nand_read<T: UsbTransport + ?Sized>(
    transport: &mut T,
    timeouts: &CommandTimeouts,
) -> Result<()> {
    transport.control_out(
        VendorRequest::device(VR_NAND_OPS, NAND_OPERATION_READ, 0),
        &[],
        timeouts.command,
    )?;
    Ok(())
}
