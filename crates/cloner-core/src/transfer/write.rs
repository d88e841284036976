//! Flash writes.

use std::borrow::Cow;

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info, instrument, warn};

use super::Sequencer;
use super::erase::{ErasePolicy, wait_for_erase_ready};
use super::layout::{LengthSpec, Region, TransferSize, WriteLayout, WriteStep};
use super::retry::Deadline;
use crate::checksum::{Crc32, crc32};
use crate::device::DeviceHandle;
use crate::error::{ClonerError, Result};
use crate::events::ClonerPhase;
use crate::protocol::commands::{
    flush_cache, read_handshake_status, send_handshake, set_data_address, set_data_length,
};
use crate::protocol::{CommandTimeouts, HandshakeCommand};
use crate::transport::UsbTransport;

/// Options for [`Sequencer::write_block`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Send a flush after the data phase.
    pub flush_cache: bool,
    /// Append the payload's CRC32, little-endian.
    pub append_crc: bool,
    /// Wait for the erase started by the length command.
    pub erase_wait: bool,
    /// Announce each chunk with a handshake instead of ending the data
    /// with a zero-length packet.
    pub handshake: bool,
}

/// Running totals across one layout.
struct WriteProgress {
    sent: u64,
    total: u64,
    crc: Crc32,
}

impl Sequencer<'_> {
    /// Write `data` at `address` as a single region.
    ///
    /// A zero-length terminator is always sent after the data, even when
    /// `data` is empty.
    pub fn write_block<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        address: u32,
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<()> {
        let payload: Cow<[u8]> = if options.append_crc {
            let crc = crc32(data);
            let mut buf = Vec::with_capacity(data.len() + 4);
            buf.extend_from_slice(data);
            buf.write_u32::<LittleEndian>(crc)?;
            debug!(crc32 = %format!("0x{:08X}", crc), "Appended CRC trailer");
            Cow::Owned(buf)
        } else {
            Cow::Borrowed(data)
        };

        let layout = if options.handshake {
            WriteLayout::handshake(address, options.erase_wait, options.flush_cache)
        } else {
            WriteLayout::single(address, options.erase_wait, options.flush_cache)
        };
        self.write_layout(device, &layout, &[&payload])
    }

    /// Run every region of `layout`, in order, with one payload per region.
    ///
    /// Data-phase timeouts are retried per chunk; any other failure stops
    /// the sequence where it is. Nothing already written is rolled back.
    #[instrument(skip_all, fields(layout = %layout.name, regions = layout.regions.len()))]
    pub fn write_layout<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        layout: &WriteLayout,
        payloads: &[&[u8]],
    ) -> Result<()> {
        self.config.validate()?;
        device.require_firmware_stage()?;
        layout.check_payloads(payloads)?;

        device.begin_transfer()?;
        let mut progress = WriteProgress {
            sent: 0,
            total: payloads.iter().map(|p| p.len() as u64).sum(),
            crc: Crc32::new(),
        };
        let deadline = self.deadline();
        let result = layout
            .regions
            .iter()
            .zip(payloads)
            .try_for_each(|(region, payload)| {
                self.write_region(device, region, payload, &deadline, &mut progress)
            });
        device.end_transfer();

        match &result {
            Ok(()) => {
                let crc = progress.crc.finalize();
                info!(bytes = progress.sent, crc32 = %format!("0x{:08X}", crc), "Write complete");
                self.complete(progress.sent, crc);
            }
            Err(e) => self.failed(e),
        }
        result
    }

    fn write_region<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        region: &Region,
        payload: &[u8],
        deadline: &Deadline,
        progress: &mut WriteProgress,
    ) -> Result<()> {
        let timeouts = *device.timeouts();
        let chunk_size = self.config.write_chunk_size as usize;
        let mut offset = 0usize;
        let mut handshake_index = 0u32;

        info!(address = %format!("0x{:08X}", region.address), bytes = payload.len(), "Writing region");

        for step in &region.steps {
            deadline.check()?;
            match step {
                WriteStep::SetAddress => {
                    set_data_address(device.transport_mut(), region.address, &timeouts)?
                }
                WriteStep::SetLength(spec) => {
                    let length = match spec {
                        // check_payload already bounded the payload to u32.
                        LengthSpec::Payload => payload.len() as u32,
                        LengthSpec::Fixed(n) => *n,
                    };
                    set_data_length(device.transport_mut(), length, &timeouts)?
                }
                WriteStep::WaitErase => {
                    self.enter(ClonerPhase::EraseWait);
                    let outcome =
                        wait_for_erase_ready(device, &ErasePolicy::from_config(self.config));
                    debug!(?outcome, "Erase wait finished");
                }
                WriteStep::Transfer(size) => {
                    let end = transfer_end(*size, offset, payload.len());
                    self.enter(ClonerPhase::Writing);
                    for piece in payload[offset..end].chunks(chunk_size) {
                        let address = region.address.wrapping_add(offset as u32);
                        self.send_chunk(device, address, piece, deadline, progress)?;
                        offset += piece.len();
                        self.advance(progress, piece);
                    }
                }
                WriteStep::HandshakeTransfer(size) => {
                    let end = transfer_end(*size, offset, payload.len());
                    self.enter(ClonerPhase::Writing);
                    for piece in payload[offset..end].chunks(chunk_size) {
                        let address = region.address.wrapping_add(offset as u32);
                        // Offsets in the handshake are relative to the region.
                        let command =
                            HandshakeCommand::write(handshake_index, offset as u32, piece.len() as u32);
                        self.send_handshake_chunk(
                            device, &command, address, piece, &timeouts, deadline, progress,
                        )?;
                        handshake_index += 1;
                        offset += piece.len();
                        self.advance(progress, piece);
                    }
                }
                WriteStep::ZeroLength => {
                    let address = region.address.wrapping_add(offset as u32);
                    self.send_chunk(device, address, &[], deadline, progress)?;
                }
                WriteStep::FlushCache => {
                    self.enter(ClonerPhase::Flushing);
                    flush_cache(device.transport_mut(), &timeouts)?;
                }
            }
        }
        Ok(())
    }

    fn advance(&self, progress: &mut WriteProgress, piece: &[u8]) {
        progress.sent += piece.len() as u64;
        progress.crc.update(piece);
        self.progress(progress.sent, progress.total);
    }

    /// One bulk OUT, retried on timeout. A short write is a failure.
    fn send_chunk<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        address: u32,
        data: &[u8],
        deadline: &Deadline,
        progress: &WriteProgress,
    ) -> Result<()> {
        self.send_with_retry(device, address, data, deadline, progress, |_| Ok(()))
    }

    /// Handshake, bulk OUT, then the status read. A timed-out bulk OUT
    /// repeats the handshake too. A failed status is a CRC rejection.
    #[allow(clippy::too_many_arguments)]
    fn send_handshake_chunk<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        command: &HandshakeCommand,
        address: u32,
        data: &[u8],
        timeouts: &CommandTimeouts,
        deadline: &Deadline,
        progress: &WriteProgress,
    ) -> Result<()> {
        self.send_with_retry(device, address, data, deadline, progress, |device| {
            send_handshake(device.transport_mut(), command, timeouts)?;
            self.pause();
            Ok(())
        })?;
        self.pause();

        let status = read_handshake_status(device.transport_mut(), timeouts)?;
        if status.is_failure() {
            return Err(ClonerError::Protocol(format!(
                "device rejected chunk at 0x{:08X} (status 0x{:08X})",
                address,
                status.result()
            )));
        }
        debug!(result = %format!("0x{:08X}", status.result()), "Chunk accepted");
        Ok(())
    }

    /// Run `before` then a bulk OUT of `data`, repeating both while the
    /// bulk OUT fails with a retryable error. Errors from `before` are
    /// returned as they are.
    fn send_with_retry<T, F>(
        &self,
        device: &mut DeviceHandle<T>,
        address: u32,
        data: &[u8],
        deadline: &Deadline,
        progress: &WriteProgress,
        mut before: F,
    ) -> Result<()>
    where
        T: UsbTransport,
        F: FnMut(&mut DeviceHandle<T>) -> Result<()>,
    {
        let policy = self.retry_policy();
        let timeout = self.config.bulk_timeout(data.len());
        let mut retries = 0;

        loop {
            deadline.check()?;
            before(device)?;
            let err = match device.transport_mut().bulk_out(data, timeout) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => {
                    return Err(ClonerError::TransferFailed(format!(
                        "short write at 0x{:08X}: {}/{} bytes",
                        address,
                        n,
                        data.len()
                    )));
                }
                Err(e) => ClonerError::from(e),
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if !policy.allows(retries) {
                warn!(address = %format!("0x{:08X}", address), error = %err, "Giving up on chunk");
                return Err(ClonerError::TransferTimeout {
                    address,
                    completed: progress.sent,
                    total: progress.total,
                    attempts: retries + 1,
                });
            }
            retries += 1;
            self.retry(address, retries, err.to_string());
        }
    }
}

fn transfer_end(size: TransferSize, offset: usize, len: usize) -> usize {
    match size {
        TransferSize::Remaining => len,
        TransferSize::Bytes(n) => offset + n as usize,
    }
}
