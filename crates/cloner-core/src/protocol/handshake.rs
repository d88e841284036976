//! 40-byte chunk handshake used by the firmware stage.
//!
//! Instead of address/length requests, each chunk is announced with a
//! 40-byte block sent as the data stage of `VR_FW_WRITE1`/`VR_FW_WRITE2`.
//! The device answers with an 8-byte status read through
//! `VR_FW_READ_STATUS`.
//!
//! Read layout:
//!
//! | bytes  | content                 |
//! |--------|-------------------------|
//! | 8..12  | flash offset, LE        |
//! | 16..20 | chunk size, LE          |
//! | 24..28 | `00 00 06 00`           |
//! | 28..32 | `af 7f 00 00`           |
//!
//! Write layout:
//!
//! | bytes  | content                 |
//! |--------|-------------------------|
//! | 0..4   | offset in the image, LE |
//! | 20..24 | chunk size, LE          |
//! | 32..38 | `06 00 05 7f 00 00`     |
//! | 38..40 | chunk index, LE         |

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{HANDSHAKE_LEN, VR_FW_WRITE1, VR_FW_WRITE2};

const READ_MARKER: [u8; 8] = [0x00, 0x00, 0x06, 0x00, 0xAF, 0x7F, 0x00, 0x00];
const WRITE_MARKER: [u8; 6] = [0x06, 0x00, 0x05, 0x7F, 0x00, 0x00];

/// Result half-word the device uses to flag a failed chunk.
const RESULT_FAILED: u16 = 0xFFFF;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HandshakeCommand {
    request: u8,
    bytes: [u8; HANDSHAKE_LEN],
}

impl HandshakeCommand {
    /// Announce a read of `size` bytes at flash `offset`.
    pub fn read(offset: u32, size: u32) -> Self {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        LittleEndian::write_u32(&mut bytes[8..12], offset);
        LittleEndian::write_u32(&mut bytes[16..20], size);
        bytes[24..32].copy_from_slice(&READ_MARKER);
        Self {
            request: VR_FW_WRITE1,
            bytes,
        }
    }

    /// Announce write chunk `index`, `size` bytes at `offset` into the image.
    /// Even and odd chunks use different request codes.
    pub fn write(index: u32, offset: u32, size: u32) -> Self {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        LittleEndian::write_u32(&mut bytes[0..4], offset);
        LittleEndian::write_u32(&mut bytes[20..24], size);
        bytes[32..38].copy_from_slice(&WRITE_MARKER);
        // Only the low 16 bits of the index go on the wire.
        LittleEndian::write_u16(&mut bytes[38..40], index as u16);
        let request = if index % 2 == 0 {
            VR_FW_WRITE1
        } else {
            VR_FW_WRITE2
        };
        Self { request, bytes }
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for HandshakeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeCommand")
            .field("request", &format_args!("0x{:02X}", self.request))
            .field("bytes", &format_args!("{:02x?}", self.bytes))
            .finish()
    }
}

/// Status block returned after a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeStatus {
    pub result_low: u16,
    pub result_high: u16,
    pub reserved: u16,
    pub status: u16,
}

impl HandshakeStatus {
    /// Decode four LE half-words. Missing trailing bytes read as zero.
    pub fn parse(data: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        let n = data.len().min(raw.len());
        raw[..n].copy_from_slice(&data[..n]);
        Self {
            result_low: LittleEndian::read_u16(&raw[0..2]),
            result_high: LittleEndian::read_u16(&raw[2..4]),
            reserved: LittleEndian::read_u16(&raw[4..6]),
            status: LittleEndian::read_u16(&raw[6..8]),
        }
    }

    pub fn result(&self) -> u32 {
        ((self.result_high as u32) << 16) | self.result_low as u32
    }

    /// Either result half is `0xFFFF`. After a write this means the device
    /// rejected the chunk's CRC.
    pub fn is_failure(&self) -> bool {
        self.result_low == RESULT_FAILED || self.result_high == RESULT_FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_command_layout() {
        let cmd = HandshakeCommand::read(0x0010_0000, 0x0002_0000);
        let b = cmd.as_bytes();
        assert_eq!(b.len(), 40);
        assert_eq!(cmd.request(), VR_FW_WRITE1);
        assert_eq!(&b[0..8], &[0; 8]);
        assert_eq!(&b[8..12], &[0x00, 0x00, 0x10, 0x00]);
        assert_eq!(&b[16..20], &[0x00, 0x00, 0x02, 0x00]);
        assert_eq!(&b[24..32], &[0x00, 0x00, 0x06, 0x00, 0xAF, 0x7F, 0x00, 0x00]);
        assert_eq!(&b[32..40], &[0; 8]);
    }

    #[test]
    fn test_write_command_layout() {
        let cmd = HandshakeCommand::write(3, 0x0006_0000, 0x0002_0000);
        let b = cmd.as_bytes();
        assert_eq!(cmd.request(), VR_FW_WRITE2);
        assert_eq!(&b[0..4], &[0x00, 0x00, 0x06, 0x00]);
        assert_eq!(&b[4..20], &[0; 16]);
        assert_eq!(&b[20..24], &[0x00, 0x00, 0x02, 0x00]);
        assert_eq!(&b[32..40], &[0x06, 0x00, 0x05, 0x7F, 0x00, 0x00, 0x03, 0x00]);

        assert_eq!(HandshakeCommand::write(0, 0, 1).request(), VR_FW_WRITE1);
        assert_eq!(HandshakeCommand::write(0x1_0102, 0, 1).as_bytes()[38..40], [0x02, 0x01]);
    }

    #[test]
    fn test_status_parse() {
        let status = HandshakeStatus::parse(&[0x34, 0x12, 0x78, 0x56, 0, 0, 0x01, 0x00]);
        assert_eq!(status.result(), 0x5678_1234);
        assert_eq!(status.status, 1);
        assert!(!status.is_failure());

        assert!(HandshakeStatus::parse(&[0xFF, 0xFF, 0, 0]).is_failure());
        assert!(HandshakeStatus::parse(&[0, 0, 0xFF, 0xFF, 0, 0, 0, 0]).is_failure());
        assert_eq!(HandshakeStatus::parse(&[]), HandshakeStatus::default());
    }
}
