//! CRC32 used for image integrity.
//!
//! Reflected polynomial 0xEDB88320, initial value 0xFFFFFFFF, processed
//! LSB first, and *no* final XOR. In the CRC catalogue this is CRC-32/JAMCRC,
//! i.e. the bitwise complement of the usual zlib CRC-32.

use crc::{CRC_32_JAMCRC, Crc, Digest, NoTable};

static CRC32: Crc<u32, NoTable> = Crc::<u32, NoTable>::new(&CRC_32_JAMCRC);

/// CRC32 of `data`. The empty buffer hashes to `0xFFFF_FFFF`.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Incremental CRC32 over data that arrives in pieces.
pub struct Crc32 {
    digest: Digest<'static, u32, NoTable>,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Plain bit-at-a-time reference.
    fn reference(data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;
        for &b in data {
            crc ^= b as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
            }
        }
        crc
    }

    #[test]
    fn test_empty_buffer() {
        assert_eq!(crc32(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_check_value() {
        // zlib's CRC-32 of "123456789" is 0xCBF43926; no final XOR gives the complement.
        assert_eq!(crc32(b"123456789"), 0x340B_C6D9);
        assert_eq!(crc32(b"123456789"), !0xCBF4_3926u32);
    }

    #[test]
    fn test_matches_reference() {
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 31 + 7) as u8).collect();
        assert_eq!(crc32(&data), reference(&data));
        assert_eq!(crc32(&data[..1]), reference(&data[..1]));
    }

    #[test]
    fn test_deterministic() {
        let data = b"Ingenic T31 flash image";
        assert_eq!(crc32(data), crc32(data));
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let mut crc = Crc32::new();
        for piece in data.chunks(97) {
            crc.update(piece);
        }
        assert_eq!(crc.finalize(), crc32(&data));
    }
}
