//! Chunk planning for addressed transfers.

use crate::error::{ClonerError, Result};

/// One addressed transfer, split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub flash_address: u32,
    pub length: u32,
    pub chunk_size: u32,
}

/// A single chunk of a [`TransferPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub address: u32,
    /// Offset from the start of the plan.
    pub offset: u32,
    pub len: u32,
}

impl TransferPlan {
    pub fn new(flash_address: u32, length: u32, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ClonerError::InvalidParameter(
                "chunk size must be non-zero".into(),
            ));
        }
        if flash_address as u64 + length as u64 > 1u64 << 32 {
            return Err(ClonerError::InvalidParameter(format!(
                "range 0x{:08X}+0x{:X} exceeds the 32-bit address space",
                flash_address, length
            )));
        }
        Ok(Self {
            flash_address,
            length,
            chunk_size,
        })
    }

    pub fn chunk_count(&self) -> u32 {
        self.length.div_ceil(self.chunk_size)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.chunk_count()).map(move |index| {
            let offset = index * self.chunk_size;
            Chunk {
                index,
                address: self.flash_address + offset,
                offset,
                len: self.chunk_size.min(self.length - offset),
            }
        })
    }
}
