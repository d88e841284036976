//! Declarative write layouts.
//!
//! A layout lists, per flash region, the exact command sequence the device
//! expects. One interpreter (`Sequencer::write_layout`) runs any layout, so
//! a newly captured sequence is new data rather than new code.
//!
//! Layouts can be written in TOML:
//!
//! ```toml
//! name = "spl"
//!
//! [[regions]]
//! address = 0x10008000
//! steps = ["set_address", { set_length = "payload" }, { transfer = "remaining" }, "zero_length"]
//! ```
//!
//! `handshake_transfer` takes the same sizes as `transfer`.

use std::path::Path;

use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};

use crate::error::{ClonerError, Result};

/// Value sent with a `SetLength` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthSpec {
    /// Size of the region's payload.
    Payload,
    Fixed(u32),
}

/// Amount of payload a `Transfer` step consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferSize {
    /// Everything not yet sent.
    Remaining,
    Bytes(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStep {
    SetAddress,
    SetLength(LengthSpec),
    /// Wait for the erase triggered by `SetLength`.
    WaitErase,
    /// Bulk OUT of the next payload bytes, split by the write chunk size.
    Transfer(TransferSize),
    /// Like `Transfer`, but every chunk is announced with a 40-byte
    /// handshake and confirmed by a status read. Needs no terminator.
    HandshakeTransfer(TransferSize),
    /// Zero-length bulk OUT; terminates a data phase.
    ZeroLength,
    FlushCache,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub address: u32,
    pub steps: Vec<WriteStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteLayout {
    pub name: String,
    pub regions: Vec<Region>,
}

impl Region {
    pub fn new(address: u32, steps: Vec<WriteStep>) -> Self {
        Self { address, steps }
    }

    /// Check step ordering: the address comes first, and a length (when
    /// the region sets one) is in place before any data moves.
    pub fn validate(&self) -> Result<()> {
        let mut address_set = false;
        let mut length_set = false;
        let mut data_sent = false;
        let mut remaining_seen = false;

        for (i, step) in self.steps.iter().enumerate() {
            let fail = |msg: &str| {
                Err(ClonerError::InvalidParameter(format!(
                    "region 0x{:08X} step {} ({:?}): {}",
                    self.address, i, step, msg
                )))
            };
            match step {
                WriteStep::SetAddress => address_set = true,
                WriteStep::SetLength(_) => {
                    if !address_set {
                        return fail("length set before address");
                    }
                    if !length_set && data_sent {
                        return fail("first length set after data transfer");
                    }
                    length_set = true;
                }
                WriteStep::Transfer(size) | WriteStep::HandshakeTransfer(size) => {
                    if !address_set {
                        return fail("transfer before address");
                    }
                    if remaining_seen {
                        return fail("transfer after a 'remaining' transfer");
                    }
                    remaining_seen = *size == TransferSize::Remaining;
                    data_sent = true;
                }
                WriteStep::ZeroLength => {
                    if !address_set {
                        return fail("transfer before address");
                    }
                    data_sent = true;
                }
                WriteStep::WaitErase | WriteStep::FlushCache => {}
            }
        }
        Ok(())
    }

    /// Check that the transfers consume exactly `len` payload bytes.
    pub fn check_payload(&self, len: usize) -> Result<()> {
        if u32::try_from(len).is_err() {
            return Err(ClonerError::InvalidParameter(format!(
                "payload of {} bytes exceeds 32-bit length",
                len
            )));
        }

        let mut fixed: u64 = 0;
        let mut has_remaining = false;
        for step in &self.steps {
            match step {
                WriteStep::Transfer(size) | WriteStep::HandshakeTransfer(size) => match size {
                    TransferSize::Bytes(n) => fixed += *n as u64,
                    TransferSize::Remaining => has_remaining = true,
                },
                _ => {}
            }
        }

        let fits = if has_remaining {
            fixed <= len as u64
        } else {
            fixed == len as u64
        };
        if !fits {
            return Err(ClonerError::InvalidParameter(format!(
                "region 0x{:08X} transfers {} fixed bytes{}, payload has {}",
                self.address,
                fixed,
                if has_remaining { " plus remainder" } else { "" },
                len
            )));
        }
        Ok(())
    }
}

impl WriteLayout {
    /// The usual single-region sequence: address, length, data, terminator.
    pub fn single(address: u32, erase_wait: bool, flush_cache: bool) -> Self {
        let mut steps = vec![
            WriteStep::SetAddress,
            WriteStep::SetLength(LengthSpec::Payload),
        ];
        if erase_wait {
            steps.push(WriteStep::WaitErase);
        }
        steps.push(WriteStep::Transfer(TransferSize::Remaining));
        steps.push(WriteStep::ZeroLength);
        if flush_cache {
            steps.push(WriteStep::FlushCache);
        }
        Self {
            name: format!("block@0x{:08X}", address),
            regions: vec![Region::new(address, steps)],
        }
    }

    /// Single region using per-chunk handshakes: address, length, data,
    /// then an optional flush. No terminator.
    pub fn handshake(address: u32, erase_wait: bool, flush_cache: bool) -> Self {
        let mut steps = vec![
            WriteStep::SetAddress,
            WriteStep::SetLength(LengthSpec::Payload),
        ];
        if erase_wait {
            steps.push(WriteStep::WaitErase);
        }
        steps.push(WriteStep::HandshakeTransfer(TransferSize::Remaining));
        if flush_cache {
            steps.push(WriteStep::FlushCache);
        }
        Self {
            name: format!("handshake@0x{:08X}", address),
            regions: vec![Region::new(address, steps)],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(ClonerError::InvalidParameter(format!(
                "layout '{}' has no regions",
                self.name
            )));
        }
        self.regions.iter().try_for_each(Region::validate)
    }

    /// Validate the layout against one payload per region.
    pub fn check_payloads(&self, payloads: &[&[u8]]) -> Result<()> {
        self.validate()?;
        if payloads.len() != self.regions.len() {
            return Err(ClonerError::InvalidParameter(format!(
                "layout '{}' has {} regions, got {} payloads",
                self.name,
                self.regions.len(),
                payloads.len()
            )));
        }
        self.regions
            .iter()
            .zip(payloads)
            .try_for_each(|(region, payload)| region.check_payload(payload.len()))
    }

    /// Load a layout from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AnyResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let layout: WriteLayout = toml::from_str(&content)?;
        layout.validate()?;
        Ok(layout)
    }
}

/// Layouts recorded from the vendor cloner.
pub mod layouts {
    use super::*;

    /// T31 flash write as captured from the vendor tool: a 48-byte
    /// partition marker, 324 bytes of metadata, a 10092-byte descriptor
    /// (with its length set again after the data) and finally the image
    /// itself at the flash write base, followed by a cache flush.
    pub fn vendor_t31_capture() -> WriteLayout {
        use LengthSpec::Payload;
        use TransferSize::{Bytes, Remaining};
        use WriteStep::*;

        WriteLayout {
            name: "vendor-t31-capture".into(),
            regions: vec![
                // No length command in this phase.
                Region::new(
                    0x0002_0100,
                    vec![
                        SetAddress,
                        Transfer(Bytes(12)),
                        Transfer(Bytes(12)),
                        ZeroLength,
                        ZeroLength,
                        Transfer(Bytes(12)),
                        ZeroLength,
                        Transfer(Bytes(12)),
                        ZeroLength,
                    ],
                ),
                Region::new(
                    0x1000_8000,
                    vec![
                        SetAddress,
                        SetLength(Payload),
                        Transfer(Bytes(324)),
                        ZeroLength,
                    ],
                ),
                Region::new(
                    0x1800_8000,
                    vec![
                        SetAddress,
                        SetLength(Payload),
                        Transfer(Bytes(10092)),
                        ZeroLength,
                        SetLength(Payload),
                    ],
                ),
                Region::new(
                    0x0000_8010,
                    vec![
                        SetAddress,
                        SetLength(Payload),
                        Transfer(Remaining),
                        ZeroLength,
                        FlushCache,
                    ],
                ),
            ],
        }
    }
}
