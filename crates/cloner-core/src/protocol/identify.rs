//! CPU identification and processor variant classification.
//!
//! The bootrom answers `VR_GET_CPU_INFO` with an 8-byte magic such as
//! `"T31V    "` or `"T 3 1 V "`; the firmware stage answers with a
//! `"BOOT...."` style string. [`normalize`] turns the raw bytes into a
//! compact printable form and [`classify`] maps that onto a
//! [`ProcessorVariant`].

use std::fmt;
use std::str::FromStr;

use super::constants::{CPU_MAGIC_LEN, FIRMWARE_MAGIC_PREFIX};
use crate::error::ClonerError;

/// Known Ingenic SoC variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorVariant {
    T20,
    T21,
    T23,
    T30,
    T31,
    T31X,
    T31ZX,
    T40,
    T41,
    X1000,
    X1600,
    X1700,
    X2000,
    X2100,
    X2600,
    Unknown,
}

/// Display token for every variant. X-series matching walks the same table.
const VARIANT_TOKENS: &[(ProcessorVariant, &str)] = &[
    (ProcessorVariant::T20, "t20"),
    (ProcessorVariant::T21, "t21"),
    (ProcessorVariant::T23, "t23"),
    (ProcessorVariant::T30, "t30"),
    (ProcessorVariant::T31, "t31"),
    (ProcessorVariant::T31X, "t31x"),
    (ProcessorVariant::T31ZX, "t31zx"),
    (ProcessorVariant::T40, "t40"),
    (ProcessorVariant::T41, "t41"),
    (ProcessorVariant::X1000, "x1000"),
    (ProcessorVariant::X1600, "x1600"),
    (ProcessorVariant::X1700, "x1700"),
    (ProcessorVariant::X2000, "x2000"),
    (ProcessorVariant::X2100, "x2100"),
    (ProcessorVariant::X2600, "x2600"),
    (ProcessorVariant::Unknown, "unknown"),
];

/// Three-character prefixes checked after the `t31v`/`t31` special cases.
const T_PREFIXES: &[(&str, ProcessorVariant)] = &[
    ("t20", ProcessorVariant::T20),
    ("t21", ProcessorVariant::T21),
    ("t23", ProcessorVariant::T23),
    ("t30", ProcessorVariant::T30),
    ("t40", ProcessorVariant::T40),
    ("t41", ProcessorVariant::T41),
];

/// Two-digit codes at the end of an 8-character magic.
const SUFFIX_CODES: &[(&str, ProcessorVariant)] = &[
    ("20", ProcessorVariant::T20),
    ("21", ProcessorVariant::T21),
    ("23", ProcessorVariant::T23),
    ("30", ProcessorVariant::T30),
    ("31", ProcessorVariant::T31),
    ("40", ProcessorVariant::T40),
    ("41", ProcessorVariant::T41),
];

impl ProcessorVariant {
    pub fn as_str(&self) -> &'static str {
        VARIANT_TOKENS
            .iter()
            .find(|(v, _)| v == self)
            .map(|(_, tok)| *tok)
            .unwrap_or("unknown")
    }

    pub fn is_x_series(&self) -> bool {
        self.as_str().starts_with('x')
    }

    fn x_series() -> impl Iterator<Item = &'static (ProcessorVariant, &'static str)> {
        VARIANT_TOKENS.iter().filter(|(v, _)| v.is_x_series())
    }
}

impl fmt::Display for ProcessorVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessorVariant {
    type Err = ClonerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        VARIANT_TOKENS
            .iter()
            .find(|(_, tok)| *tok == lower)
            .map(|(v, _)| *v)
            .ok_or_else(|| ClonerError::InvalidParameter(format!("unknown variant '{s}'")))
    }
}

/// Compact a raw identification string: printable ASCII only, spaces
/// removed, at most 8 characters.
pub fn normalize(raw: impl AsRef<[u8]>) -> String {
    raw.as_ref()
        .iter()
        .copied()
        .filter(|b| (0x21..=0x7E).contains(b))
        .take(CPU_MAGIC_LEN)
        .map(char::from)
        .collect()
}

/// Map a normalized identification string onto a processor variant.
///
/// Rules are applied in order, the first hit wins:
/// 1. an X-series token anywhere in the string;
/// 2. `t31zx` anywhere, or a trailing `zx` → T31ZX;
/// 3. prefix `t31v` → T31ZX, prefix `t31` → T31, other T-series prefixes;
/// 4. for exactly 8 characters, the last two digits as a T-series code;
/// 5. otherwise T31X, the most common part.
///
/// Matching ignores ASCII case.
pub fn classify(clean: &str) -> ProcessorVariant {
    let s = clean.to_ascii_lowercase();

    if let Some((variant, _)) = ProcessorVariant::x_series().find(|(_, tok)| s.contains(tok)) {
        return *variant;
    }

    if s.contains("t31zx") || s.ends_with("zx") {
        return ProcessorVariant::T31ZX;
    }

    if s.starts_with("t31v") {
        return ProcessorVariant::T31ZX;
    }
    if s.starts_with("t31") {
        return ProcessorVariant::T31;
    }
    if let Some((_, variant)) = T_PREFIXES.iter().find(|(p, _)| s.starts_with(p)) {
        return *variant;
    }

    if s.len() == CPU_MAGIC_LEN {
        // Bytes, not chars: the caller may pass any string.
        let suffix = &s.as_bytes()[CPU_MAGIC_LEN - 2..];
        if let Some((_, variant)) = SUFFIX_CODES
            .iter()
            .find(|(code, _)| code.as_bytes() == suffix)
        {
            return *variant;
        }
    }

    ProcessorVariant::T31X
}

/// Identification returned by `VR_GET_CPU_INFO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuIdentification {
    /// Bytes exactly as the device sent them.
    pub raw_magic: [u8; CPU_MAGIC_LEN],
    /// Trailing 8 bytes some bootroms append.
    pub extra: Option<[u8; CPU_MAGIC_LEN]>,
    pub clean_magic: String,
}

impl CpuIdentification {
    /// Parse a control-IN response. Fewer than 8 bytes is a protocol error.
    pub fn from_response(data: &[u8]) -> Result<Self, ClonerError> {
        if data.len() < CPU_MAGIC_LEN {
            return Err(ClonerError::Protocol(format!(
                "CPU info response too short: {} bytes, need {}",
                data.len(),
                CPU_MAGIC_LEN
            )));
        }

        let mut raw_magic = [0u8; CPU_MAGIC_LEN];
        raw_magic.copy_from_slice(&data[..CPU_MAGIC_LEN]);

        let extra = data.get(CPU_MAGIC_LEN..CPU_MAGIC_LEN * 2).map(|tail| {
            let mut extra = [0u8; CPU_MAGIC_LEN];
            extra.copy_from_slice(tail);
            extra
        });

        Ok(Self {
            raw_magic,
            extra,
            clean_magic: normalize(raw_magic),
        })
    }

    /// The firmware stage reports a `BOOT...` magic instead of a CPU name.
    pub fn is_firmware_stage(&self) -> bool {
        self.clean_magic
            .get(..FIRMWARE_MAGIC_PREFIX.len())
            .is_some_and(|p| p.eq_ignore_ascii_case(FIRMWARE_MAGIC_PREFIX))
    }

    pub fn variant(&self) -> ProcessorVariant {
        classify(&self.clean_magic)
    }

    /// Hex dump of the raw magic for diagnostics.
    pub fn raw_hex(&self) -> String {
        self.raw_magic
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
