//! Engine configuration.
//!
//! Defaults reproduce the timings the vendor cloner uses. Everything can be
//! overridden from a TOML file:
//!
//! ```toml
//! max_retries = 5
//! read_chunk_size = 524288
//! operation_timeout_secs = 900
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ClonerError;
use crate::protocol::CommandTimeouts;
use crate::protocol::constants::*;

/// How each read chunk is requested from the firmware stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadProtocol {
    /// Address and length requests, then bulk IN.
    #[default]
    Addressed,
    /// Address and length, a NAND read command, then bulk IN.
    NandOps,
    /// 40-byte handshake, status, bulk IN, acknowledge.
    Handshake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub control_timeout_ms: u64,
    /// Address/length commands.
    pub command_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    /// Delay after every control command.
    pub settle_ms: u64,

    /// Bulk timeout = base + per_64k * (size / 64 KiB), capped at max.
    pub bulk_timeout_base_ms: u64,
    pub bulk_timeout_per_64k_ms: u64,
    pub bulk_timeout_max_ms: u64,

    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    pub read_chunk_size: u32,
    pub write_chunk_size: u32,
    pub read_protocol: ReadProtocol,
    /// Pause between the steps of a handshake chunk.
    pub handshake_delay_ms: u64,

    /// Flash address a full read starts at.
    pub base_address: u32,
    pub flash_size: u32,
    /// Default target for image writes.
    pub write_address: u32,

    pub erase_min_wait_ms: u64,
    pub erase_max_wait_ms: u64,
    pub erase_poll_interval_ms: u64,
    pub erase_stable_polls: u32,

    /// Overall limit for one read or write; unlimited when absent.
    pub operation_timeout_secs: Option<u64>,

    /// How long `wait_for_device` polls.
    pub device_wait_secs: u64,
    pub device_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: CONTROL_TIMEOUT_MS,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            identify_timeout_ms: IDENTIFY_TIMEOUT_MS,
            settle_ms: COMMAND_SETTLE_MS,
            bulk_timeout_base_ms: BULK_TIMEOUT_BASE_MS,
            bulk_timeout_per_64k_ms: BULK_TIMEOUT_PER_64K_MS,
            bulk_timeout_max_ms: BULK_TIMEOUT_MAX_MS,
            max_retries: MAX_RETRIES,
            read_chunk_size: READ_CHUNK_SIZE,
            write_chunk_size: WRITE_CHUNK_SIZE,
            read_protocol: ReadProtocol::Addressed,
            handshake_delay_ms: HANDSHAKE_DELAY_MS,
            base_address: 0,
            flash_size: DEFAULT_FLASH_SIZE,
            write_address: FLASH_WRITE_BASE,
            erase_min_wait_ms: ERASE_MIN_WAIT_MS,
            erase_max_wait_ms: ERASE_MAX_WAIT_MS,
            erase_poll_interval_ms: ERASE_POLL_INTERVAL_MS,
            erase_stable_polls: ERASE_STABLE_POLLS,
            operation_timeout_secs: None,
            device_wait_secs: 60,
            device_poll_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ClonerError> {
        if self.read_chunk_size == 0 || self.write_chunk_size == 0 {
            return Err(ClonerError::InvalidParameter(
                "chunk sizes must be non-zero".into(),
            ));
        }
        if self.erase_poll_interval_ms == 0 {
            return Err(ClonerError::InvalidParameter(
                "erase_poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.base_address as u64 + self.flash_size as u64 > 1u64 << 32 {
            return Err(ClonerError::InvalidParameter(
                "base_address + flash_size exceeds the 32-bit address space".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeouts(&self) -> CommandTimeouts {
        CommandTimeouts {
            control: Duration::from_millis(self.control_timeout_ms),
            command: Duration::from_millis(self.command_timeout_ms),
            identify: Duration::from_millis(self.identify_timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    /// Timeout for a bulk transfer of `size` bytes.
    pub fn bulk_timeout(&self, size: usize) -> Duration {
        let extra = (size as u64 / 65536).saturating_mul(self.bulk_timeout_per_64k_ms);
        let ms = self
            .bulk_timeout_base_ms
            .saturating_add(extra)
            .min(self.bulk_timeout_max_ms);
        Duration::from_millis(ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_delay(&self) -> Duration {
        Duration::from_millis(self.handshake_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_timeout_scales_and_caps() {
        let config = EngineConfig::default();
        assert_eq!(config.bulk_timeout(0), Duration::from_millis(5000));
        assert_eq!(config.bulk_timeout(65535), Duration::from_millis(5000));
        assert_eq!(config.bulk_timeout(128 * 1024), Duration::from_millis(7000));
        assert_eq!(config.bulk_timeout(1024 * 1024), Duration::from_millis(21_000));
        assert_eq!(
            config.bulk_timeout(16 * 1024 * 1024),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("max_retries = 7\nsettle_ms = 0\n").unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.settle_ms, 0);
        assert_eq!(config.read_chunk_size, READ_CHUNK_SIZE);
        assert_eq!(config.write_address, 0x8010);
    }

    #[test]
    fn test_validate_rejects_zero_chunk() {
        let config = EngineConfig {
            write_chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let config = EngineConfig {
            erase_poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_protocol_from_toml() {
        let config: EngineConfig = toml::from_str("read_protocol = \"nand_ops\"\n").unwrap();
        assert_eq!(config.read_protocol, ReadProtocol::NandOps);
        assert_eq!(EngineConfig::default().read_protocol, ReadProtocol::Addressed);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("cloner-config-{}.toml", std::process::id()));
        let config = EngineConfig {
            operation_timeout_secs: Some(120),
            flash_size: 8 * MIB,
            read_protocol: ReadProtocol::Handshake,
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = EngineConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
