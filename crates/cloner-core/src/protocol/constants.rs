//! Protocol constants for the Ingenic USB boot/cloner protocol.

// ============================================================================
// Device Identification
// ============================================================================

/// Ingenic Semiconductor Vendor ID
pub const INGENIC_VENDOR_ID: u16 = 0x601A;
/// Vendor ID used by the X-series bootrom
pub const INGENIC_VENDOR_ID_ALT: u16 = 0xA108;

pub const SUPPORTED_VIDS: &[u16] = &[INGENIC_VENDOR_ID, INGENIC_VENDOR_ID_ALT];

/// T-series bootrom PID
pub const PID_BOOTROM_T: u16 = 0x4770;
/// X-series bootrom PID
pub const PID_BOOTROM_X: u16 = 0xC309;
/// Some T31 variants enumerate with PID equal to the VID
pub const PID_BOOTROM_LEGACY: u16 = 0x601A;

/// Firmware stage PIDs
pub const PID_FIRMWARE: u16 = 0x8887;
pub const PID_FIRMWARE_ALT: u16 = 0x601E;

pub const BOOTROM_PIDS: &[u16] = &[PID_BOOTROM_T, PID_BOOTROM_X, PID_BOOTROM_LEGACY];
pub const FIRMWARE_PIDS: &[u16] = &[PID_FIRMWARE, PID_FIRMWARE_ALT];

// ============================================================================
// Endpoints
// ============================================================================

pub const ENDPOINT_IN: u8 = 0x81;
pub const ENDPOINT_OUT: u8 = 0x01;

// ============================================================================
// Vendor Requests
// ============================================================================

/// Bootrom: read 8-byte CPU magic
pub const VR_GET_CPU_INFO: u8 = 0x00;
/// Bootrom + firmware: set target address (wValue = hi16, wIndex = lo16)
pub const VR_SET_DATA_ADDR: u8 = 0x01;
/// Bootrom + firmware: set transfer length (wValue = hi16, wIndex = lo16)
pub const VR_SET_DATA_LEN: u8 = 0x02;
pub const VR_FLUSH_CACHE: u8 = 0x03;
pub const VR_PROG_STAGE1: u8 = 0x04;
pub const VR_PROG_STAGE2: u8 = 0x05;

/// Firmware stage: NAND operation, subcommand in wValue
pub const VR_NAND_OPS: u8 = 0x07;
pub const NAND_OPERATION_READ: u16 = 0x05;

/// Firmware stage: acknowledge a handshake read
pub const VR_FW_READ: u8 = 0x10;
/// Firmware stage: enter the handshake transfer protocol
pub const VR_FW_HANDSHAKE: u8 = 0x11;
/// Firmware stage: 40-byte chunk handshake, even chunks and all reads
pub const VR_FW_WRITE1: u8 = 0x13;
/// Firmware stage: 40-byte chunk handshake, odd write chunks
pub const VR_FW_WRITE2: u8 = 0x14;
/// Firmware stage: 32-bit little-endian status word. Returns the 8-byte
/// handshake status when 8 bytes are requested.
pub const VR_FW_READ_STATUS: u8 = 0x19;

/// Bytes of CPU magic the device must return.
pub const CPU_MAGIC_LEN: usize = 8;
/// Bytes requested from VR_GET_CPU_INFO; newer bootroms append 8 extra.
pub const CPU_INFO_REQUEST_LEN: u16 = 16;
pub const STATUS_LEN: u16 = 4;
pub const HANDSHAKE_LEN: usize = 40;
pub const HANDSHAKE_STATUS_LEN: u16 = 8;

// ============================================================================
// Timeouts (milliseconds)
// ============================================================================

pub const CONTROL_TIMEOUT_MS: u64 = 5000;
/// Address/length/program commands can stall while the device erases.
pub const COMMAND_TIMEOUT_MS: u64 = 12_000;
pub const IDENTIFY_TIMEOUT_MS: u64 = 1200;
pub const BULK_TIMEOUT_BASE_MS: u64 = 5000;
/// Extra bulk timeout per 64 KiB moved.
pub const BULK_TIMEOUT_PER_64K_MS: u64 = 1000;
pub const BULK_TIMEOUT_MAX_MS: u64 = 60_000;
/// Device needs time to latch each command before the next.
pub const COMMAND_SETTLE_MS: u64 = 100;
/// Pause around each step of a handshake chunk.
pub const HANDSHAKE_DELAY_MS: u64 = 50;

// ============================================================================
// Sizes
// ============================================================================

pub const KIB: u32 = 1024;
pub const MIB: u32 = 1024 * KIB;

pub const READ_CHUNK_SIZE: u32 = MIB;
pub const WRITE_CHUNK_SIZE: u32 = 128 * KIB;
pub const DEFAULT_FLASH_SIZE: u32 = 16 * MIB;
pub const MAX_RETRIES: u32 = 3;

/// Flash write base used by the vendor tool.
pub const FLASH_WRITE_BASE: u32 = 0x0000_8010;

// ============================================================================
// Erase readiness
// ============================================================================

pub const ERASE_MIN_WAIT_MS: u64 = 5000;
pub const ERASE_MAX_WAIT_MS: u64 = 60_000;
pub const ERASE_POLL_INTERVAL_MS: u64 = 500;
/// Consecutive identical status reads that count as "settled".
pub const ERASE_STABLE_POLLS: u32 = 3;

/// Compacted CPU magic prefix reported by the firmware stage.
pub const FIRMWARE_MAGIC_PREFIX: &str = "boot";
