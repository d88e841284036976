//! Flash reads.

use std::path::Path;

use tracing::{debug, info, instrument, warn};

use super::Sequencer;
use super::plan::{Chunk, TransferPlan};
use super::retry::Deadline;
use crate::checksum::crc32;
use crate::config::ReadProtocol;
use crate::device::DeviceHandle;
use crate::error::{ClonerError, Result};
use crate::events::ClonerPhase;
use crate::protocol::commands::{
    acknowledge_read, nand_read, read_handshake_status, send_handshake, set_data_address,
    set_data_length,
};
use crate::protocol::{CommandTimeouts, HandshakeCommand};
use crate::transport::UsbTransport;

/// Bytes read from the device and where they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareBuffer {
    data: Vec<u8>,
    base_address: u32,
}

impl FirmwareBuffer {
    pub fn new(data: Vec<u8>, base_address: u32) -> Self {
        Self { data, base_address }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub fn crc32(&self) -> u32 {
        crc32(&self.data)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, &self.data)?;
        Ok(())
    }
}

impl Sequencer<'_> {
    /// Read the whole flash as configured by `base_address`/`flash_size`.
    pub fn read_firmware<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
    ) -> Result<FirmwareBuffer> {
        self.read_region(device, self.config.base_address, self.config.flash_size)
    }

    /// Read `length` bytes starting at `address`.
    #[instrument(skip_all, fields(address = %format!("0x{:08X}", address), length = length))]
    pub fn read_region<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        address: u32,
        length: u32,
    ) -> Result<FirmwareBuffer> {
        self.config.validate()?;
        device.begin_transfer()?;
        let result = self.read_plan(device, address, length);
        device.end_transfer();

        match &result {
            Ok(buffer) => {
                let crc = buffer.crc32();
                info!(bytes = buffer.len(), crc32 = %format!("0x{:08X}", crc), "Read complete");
                self.complete(buffer.len() as u64, crc);
            }
            Err(e) => self.failed(e),
        }
        result
    }

    fn read_plan<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        address: u32,
        length: u32,
    ) -> Result<FirmwareBuffer> {
        let plan = TransferPlan::new(address, length, self.config.read_chunk_size)?;
        let deadline = self.deadline();

        let mut data = Vec::new();
        data.try_reserve_exact(length as usize)
            .map_err(|_| ClonerError::MemoryAllocation(length as usize))?;

        self.enter(ClonerPhase::Reading);
        info!(chunks = plan.chunk_count(), "Reading flash");

        for chunk in plan.chunks() {
            let bytes = self.read_chunk(device, &chunk, &deadline, length as u64)?;
            data.extend_from_slice(&bytes);
            self.progress(data.len() as u64, length as u64);
        }

        Ok(FirmwareBuffer::new(data, address))
    }

    /// One chunk: request it, then bulk IN. Timeouts and short reads on the
    /// bulk IN retry the whole chunk, request included.
    fn read_chunk<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        chunk: &Chunk,
        deadline: &Deadline,
        total: u64,
    ) -> Result<Vec<u8>> {
        let policy = self.retry_policy();
        let timeouts = *device.timeouts();
        let len = chunk.len as usize;
        let bulk_timeout = self.config.bulk_timeout(len);
        let mut retries = 0;

        loop {
            deadline.check()?;
            self.request_chunk(device, chunk, &timeouts)?;

            let reason = match device.transport_mut().bulk_in(len, bulk_timeout) {
                Ok(mut bytes) if bytes.len() >= len => {
                    if bytes.len() > len {
                        debug!(
                            received = bytes.len(),
                            requested = len,
                            "Discarding excess bulk data"
                        );
                        bytes.truncate(len);
                    }
                    self.acknowledge_chunk(device, &timeouts);
                    return Ok(bytes);
                }
                Ok(bytes) => format!("short read {}/{} bytes", bytes.len(), len),
                Err(e) => {
                    let err = ClonerError::from(e);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    err.to_string()
                }
            };

            if !policy.allows(retries) {
                warn!(address = %format!("0x{:08X}", chunk.address), %reason, "Giving up on chunk");
                return Err(ClonerError::TransferTimeout {
                    address: chunk.address,
                    completed: chunk.offset as u64,
                    total,
                    attempts: retries + 1,
                });
            }

            retries += 1;
            self.retry(chunk.address, retries, reason);
        }
    }

    /// Control requests that precede the bulk IN of a chunk.
    fn request_chunk<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        chunk: &Chunk,
        timeouts: &CommandTimeouts,
    ) -> Result<()> {
        match self.config.read_protocol {
            ReadProtocol::Addressed => {
                set_data_address(device.transport_mut(), chunk.address, timeouts)?;
                set_data_length(device.transport_mut(), chunk.len, timeouts)?;
            }
            ReadProtocol::NandOps => {
                set_data_address(device.transport_mut(), chunk.address, timeouts)?;
                set_data_length(device.transport_mut(), chunk.len, timeouts)?;
                nand_read(device.transport_mut(), timeouts)?;
                self.pause();
            }
            ReadProtocol::Handshake => {
                let command = HandshakeCommand::read(chunk.address, chunk.len);
                send_handshake(device.transport_mut(), &command, timeouts)?;
                self.pause();
                let status = read_handshake_status(device.transport_mut(), timeouts)?;
                if status.is_failure() {
                    // Seen on healthy reads too; only writes treat it as fatal.
                    debug!(result = %format!("0x{:08X}", status.result()), "Handshake status flagged");
                }
                self.pause();
            }
        }
        Ok(())
    }

    /// Handshake reads end with an acknowledge. The data is already in
    /// hand, so a failure here is only logged.
    fn acknowledge_chunk<T: UsbTransport>(
        &self,
        device: &mut DeviceHandle<T>,
        timeouts: &CommandTimeouts,
    ) {
        if self.config.read_protocol == ReadProtocol::Handshake {
            if let Err(e) = acknowledge_read(device.transport_mut(), timeouts) {
                warn!(error = %e, "Read acknowledge failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::ErrorKind;
    use crate::events::{ClonerEvent, NullObserver, RecordingObserver};
    use crate::protocol::constants::{
        VR_FW_READ, VR_FW_READ_STATUS, VR_FW_WRITE1, VR_NAND_OPS, VR_SET_DATA_ADDR,
        VR_SET_DATA_LEN,
    };
    use crate::transport::{MockFault, MockOp, MockTransport};

    const KB256: usize = 256 * 1024;

    fn test_config() -> EngineConfig {
        EngineConfig {
            settle_ms: 0,
            handshake_delay_ms: 0,
            read_chunk_size: KB256 as u32,
            flash_size: 4 * KB256 as u32,
            ..Default::default()
        }
    }

    fn device(mock: &MockTransport, magic: &[u8], config: &EngineConfig) -> DeviceHandle<MockTransport> {
        mock.queue_control_in(magic);
        let mut device = DeviceHandle::new(mock.clone(), config.command_timeouts());
        device.query_stage().unwrap();
        mock.clear_ops();
        device
    }

    fn pattern(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect()
    }

    #[test]
    fn test_identify_then_read_with_one_timeout() {
        let config = test_config();
        let mock = MockTransport::new();
        mock.queue_control_in(b"t20     ");
        let mut t20 = DeviceHandle::new(mock.clone(), config.command_timeouts());
        t20.query_stage().unwrap();
        assert_eq!(t20.identification().unwrap().clean_magic, "t20");
        assert_eq!(t20.variant(), crate::protocol::ProcessorVariant::T20);
        t20.close();

        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        let chunks: Vec<Vec<u8>> = (1..=4).map(|i| pattern(i, KB256)).collect();
        mock.queue_bulk_in(&chunks[0]);
        mock.queue_bulk_in(&chunks[1]);
        mock.queue_bulk_in_fault(MockFault::Timeout);
        mock.queue_bulk_in(&chunks[2]);
        mock.queue_bulk_in(&chunks[3]);

        let observer = RecordingObserver::default();
        let seq = Sequencer::new(&config, &observer);
        let buffer = seq.read_firmware(&mut device).unwrap();

        assert_eq!(buffer.len(), 1_048_576);
        assert_eq!(buffer.data(), chunks.concat().as_slice());
        assert_eq!(buffer.crc32(), crc32(&chunks.concat()));
        assert_eq!(buffer.crc32(), buffer.clone().crc32());
        assert_eq!(device.state(), crate::device::SessionState::Idle);

        let retries: Vec<_> = observer
            .events()
            .into_iter()
            .filter(|e| matches!(e, ClonerEvent::Retry { .. }))
            .collect();
        assert_eq!(retries.len(), 1);
        assert!(matches!(
            retries[0],
            ClonerEvent::Retry { address: 0x8_0000, attempt: 1, .. }
        ));

        // Chunk 3 issued its address and length twice.
        let addr_writes = mock
            .ops()
            .iter()
            .filter(|op| matches!(op, MockOp::ControlOut { request, .. } if request.request == VR_SET_DATA_ADDR && request.index == 0 && request.value == 0x0008))
            .count();
        assert_eq!(addr_writes, 2);
    }

    #[test]
    fn test_address_then_length_then_bulk() {
        let config = test_config();
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in(&[0xAB; 100]);

        let seq = Sequencer::new(&config, &NullObserver);
        let buffer = seq.read_region(&mut device, 0x0001_2345, 100).unwrap();
        assert_eq!(buffer.base_address(), 0x0001_2345);

        let ops = mock.ops();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], MockOp::ControlOut { request, .. }
            if request.request == VR_SET_DATA_ADDR && request.value == 0x0001 && request.index == 0x2345));
        assert!(matches!(&ops[1], MockOp::ControlOut { request, .. }
            if request.request == VR_SET_DATA_LEN && request.value == 0 && request.index == 100));
        assert!(matches!(&ops[2], MockOp::BulkIn { len: 100, timeout }
            if *timeout == config.bulk_timeout(100)));
    }

    #[test]
    fn test_retry_bound() {
        let config = EngineConfig {
            max_retries: 2,
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in(&pattern(3, KB256));
        // Nothing more queued: every further bulk IN times out.

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_firmware(&mut device).unwrap_err();
        match err {
            ClonerError::TransferTimeout {
                address,
                completed,
                total,
                attempts,
            } => {
                assert_eq!(address, KB256 as u32);
                assert_eq!(completed, KB256 as u64);
                assert_eq!(total, 4 * KB256 as u64);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }

        let bulk_reads = mock
            .ops()
            .iter()
            .filter(|op| matches!(op, MockOp::BulkIn { .. }))
            .count();
        assert_eq!(bulk_reads, 1 + 3);
        assert_eq!(device.state(), crate::device::SessionState::Idle);
    }

    #[test]
    fn test_short_read_is_retried() {
        let config = test_config();
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in(&[1; 10]);
        mock.queue_bulk_in(&[2; 64]);

        let seq = Sequencer::new(&config, &NullObserver);
        let buffer = seq.read_region(&mut device, 0, 64).unwrap();
        assert_eq!(buffer.into_vec(), vec![2; 64]);
    }

    #[test]
    fn test_persistent_short_read_times_out() {
        let config = EngineConfig {
            max_retries: 1,
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in(&[1; 10]);
        mock.queue_bulk_in(&[1; 10]);

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_region(&mut device, 0x100, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferTimeout);
        match err {
            ClonerError::TransferTimeout {
                address,
                completed,
                total,
                attempts,
            } => {
                assert_eq!(address, 0x100);
                assert_eq!(completed, 0);
                assert_eq!(total, 64);
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_excess_bulk_data_is_truncated() {
        let config = test_config();
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in(&[7; 96]);

        let seq = Sequencer::new(&config, &NullObserver);
        let buffer = seq.read_region(&mut device, 0, 64).unwrap();
        assert_eq!(buffer.into_vec(), vec![7; 64]);
    }

    #[test]
    fn test_invalid_config_rejected_before_io() {
        let config = EngineConfig {
            read_chunk_size: 0,
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_region(&mut device, 0, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_handshake_read() {
        let config = EngineConfig {
            read_protocol: ReadProtocol::Handshake,
            read_chunk_size: 8,
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        // Status, acknowledge, status. The second acknowledge times out and
        // the read still succeeds.
        mock.queue_control_in(&[0; 8]);
        mock.queue_control_in(&[0; 8]);
        mock.queue_control_in(&[0xFF, 0xFF, 0, 0, 0, 0, 0, 0]);
        mock.queue_bulk_in(&[0x11; 8]);
        mock.queue_bulk_in(&[0x22; 8]);

        let seq = Sequencer::new(&config, &NullObserver);
        let buffer = seq.read_region(&mut device, 0x0010_0000, 16).unwrap();
        assert_eq!(&buffer.data()[..8], &[0x11; 8]);
        assert_eq!(&buffer.data()[8..], &[0x22; 8]);

        let ops = mock.ops();
        assert!(!ops.iter().any(|op| matches!(op, MockOp::ControlOut { request, .. }
            if request.request == VR_SET_DATA_ADDR || request.request == VR_SET_DATA_LEN)));
        match &ops[0] {
            MockOp::ControlOut { request, data, .. } => {
                assert_eq!(request.request, VR_FW_WRITE1);
                assert_eq!(data.as_slice(), HandshakeCommand::read(0x0010_0000, 8).as_bytes());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert!(matches!(&ops[1], MockOp::ControlIn { request, length: 8, .. }
            if request.request == VR_FW_READ_STATUS));
        assert!(matches!(&ops[2], MockOp::BulkIn { len: 8, .. }));
        assert!(matches!(&ops[3], MockOp::ControlIn { request, .. } if request.request == VR_FW_READ));
        match &ops[4] {
            MockOp::ControlOut { data, .. } => {
                assert_eq!(data.as_slice(), HandshakeCommand::read(0x0010_0008, 8).as_bytes());
            }
            other => panic!("unexpected op {other:?}"),
        }
        assert_eq!(ops.len(), 8);
    }

    #[test]
    fn test_handshake_status_timeout_is_not_retried() {
        let config = EngineConfig {
            read_protocol: ReadProtocol::Handshake,
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_control_in_fault(MockFault::Timeout);

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_region(&mut device, 0, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(mock.ops().len(), 2);
    }

    #[test]
    fn test_nand_ops_read() {
        let config = EngineConfig {
            read_protocol: ReadProtocol::NandOps,
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in(&[5; 32]);

        let seq = Sequencer::new(&config, &NullObserver);
        seq.read_region(&mut device, 0x2000, 32).unwrap();

        let requests: Vec<u8> = mock
            .ops()
            .iter()
            .filter_map(|op| match op {
                MockOp::ControlOut { request, .. } => Some(request.request),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec![VR_SET_DATA_ADDR, VR_SET_DATA_LEN, VR_NAND_OPS]);
        assert!(matches!(mock.ops().last(), Some(MockOp::BulkIn { len: 32, .. })));
    }

    #[test]
    fn test_stall_is_not_retried() {
        let config = test_config();
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);
        mock.queue_bulk_in_fault(MockFault::Stall);

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_region(&mut device, 0, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransferFailed);
        assert_eq!(mock.ops().len(), 3);
    }

    #[test]
    fn test_bootrom_read_fails_without_io() {
        let config = test_config();
        let mock = MockTransport::new();
        let mut device = device(&mock, b"T31V    ", &config);

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_firmware(&mut device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_expired_deadline() {
        let config = EngineConfig {
            operation_timeout_secs: Some(0),
            ..test_config()
        };
        let mock = MockTransport::new();
        let mut device = device(&mock, b"BOOT4775", &config);

        let seq = Sequencer::new(&config, &NullObserver);
        let err = seq.read_region(&mut device, 0, 64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(mock.ops().is_empty());
        // The handle is still usable afterwards.
        assert_eq!(device.state(), crate::device::SessionState::Idle);
    }

    #[test]
    fn test_save_buffer() {
        let buffer = FirmwareBuffer::new(vec![1, 2, 3], 0);
        let path = std::env::temp_dir().join(format!("cloner-read-{}.bin", std::process::id()));
        buffer.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        std::fs::remove_file(&path).ok();

        let err = buffer.save("/nonexistent-dir/image.bin").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileIo);
    }
}
