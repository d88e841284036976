//! Cloner session: high-level orchestrator.
//!
//! Finds and opens a device, identifies its stage, then runs one read or
//! write on it. The device is closed when the operation returns, on success
//! and on failure alike.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, instrument};

use crate::config::EngineConfig;
use crate::device::{DeviceHandle, DeviceInfo, scoped};
use crate::error::{ClonerError, Result};
use crate::events::{ClonerEvent, ClonerObserver, ClonerPhase, TracingObserver};
use crate::transfer::{FirmwareBuffer, Sequencer, WriteLayout, WriteOptions};
use crate::transport::{self, NusbTransport, ObservableTransport, UsbTransport};

/// Device handle as returned by [`ClonerSession::attach`].
pub type SessionDevice<T, O> = DeviceHandle<ObservableTransport<T, O>>;

pub struct ClonerSession<O: ClonerObserver> {
    config: EngineConfig,
    observer: Arc<O>,
}

impl ClonerSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: ClonerObserver + 'static> ClonerSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: EngineConfig, observer: Arc<O>) -> Self {
        Self { config, observer }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    /// Supported devices currently on the bus.
    pub fn list_devices(&self, ask_stage: bool) -> Result<Vec<DeviceInfo>> {
        Ok(transport::list_devices(ask_stage)?)
    }

    /// Poll the bus until a supported device shows up.
    pub fn wait_for_device(&self) -> Result<DeviceInfo> {
        info!("Waiting for device...");
        let timeout = Duration::from_secs(self.config.device_wait_secs);
        let interval = Duration::from_millis(self.config.device_poll_interval_ms);
        let start = Instant::now();

        loop {
            if let Some(device) = transport::list_devices(false)?.into_iter().next() {
                info!(device = %device, elapsed_ms = start.elapsed().as_millis() as u64, "Device found");
                self.observer.on_event(&ClonerEvent::PhaseChanged {
                    from: ClonerPhase::WaitingForDevice,
                    to: ClonerPhase::Identify,
                });
                return Ok(device);
            }
            if start.elapsed() >= timeout {
                return Err(ClonerError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            thread::sleep(interval);
        }
    }

    /// Open a device over USB and identify it. With no target, the first
    /// supported device is used.
    #[instrument(skip(self))]
    pub fn open(&self, target: Option<(u8, u8)>) -> Result<SessionDevice<NusbTransport, O>> {
        let transport = match target {
            Some((bus, address)) => NusbTransport::open(bus, address)?,
            None => NusbTransport::open_first()?,
        };
        self.attach(transport)
    }

    /// Take ownership of an opened transport and query the device stage.
    pub fn attach<T: UsbTransport>(&self, transport: T) -> Result<SessionDevice<T, O>> {
        self.observer.on_event(&ClonerEvent::DeviceOpened {
            vid: transport.vendor_id(),
            pid: transport.product_id(),
        });

        let transport = ObservableTransport::new(transport, Arc::clone(&self.observer));
        let mut device = DeviceHandle::new(transport, self.config.command_timeouts());
        if let Err(e) = device.query_stage() {
            self.close(device);
            return Err(e);
        }

        if let (Some(stage), Some(id)) = (device.stage(), device.identification()) {
            self.observer.on_event(&ClonerEvent::StageDetected {
                stage,
                variant: id.variant(),
                magic: id.clean_magic.clone(),
            });
        }
        Ok(device)
    }

    /// Run `op` with a sequencer, then close the device.
    pub fn run<T, R, F>(&self, device: DeviceHandle<T>, op: F) -> Result<R>
    where
        T: UsbTransport,
        F: FnOnce(&Sequencer<'_>, &mut DeviceHandle<T>) -> Result<R>,
    {
        let sequencer = Sequencer::new(&self.config, self.observer.as_ref());
        let result = scoped(device, |device| op(&sequencer, device));
        self.observer.on_event(&ClonerEvent::DeviceClosed);
        result
    }

    /// Read the whole flash.
    pub fn read_firmware<T: UsbTransport>(&self, device: DeviceHandle<T>) -> Result<FirmwareBuffer> {
        self.run(device, |seq, device| seq.read_firmware(device))
    }

    pub fn read_region<T: UsbTransport>(
        &self,
        device: DeviceHandle<T>,
        address: u32,
        length: u32,
    ) -> Result<FirmwareBuffer> {
        self.run(device, |seq, device| seq.read_region(device, address, length))
    }

    /// Read the whole flash and save it to `path`.
    pub fn read_to_file<T: UsbTransport, P: AsRef<Path>>(
        &self,
        device: DeviceHandle<T>,
        path: P,
    ) -> Result<FirmwareBuffer> {
        let buffer = self.read_firmware(device)?;
        buffer.save(&path)?;
        info!(path = %path.as_ref().display(), bytes = buffer.len(), "Saved firmware");
        Ok(buffer)
    }

    pub fn write_block<T: UsbTransport>(
        &self,
        device: DeviceHandle<T>,
        address: u32,
        data: &[u8],
        options: &WriteOptions,
    ) -> Result<()> {
        self.run(device, |seq, device| {
            seq.write_block(device, address, data, options)
        })
    }

    /// Load `path` and write it at `address`.
    pub fn write_file<T: UsbTransport, P: AsRef<Path>>(
        &self,
        device: DeviceHandle<T>,
        address: u32,
        path: P,
        options: &WriteOptions,
    ) -> Result<()> {
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                self.close(device);
                return Err(e.into());
            }
        };
        info!(path = %path.as_ref().display(), bytes = data.len(), "Loaded image");
        self.write_block(device, address, &data, options)
    }

    pub fn write_layout<T: UsbTransport>(
        &self,
        device: DeviceHandle<T>,
        layout: &WriteLayout,
        payloads: &[&[u8]],
    ) -> Result<()> {
        self.run(device, |seq, device| seq.write_layout(device, layout, payloads))
    }

    fn close<T: UsbTransport>(&self, device: DeviceHandle<T>) {
        device.close();
        self.observer.on_event(&ClonerEvent::DeviceClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceStage;
    use crate::error::ErrorKind;
    use crate::events::{PacketDirection, RecordingObserver};
    use crate::protocol::ProcessorVariant;
    use crate::transport::{MockOp, MockTransport};

    fn session() -> ClonerSession<RecordingObserver> {
        let config = EngineConfig {
            settle_ms: 0,
            base_address: 0,
            flash_size: 16,
            read_chunk_size: 8,
            ..Default::default()
        };
        ClonerSession::with_observer(config, Arc::new(RecordingObserver::default()))
    }

    #[test]
    fn test_attach_reports_stage() {
        let session = session();
        let mock = MockTransport::new();
        mock.queue_control_in(b"BOOT4775");

        let device = session.attach(mock.clone()).unwrap();
        assert_eq!(device.stage(), Some(DeviceStage::Firmware));

        let events = session.observer().events();
        assert!(matches!(events[0], ClonerEvent::DeviceOpened { .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            ClonerEvent::Packet { direction: PacketDirection::Rx, length: 8, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            ClonerEvent::StageDetected { stage: DeviceStage::Firmware, magic, .. } if magic == "BOOT4775"
        )));
    }

    #[test]
    fn test_attach_failure_closes_device() {
        let session = session();
        let mock = MockTransport::new();
        // No CPU info scripted: both recipients time out.

        let err = session.attach(mock.clone()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(mock.is_closed());
        assert_eq!(
            session.observer().events().last(),
            Some(&ClonerEvent::DeviceClosed)
        );
    }

    #[test]
    fn test_read_closes_device() {
        let session = session();
        let mock = MockTransport::new();
        mock.queue_control_in(b"BOOT4775");
        mock.queue_bulk_in(&[1; 8]);
        mock.queue_bulk_in(&[2; 8]);

        let device = session.attach(mock.clone()).unwrap();
        let buffer = session.read_firmware(device).unwrap();

        assert_eq!(buffer.len(), 16);
        assert_eq!(&buffer.data()[8..], &[2; 8]);
        assert!(mock.is_closed());
        assert_eq!(mock.ops().last(), Some(&MockOp::Close));

        let events = session.observer().events();
        assert!(events.contains(&ClonerEvent::Complete {
            bytes: 16,
            crc32: buffer.crc32()
        }));
        assert_eq!(events.last(), Some(&ClonerEvent::DeviceClosed));
    }

    #[test]
    fn test_bootrom_write_closes_device() {
        let session = session();
        let mock = MockTransport::new();
        mock.queue_control_in(b"T31V\0\0\0\0");

        let device = session.attach(mock.clone()).unwrap();
        assert_eq!(device.variant(), ProcessorVariant::T31ZX);

        let err = session
            .write_block(device, 0x8010, &[0; 4], &WriteOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(mock.is_closed());
        assert!(!mock.ops().iter().any(|op| matches!(op, MockOp::BulkOut { .. })));
    }

    #[test]
    fn test_write_file_missing_input() {
        let session = session();
        let mock = MockTransport::new();
        mock.queue_control_in(b"BOOT4775");

        let device = session.attach(mock.clone()).unwrap();
        let err = session
            .write_file(
                device,
                0x8010,
                "/nonexistent/cloner/image.bin",
                &WriteOptions::default(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileIo);
        assert!(mock.is_closed());
    }

    #[test]
    fn test_read_to_file() {
        let session = session();
        let mock = MockTransport::new();
        mock.queue_control_in(b"BOOT4775");
        mock.queue_bulk_in(&[0xAB; 8]);
        mock.queue_bulk_in(&[0xCD; 8]);

        let path = std::env::temp_dir().join(format!("cloner-session-{}.bin", std::process::id()));
        let device = session.attach(mock).unwrap();
        session.read_to_file(device, &path).unwrap();

        let saved = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(saved.len(), 16);
        assert_eq!(saved[0], 0xAB);
        assert_eq!(saved[15], 0xCD);
    }
}
