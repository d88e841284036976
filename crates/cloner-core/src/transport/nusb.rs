//! nusb-based USB transport implementation.

use std::time::Duration;

use nusb::transfer::{
    Buffer, Bulk, ControlIn, ControlOut, ControlType, In, Out, Recipient as UsbRecipient,
    TransferError,
};
use nusb::{Endpoint, Interface, MaybeFuture};
use tracing::{debug, info, instrument, warn};

use super::traits::{Recipient, TransportError, UsbTransport, VendorRequest};
use crate::device::{DeviceInfo, DeviceStage};
use crate::protocol::CommandTimeouts;
use crate::protocol::commands::get_cpu_info;
use crate::protocol::constants::{
    BOOTROM_PIDS, ENDPOINT_IN, ENDPOINT_OUT, FIRMWARE_PIDS, SUPPORTED_VIDS,
};

fn is_ingenic(vid: u16, pid: u16) -> bool {
    SUPPORTED_VIDS.contains(&vid) && (BOOTROM_PIDS.contains(&pid) || FIRMWARE_PIDS.contains(&pid))
}

fn bus_number(device_info: &nusb::DeviceInfo) -> u8 {
    device_info.bus_id().parse().unwrap_or(0)
}

fn map_transfer_error(err: TransferError, timeout: Duration, write: bool) -> TransportError {
    match err {
        // nusb cancels a blocking transfer when its timeout expires.
        TransferError::Cancelled => TransportError::timeout(timeout),
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other if write => TransportError::WriteFailed(other.to_string()),
        other => TransportError::ReadFailed(other.to_string()),
    }
}

/// Enumerate Ingenic devices currently on the bus.
///
/// The stage is taken from the PID. With `ask_stage` set, devices that
/// enumerate with a bootrom PID are opened and asked for their CPU magic,
/// since some firmware stages keep the bootrom PID.
#[instrument(level = "debug")]
pub fn list_devices(ask_stage: bool) -> Result<Vec<DeviceInfo>, TransportError> {
    let devices = nusb::list_devices()
        .wait()
        .map_err(|e| TransportError::InitFailed(e.to_string()))?;

    let mut found = Vec::new();
    for device_info in devices {
        let (vid, pid) = (device_info.vendor_id(), device_info.product_id());
        if !is_ingenic(vid, pid) {
            continue;
        }

        let mut info = DeviceInfo {
            vendor_id: vid,
            product_id: pid,
            bus: bus_number(&device_info),
            address: device_info.device_address(),
            stage: DeviceStage::from_product_id(pid),
        };

        if ask_stage && info.stage == DeviceStage::Bootrom {
            match query_stage(device_info) {
                Ok(stage) => info.stage = stage,
                Err(e) => debug!(error = %e, bus = info.bus, address = info.address, "Stage query failed"),
            }
        }

        debug!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            stage = %info.stage,
            "Found device"
        );
        found.push(info);
    }

    Ok(found)
}

fn query_stage(device_info: nusb::DeviceInfo) -> Result<DeviceStage, TransportError> {
    let mut transport = NusbTransport::open_device_info(device_info)?;
    let stage = match get_cpu_info(&mut transport, &CommandTimeouts::default()) {
        Ok(id) if id.is_firmware_stage() => DeviceStage::Firmware,
        _ => DeviceStage::Bootrom,
    };
    transport.close();
    Ok(stage)
}

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Option<Interface>,
    in_endpoint: Option<Endpoint<Bulk, In>>,
    out_endpoint: Option<Endpoint<Bulk, Out>>,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the Ingenic device at `bus`/`address`.
    #[instrument(level = "info")]
    pub fn open(bus: u8, address: u8) -> Result<Self, TransportError> {
        let device_info = nusb::list_devices()
            .wait()
            .map_err(|e| TransportError::InitFailed(e.to_string()))?
            .find(|d| {
                is_ingenic(d.vendor_id(), d.product_id())
                    && bus_number(d) == bus
                    && d.device_address() == address
            })
            .ok_or(TransportError::DeviceNotFound { bus, address })?;

        Self::open_device_info(device_info)
    }

    /// Open the first Ingenic device found.
    pub fn open_first() -> Result<Self, TransportError> {
        let device_info = nusb::list_devices()
            .wait()
            .map_err(|e| TransportError::InitFailed(e.to_string()))?
            .find(|d| is_ingenic(d.vendor_id(), d.product_id()))
            .ok_or(TransportError::DeviceNotFound { bus: 0, address: 0 })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        // Prefer the documented endpoints, fall back to whatever bulk pair
        // interface 0 advertises.
        let mut in_addr: u8 = 0;
        let mut out_addr: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() != nusb::descriptors::TransferType::Bulk {
                            continue;
                        }
                        let addr = ep.address();
                        if ep.direction() == nusb::transfer::Direction::In {
                            if in_addr == 0 || addr == ENDPOINT_IN {
                                in_addr = addr;
                            }
                        } else if out_addr == 0 || addr == ENDPOINT_OUT {
                            out_addr = addr;
                        }
                    }
                }
            }
        }

        if in_addr == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk In".into(),
                address: ENDPOINT_IN,
            });
        }
        if out_addr == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk Out".into(),
                address: ENDPOINT_OUT,
            });
        }

        let in_endpoint = interface.endpoint::<Bulk, In>(in_addr).map_err(|e| {
            TransportError::OpenFailed(format!("bulk IN 0x{:02X}: {}", in_addr, e))
        })?;
        let out_endpoint = interface.endpoint::<Bulk, Out>(out_addr).map_err(|e| {
            TransportError::OpenFailed(format!("bulk OUT 0x{:02X}: {}", out_addr, e))
        })?;

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            in_ep = %format!("0x{:02X}", in_addr),
            out_ep = %format!("0x{:02X}", out_addr),
            "Device opened successfully"
        );

        Ok(Self {
            interface: Some(interface),
            in_endpoint: Some(in_endpoint),
            out_endpoint: Some(out_endpoint),
            vid,
            pid,
        })
    }

    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::Closed)
    }
}

fn usb_recipient(recipient: Recipient) -> UsbRecipient {
    match recipient {
        Recipient::Device => UsbRecipient::Device,
        Recipient::Interface => UsbRecipient::Interface,
    }
}

impl UsbTransport for NusbTransport {
    #[instrument(level = "trace", skip(self))]
    fn control_in(
        &mut self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.interface()?
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: usb_recipient(request.recipient),
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    length,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout, false))
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn control_out(
        &mut self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.interface()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: usb_recipient(request.recipient),
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(|e| map_transfer_error(e, timeout, true))
    }

    #[instrument(level = "trace", skip(self))]
    fn bulk_in(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let ep = self.in_endpoint.as_mut().ok_or(TransportError::Closed)?;

        // IN requests must be a whole number of packets.
        let max_packet_size = ep.max_packet_size();
        let request_len = len.div_ceil(max_packet_size) * max_packet_size;
        let mut buf = Buffer::new(request_len);
        buf.set_requested_len(request_len);

        let data = ep
            .transfer_blocking(buf, timeout)
            .into_result()
            .map_err(|e| map_transfer_error(e, timeout, false))?;

        let n = data.len().min(len);
        debug!(bytes_read = n, "Bulk read complete");
        Ok(data[..n].to_vec())
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let ep = self.out_endpoint.as_mut().ok_or(TransportError::Closed)?;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        let completion = ep.transfer_blocking(buf, timeout);
        completion
            .status
            .map_err(|e| map_transfer_error(e, timeout, true))?;

        debug!(bytes_written = completion.actual_len, "Bulk write complete");
        Ok(completion.actual_len)
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn close(&mut self) {
        if self.interface.is_none() {
            return;
        }
        self.in_endpoint = None;
        self.out_endpoint = None;
        self.interface = None;
        info!(
            vendor_id = %format!("{:04X}", self.vid),
            product_id = %format!("{:04X}", self.pid),
            "Device closed"
        );
    }
}

impl Drop for NusbTransport {
    fn drop(&mut self) {
        if self.interface.is_some() {
            warn!("Transport dropped without close");
            self.close();
        }
    }
}
