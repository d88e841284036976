//! Transport wrapper that emits packet events.

use std::sync::Arc;
use std::time::Duration;

use super::traits::{TransportError, UsbTransport, VendorRequest};
use crate::events::{ClonerEvent, ClonerObserver, PacketDirection, PacketKind};

/// Bytes of each packet copied into the event.
const PREVIEW_LEN: usize = 32;

pub struct ObservableTransport<T: UsbTransport, O: ClonerObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: UsbTransport, O: ClonerObserver> ObservableTransport<T, O> {
    pub fn new(inner: T, observer: Arc<O>) -> Self {
        Self { inner, observer }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn emit(&self, direction: PacketDirection, kind: PacketKind, data: &[u8], length: usize) {
        self.observer.on_event(&ClonerEvent::Packet {
            direction,
            kind,
            length,
            data: data.iter().take(PREVIEW_LEN).copied().collect(),
        });
    }
}

impl<T: UsbTransport, O: ClonerObserver> UsbTransport for ObservableTransport<T, O> {
    fn control_in(
        &mut self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.control_in(request, length, timeout);
        if let Ok(data) = &res {
            self.emit(
                PacketDirection::Rx,
                PacketKind::Control(request.request),
                data,
                data.len(),
            );
        }
        res
    }

    fn control_out(
        &mut self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let res = self.inner.control_out(request, data, timeout);
        if res.is_ok() {
            self.emit(
                PacketDirection::Tx,
                PacketKind::Control(request.request),
                data,
                data.len(),
            );
        }
        res
    }

    fn bulk_in(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.bulk_in(len, timeout);
        if let Ok(data) = &res {
            self.emit(PacketDirection::Rx, PacketKind::Bulk, data, data.len());
        }
        res
    }

    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let res = self.inner.bulk_out(data, timeout);
        if let Ok(n) = res {
            self.emit(PacketDirection::Tx, PacketKind::Bulk, data, n);
        }
        res
    }

    fn vendor_id(&self) -> u16 {
        self.inner.vendor_id()
    }

    fn product_id(&self) -> u16 {
        self.inner.product_id()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}
