//! Mock USB transport for testing.
//!
//! Replies are scripted per direction; anything not scripted either
//! succeeds (OUT) or times out (IN). Clones share state, so a test can keep
//! one clone for inspection after handing the other to a `DeviceHandle`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbTransport, VendorRequest};
use crate::protocol::constants::{INGENIC_VENDOR_ID, PID_FIRMWARE};

/// A recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    ControlIn {
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    },
    ControlOut {
        request: VendorRequest,
        data: Vec<u8>,
        timeout: Duration,
    },
    BulkIn {
        len: usize,
        timeout: Duration,
    },
    BulkOut {
        data: Vec<u8>,
        timeout: Duration,
    },
    Close,
}

/// Injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Timeout,
    Stall,
    Disconnected,
}

impl MockFault {
    fn into_error(self, timeout: Duration) -> TransportError {
        match self {
            MockFault::Timeout => TransportError::timeout(timeout),
            MockFault::Stall => TransportError::Stall,
            MockFault::Disconnected => TransportError::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum BulkOutScript {
    Fault(MockFault),
    Short(usize),
}

#[derive(Debug, Default)]
struct MockState {
    control_in: VecDeque<Result<Vec<u8>, MockFault>>,
    bulk_in: VecDeque<Result<Vec<u8>, MockFault>>,
    control_out_faults: HashMap<usize, MockFault>,
    bulk_out_scripts: HashMap<usize, BulkOutScript>,
    control_out_count: usize,
    bulk_out_count: usize,
    ops: Vec<MockOp>,
    closed: bool,
}

/// Mock transport for unit testing protocol logic.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    /// Simulated VID/PID.
    vid: u16,
    pid: u16,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            vid: INGENIC_VENDOR_ID,
            pid: PID_FIRMWARE,
        }
    }

    /// Set VID/PID reported by the transport.
    pub fn with_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = vid;
        self.pid = pid;
        self
    }

    /// Queue a control-IN response.
    pub fn queue_control_in(&self, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .control_in
            .push_back(Ok(data.to_vec()));
    }

    pub fn queue_control_in_fault(&self, fault: MockFault) {
        self.state.lock().unwrap().control_in.push_back(Err(fault));
    }

    /// Queue a bulk-IN response.
    pub fn queue_bulk_in(&self, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .bulk_in
            .push_back(Ok(data.to_vec()));
    }

    pub fn queue_bulk_in_fault(&self, fault: MockFault) {
        self.state.lock().unwrap().bulk_in.push_back(Err(fault));
    }

    /// Fail the `nth` control-OUT call (0-based).
    pub fn fail_control_out(&self, nth: usize, fault: MockFault) {
        self.state
            .lock()
            .unwrap()
            .control_out_faults
            .insert(nth, fault);
    }

    /// Fail the `nth` bulk-OUT call (0-based).
    pub fn fail_bulk_out(&self, nth: usize, fault: MockFault) {
        self.state
            .lock()
            .unwrap()
            .bulk_out_scripts
            .insert(nth, BulkOutScript::Fault(fault));
    }

    /// Make the `nth` bulk-OUT call accept only `accepted` bytes.
    pub fn short_bulk_out(&self, nth: usize, accepted: usize) {
        self.state
            .lock()
            .unwrap()
            .bulk_out_scripts
            .insert(nth, BulkOutScript::Short(accepted));
    }

    /// Every call made so far, in order.
    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Concatenation of every non-empty bulk-OUT payload.
    pub fn bulk_out_data(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter_map(|op| match op {
                MockOp::BulkOut { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for MockTransport {
    fn control_in(
        &mut self,
        request: VendorRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ops.push(MockOp::ControlIn {
            request,
            length,
            timeout,
        });
        match state.control_in.pop_front() {
            Some(Ok(mut data)) => {
                data.truncate(length as usize);
                Ok(data)
            }
            Some(Err(fault)) => Err(fault.into_error(timeout)),
            None => Err(TransportError::timeout(timeout)),
        }
    }

    fn control_out(
        &mut self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ops.push(MockOp::ControlOut {
            request,
            data: data.to_vec(),
            timeout,
        });
        let nth = state.control_out_count;
        state.control_out_count += 1;
        match state.control_out_faults.remove(&nth) {
            Some(fault) => Err(fault.into_error(timeout)),
            None => Ok(()),
        }
    }

    fn bulk_in(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ops.push(MockOp::BulkIn { len, timeout });
        // Scripted replies come back whole, even past `len`.
        match state.bulk_in.pop_front() {
            Some(Ok(data)) => Ok(data),
            Some(Err(fault)) => Err(fault.into_error(timeout)),
            None => Err(TransportError::timeout(timeout)),
        }
    }

    fn bulk_out(&mut self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.ops.push(MockOp::BulkOut {
            data: data.to_vec(),
            timeout,
        });
        let nth = state.bulk_out_count;
        state.bulk_out_count += 1;
        match state.bulk_out_scripts.remove(&nth) {
            Some(BulkOutScript::Fault(fault)) => Err(fault.into_error(timeout)),
            Some(BulkOutScript::Short(accepted)) => Ok(accepted.min(data.len())),
            None => Ok(data.len()),
        }
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        if !state.closed {
            state.ops.push(MockOp::Close);
            state.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn test_mock_bulk_in_queue() {
        let mut mock = MockTransport::new();
        mock.queue_bulk_in(b"Hello");
        mock.queue_bulk_in_fault(MockFault::Stall);

        assert_eq!(mock.bulk_in(64, T).unwrap(), b"Hello");
        assert!(matches!(mock.bulk_in(64, T), Err(TransportError::Stall)));

        mock.queue_bulk_in(&[0; 8]);
        assert_eq!(mock.bulk_in(4, T).unwrap().len(), 8);

        // Queue is empty now
        assert!(matches!(
            mock.bulk_in(64, T),
            Err(TransportError::Timeout { timeout_ms: 10 })
        ));
    }

    #[test]
    fn test_mock_bulk_out_scripts() {
        let mut mock = MockTransport::new();
        mock.short_bulk_out(1, 3);
        mock.fail_bulk_out(2, MockFault::Timeout);

        assert_eq!(mock.bulk_out(b"abcdef", T).unwrap(), 6);
        assert_eq!(mock.bulk_out(b"abcdef", T).unwrap(), 3);
        assert!(mock.bulk_out(b"abcdef", T).is_err());
        assert_eq!(mock.bulk_out(b"", T).unwrap(), 0);
        assert_eq!(mock.bulk_out_data().len(), 18);
    }

    #[test]
    fn test_mock_shared_state_and_close() {
        let shared = MockTransport::new();
        let mut mock = shared.clone();
        mock.control_out(VendorRequest::device(0x03, 0, 0), &[], T)
            .unwrap();
        mock.close();
        mock.close();

        assert!(shared.is_closed());
        assert_eq!(shared.ops().len(), 2);
        assert_eq!(shared.ops()[1], MockOp::Close);
        assert!(matches!(
            mock.bulk_out(b"x", T),
            Err(TransportError::Closed)
        ));
    }
}
