//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod observable;
pub mod traits;

pub use mock::{MockFault, MockOp, MockTransport};
pub use nusb::{NusbTransport, list_devices};
pub use observable::ObservableTransport;
pub use traits::{Recipient, TransportError, UsbTransport, VendorRequest};
