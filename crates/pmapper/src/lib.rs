//! USB port mapper
//!
//! Passthrough bridge between a virtualized USB host controller and the
//! physical USB stack. The virtual controller hands this crate guest data
//! fragments; the crate maps them onto asynchronous libusb transfers,
//! emulates the control requests that must stay local, and reports physical
//! topology changes so devices can be attached to or detached from a guest.
//!
//! The pieces, leaves first:
//! - [`topology`]: depth-ordered discovery of physical devices
//! - [`device`]: open/close, configuration and interface selection
//! - [`control`]: control-request interception
//! - [`engine`]: batching of guest fragments into native transfers
//! - [`runtime`]: context, hotplug and the event polling thread
//!
//! All native I/O goes through the [`NativeDevice`] and [`UsbHost`] traits.
//! [`native`] implements them on top of rusb/libusb.

pub mod backend;
pub mod config;
pub mod control;
pub mod device;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod native;
pub mod queue;
pub mod runtime;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod topology;
pub mod types;

pub use backend::{
    CancelHandle, ConfigLayout, EndpointLayout, HotplugGuard, InterfaceLayout, NativeDevice,
    SubmitRejected, UsbHost,
};
pub use config::{NativeLogLevel, RuntimeConfig};
pub use control::{prepare_control, strip_uas_protocol};
pub use device::{MAX_INTERFACES, VirtualDevice};
pub use endpoint::{Endpoint, EndpointTable};
pub use engine::{
    Completion, CompletionPort, DeferredCompletions, IsoPacket, Request, TransferOutcome,
    cancel_request, complete, completion_channel,
};
pub use error::{PortMapperError, Result, UsbStatus, map_rusb_error};
pub use hooks::PortMapperHooks;
pub use native::{RusbDevice, RusbHost, describe_device, device_present};
pub use queue::{
    Block, BlockRole, BlockStatus, ControlRequest, PendingRequest, SharedQueue, TransferQueue,
    lock_queue,
};
pub use runtime::PortMapper;
pub use topology::scan_topology;
pub use types::{
    DeviceInfo, DevicePath, DeviceType, Direction, EndpointType, InfoField, InfoValue, UsbSpeed,
};
