//! Seams to the native USB stack
//!
//! The port mapper never talks to libusb directly outside [`crate::native`].
//! Everything it needs from a physical device is expressed by
//! [`NativeDevice`], and everything it needs from the host-wide context by
//! [`UsbHost`]. Tests drive the core through the mocks in `test_utils`
//! (feature `test-utils`).

use crate::engine::Request;
use crate::hooks::PortMapperHooks;
use crate::queue::ControlRequest;
use crate::types::{DeviceInfo, Direction, EndpointType};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Endpoint as described by the active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLayout {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    pub kind: EndpointType,
    /// Raw wMaxPacketSize, multiplier bits included
    pub max_packet: u16,
}

impl EndpointLayout {
    pub fn direction(&self) -> Direction {
        Direction::from_endpoint_address(self.address)
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }
}

/// One interface with every alternate setting's endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    /// Indexed by alternate setting
    pub alt_settings: Vec<Vec<EndpointLayout>>,
}

/// Active configuration of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayout {
    /// bConfigurationValue
    pub value: u8,
    pub interfaces: Vec<InterfaceLayout>,
}

impl ConfigLayout {
    pub fn interface_numbers(&self) -> impl Iterator<Item = u8> + '_ {
        self.interfaces.iter().map(|iface| iface.number)
    }
}

/// Cancels one in-flight native transfer
///
/// Only valid while the transfer's queue slot still records it; see
/// [`crate::engine::cancel_request`].
pub type CancelHandle = Arc<dyn Fn() -> Result<(), rusb::Error> + Send + Sync>;

/// Keeps a hotplug registration alive; dropping it deregisters
pub type HotplugGuard = Box<dyn Send>;

/// A request the native layer refused to submit
///
/// The request is handed back so its resources still flow through the
/// completion path.
pub struct SubmitRejected {
    pub error: rusb::Error,
    pub request: Request,
}

impl fmt::Debug for SubmitRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitRejected")
            .field("error", &self.error)
            .field("seq", &self.request.seq())
            .finish()
    }
}

/// An opened physical device
pub trait NativeDevice: Send {
    fn active_config(&self) -> Result<ConfigLayout, rusb::Error>;

    fn kernel_driver_active(&self, iface: u8) -> Result<bool, rusb::Error>;
    fn detach_kernel_driver(&mut self, iface: u8) -> Result<(), rusb::Error>;
    fn attach_kernel_driver(&mut self, iface: u8) -> Result<(), rusb::Error>;

    fn claim_interface(&mut self, iface: u8) -> Result<(), rusb::Error>;
    fn release_interface(&mut self, iface: u8) -> Result<(), rusb::Error>;

    fn set_configuration(&mut self, value: u8) -> Result<(), rusb::Error>;
    fn set_alternate_setting(&mut self, iface: u8, alt: u8) -> Result<(), rusb::Error>;
    fn reset(&mut self) -> Result<(), rusb::Error>;
    fn clear_halt(&mut self, endpoint: u8) -> Result<(), rusb::Error>;

    /// Device-to-host control transfer, returns bytes read
    fn read_control(
        &mut self,
        setup: &ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Host-to-device control transfer, returns bytes written
    fn write_control(
        &mut self,
        setup: &ControlRequest,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Start an asynchronous transfer
    ///
    /// On success the native layer owns the request until it calls
    /// [`crate::engine::complete`] exactly once.
    fn submit(&mut self, request: Request) -> Result<CancelHandle, SubmitRejected>;
}

/// Host-wide native context
pub trait UsbHost: Send + Sync + 'static {
    /// Every device currently on any bus, root hubs included
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, rusb::Error>;

    /// Route arrival/departure events to the connect/disconnect hooks
    fn register_hotplug(
        &self,
        hooks: Arc<dyn PortMapperHooks>,
    ) -> Result<HotplugGuard, rusb::Error>;

    /// Service pending native events, blocking at most `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<(), rusb::Error>;

    /// Make a blocked [`UsbHost::handle_events`] return early
    fn wake(&self);

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn NativeDevice>, rusb::Error>;
}
