//! libusb backend
//!
//! Synchronous operations go through rusb. Data transfers use the libusb
//! asynchronous API directly through `rusb::ffi`, since rusb only exposes
//! blocking transfers: the [`Request`] travels as the transfer's user data
//! and comes back in [`transfer_callback`], which runs on the runtime thread
//! inside `handle_events`.

use crate::backend::{
    CancelHandle, ConfigLayout, EndpointLayout, HotplugGuard, InterfaceLayout, NativeDevice,
    SubmitRejected, UsbHost,
};
use crate::config::RuntimeConfig;
use crate::engine::{self, Completion, IsoPacket, Request, TransferOutcome};
use crate::hooks::PortMapperHooks;
use crate::queue::ControlRequest;
use crate::types::{DeviceInfo, DevicePath, DeviceType, EndpointType, map_device_speed};
use rusb::ffi::{self, constants::*};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, UsbContext};
use std::ffi::{c_int, c_uint};
use std::fs;
use std::path::Path;
use std::ptr::addr_of_mut;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Rebuild the bcdUSB word from rusb's decoded version
fn version_to_bcd(version: rusb::Version) -> u16 {
    let major = u16::from(version.major());
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | (u16::from(version.minor()) << 4)
        | u16::from(version.sub_minor())
}

/// Downstream port count of a hub, from sysfs
fn hub_port_count(path: &DevicePath) -> Option<u8> {
    let file = Path::new(SYSFS_USB_DEVICES)
        .join(path.sysfs_name())
        .join("maxchild");
    match fs::read_to_string(&file) {
        Ok(content) => content.trim().parse().ok(),
        Err(e) => {
            debug!("fail to get count of numbers of hub {}: {}", path, e);
            None
        }
    }
}

/// Whether the kernel still knows the device at `path`
///
/// Hosts without sysfs always report the device as present.
pub fn device_present(path: &DevicePath) -> bool {
    let root = Path::new(SYSFS_USB_DEVICES);
    if !root.exists() {
        return true;
    }
    root.join(path.sysfs_name()).exists()
}

/// Snapshot a native device
pub fn describe_device<T: UsbContext>(device: &Device<T>) -> Option<DeviceInfo> {
    let bus = device.bus_number();
    let ports = device.port_numbers().unwrap_or_default();
    let Some(path) = DevicePath::new(bus, &ports) else {
        warn!("Device on bus {} nested deeper than supported: {:?}", bus, ports);
        return None;
    };

    let descriptor = match device.device_descriptor() {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!("fail to get descriptor for {}: {}", path, e);
            return None;
        }
    };

    let device_type = DeviceType::classify(&path, descriptor.class_code());
    let max_child = if device_type == DeviceType::ExternalHub {
        hub_port_count(&path)
    } else {
        None
    };

    Some(DeviceInfo {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bcd_usb: version_to_bcd(descriptor.usb_version()),
        speed: map_device_speed(device.speed()),
        device_type,
        max_child,
        path,
    })
}

/// libusb context shared by the whole port mapper
pub struct RusbHost {
    context: Context,
}

impl RusbHost {
    pub fn open(config: &RuntimeConfig) -> Result<Self, rusb::Error> {
        let mut context = Context::new()?;
        context.set_log_level(config.libusb_log_level.into());
        info!("libusb {} initialized", rusb::version().major());
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn find_device(&self, path: &DevicePath) -> Result<Device<Context>, rusb::Error> {
        self.context
            .devices()?
            .iter()
            .find(|device| {
                device.bus_number() == path.bus()
                    && device.port_numbers().is_ok_and(|ports| ports == path.ports())
            })
            .ok_or(rusb::Error::NoDevice)
    }
}

impl UsbHost for RusbHost {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, rusb::Error> {
        let devices = self.context.devices()?;
        Ok(devices.iter().filter_map(|d| describe_device(&d)).collect())
    }

    fn register_hotplug(
        &self,
        hooks: Arc<dyn PortMapperHooks>,
    ) -> Result<HotplugGuard, rusb::Error> {
        if !rusb::has_hotplug() {
            return Err(rusb::Error::NotSupported);
        }
        let registration = HotplugBuilder::new()
            .enumerate(false)
            .register(&self.context, Box::new(HotplugBridge { hooks }))?;
        debug!("Hot-plug callbacks registered");
        Ok(Box::new(registration))
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), rusb::Error> {
        self.context.handle_events(Some(timeout))
    }

    fn wake(&self) {
        // SAFETY: the context outlives this call and libusb allows
        // interrupting the event handler from any thread
        unsafe { ffi::libusb_interrupt_event_handler(self.context.as_raw()) }
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn NativeDevice>, rusb::Error> {
        let device = self.find_device(&info.path)?;
        let handle = device.open()?;
        debug!("Opened device {}", info.path);
        Ok(Box::new(RusbDevice {
            device,
            handle,
            path: info.path.clone(),
        }))
    }
}

/// Routes libusb hotplug events to the controller
struct HotplugBridge {
    hooks: Arc<dyn PortMapperHooks>,
}

impl Hotplug<Context> for HotplugBridge {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!("connect event");
        match describe_device(&device) {
            Some(info) => self.hooks.connect(&info),
            None => debug!("Ignoring arrival on bus {}", device.bus_number()),
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!("disconnect event");
        match describe_device(&device) {
            Some(info) => self.hooks.disconnect(&info),
            None => debug!("Ignoring departure on bus {}", device.bus_number()),
        }
    }
}

/// An opened physical device
pub struct RusbDevice {
    device: Device<Context>,
    handle: DeviceHandle<Context>,
    path: DevicePath,
}

impl NativeDevice for RusbDevice {
    fn active_config(&self) -> Result<ConfigLayout, rusb::Error> {
        let config = self.device.active_config_descriptor()?;
        let interfaces = config
            .interfaces()
            .map(|iface| InterfaceLayout {
                number: iface.number(),
                alt_settings: iface
                    .descriptors()
                    .map(|alt| {
                        alt.endpoint_descriptors()
                            .map(|ep| EndpointLayout {
                                address: ep.address(),
                                kind: ep.transfer_type().into(),
                                max_packet: ep.max_packet_size(),
                            })
                            .collect()
                    })
                    .collect(),
            })
            .collect();
        Ok(ConfigLayout {
            value: config.number(),
            interfaces,
        })
    }

    fn kernel_driver_active(&self, iface: u8) -> Result<bool, rusb::Error> {
        self.handle.kernel_driver_active(iface)
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> Result<(), rusb::Error> {
        self.handle.detach_kernel_driver(iface)
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> Result<(), rusb::Error> {
        self.handle.attach_kernel_driver(iface)
    }

    fn claim_interface(&mut self, iface: u8) -> Result<(), rusb::Error> {
        self.handle.claim_interface(iface)
    }

    fn release_interface(&mut self, iface: u8) -> Result<(), rusb::Error> {
        self.handle.release_interface(iface)
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), rusb::Error> {
        self.handle.set_active_configuration(value)
    }

    fn set_alternate_setting(&mut self, iface: u8, alt: u8) -> Result<(), rusb::Error> {
        self.handle.set_alternate_setting(iface, alt)
    }

    fn reset(&mut self) -> Result<(), rusb::Error> {
        self.handle.reset()
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), rusb::Error> {
        self.handle.clear_halt(endpoint)
    }

    fn read_control(
        &mut self,
        setup: &ControlRequest,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.read_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
    }

    fn write_control(
        &mut self,
        setup: &ControlRequest,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.handle.write_control(
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            buf,
            timeout,
        )
    }

    fn submit(&mut self, mut request: Request) -> Result<CancelHandle, SubmitRejected> {
        let transfer_type = match request.kind() {
            EndpointType::Bulk => LIBUSB_TRANSFER_TYPE_BULK,
            EndpointType::Interrupt => LIBUSB_TRANSFER_TYPE_INTERRUPT,
            EndpointType::Isochronous => LIBUSB_TRANSFER_TYPE_ISOCHRONOUS,
            EndpointType::Control | EndpointType::None => {
                return Err(SubmitRejected {
                    error: rusb::Error::InvalidParam,
                    request,
                });
            }
        };
        let packet_lengths = request.iso_packet_lengths().to_vec();
        let length = request.buffer().len();

        // SAFETY: plain allocation, checked for null below
        let raw = unsafe { ffi::libusb_alloc_transfer(packet_lengths.len() as c_int) };
        if raw.is_null() {
            return Err(SubmitRejected {
                error: rusb::Error::NoMem,
                request,
            });
        }
        let buffer = request.buffer_mut().as_mut_ptr();
        let endpoint = request.endpoint_address();
        request.attach_native(Box::new(OwnedTransfer(raw)));
        let user_data = Box::into_raw(Box::new(request));

        // SAFETY: `raw` was allocated with room for every packet
        // descriptor. The buffer lives in the boxed request, which the
        // transfer owns until the callback reclaims it.
        let rc = unsafe {
            (*raw).dev_handle = self.handle.as_raw();
            (*raw).flags = 0;
            (*raw).endpoint = endpoint;
            (*raw).transfer_type = transfer_type as _;
            (*raw).timeout = 0;
            (*raw).length = length as c_int;
            (*raw).callback = transfer_callback;
            (*raw).user_data = user_data.cast();
            (*raw).buffer = buffer;
            (*raw).num_iso_packets = packet_lengths.len() as c_int;
            let descriptors =
                addr_of_mut!((*raw).iso_packet_desc).cast::<ffi::libusb_iso_packet_descriptor>();
            for (i, len) in packet_lengths.iter().enumerate() {
                (*descriptors.add(i)).length = *len as c_uint;
            }
            ffi::libusb_submit_transfer(raw)
        };

        if rc != 0 {
            // SAFETY: libusb did not take the transfer, so the box is still ours
            let request = unsafe { *Box::from_raw(user_data) };
            return Err(SubmitRejected {
                error: error_from_code(rc),
                request,
            });
        }

        debug!(
            "{}: transfer submitted ep {:#04x} {} bytes {} packets",
            self.path,
            endpoint,
            length,
            packet_lengths.len()
        );
        let transfer = RawTransfer(raw);
        Ok(Arc::new(move || transfer.cancel()))
    }
}

/// Transfer allocation owned by a request
struct OwnedTransfer(*mut ffi::libusb_transfer);

// SAFETY: the transfer is only touched by the thread holding the request
unsafe impl Send for OwnedTransfer {}

impl Drop for OwnedTransfer {
    fn drop(&mut self) {
        // SAFETY: allocated by libusb_alloc_transfer and freed exactly once
        unsafe { ffi::libusb_free_transfer(self.0) }
    }
}

/// Borrowed transfer pointer used for cancellation
///
/// Only dereferenced while the owning queue slot still records the request,
/// which keeps the allocation alive.
struct RawTransfer(*mut ffi::libusb_transfer);

// SAFETY: libusb_cancel_transfer is thread safe
unsafe impl Send for RawTransfer {}
unsafe impl Sync for RawTransfer {}

impl RawTransfer {
    fn cancel(&self) -> Result<(), rusb::Error> {
        // SAFETY: see the type's invariant
        match unsafe { ffi::libusb_cancel_transfer(self.0) } {
            0 => Ok(()),
            rc => Err(error_from_code(rc)),
        }
    }
}

fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn outcome_from_status(status: c_int) -> TransferOutcome {
    match status {
        s if s == LIBUSB_TRANSFER_COMPLETED as c_int => TransferOutcome::Completed,
        s if s == LIBUSB_TRANSFER_STALL as c_int => TransferOutcome::Stall,
        s if s == LIBUSB_TRANSFER_NO_DEVICE as c_int => TransferOutcome::NoDevice,
        s if s == LIBUSB_TRANSFER_ERROR as c_int => TransferOutcome::Error,
        s if s == LIBUSB_TRANSFER_CANCELLED as c_int => TransferOutcome::Cancelled,
        s if s == LIBUSB_TRANSFER_TIMED_OUT as c_int => TransferOutcome::TimedOut,
        s if s == LIBUSB_TRANSFER_OVERFLOW as c_int => TransferOutcome::Overflow,
        other => {
            warn!("unknown transfer failure: {:#x}", other);
            TransferOutcome::Completed
        }
    }
}

extern "system" fn transfer_callback(raw: *mut ffi::libusb_transfer) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| finish_transfer(raw)));
    if let Err(e) = result {
        error!("Panic in transfer completion: {:?}", e);
    }
}

fn finish_transfer(raw: *mut ffi::libusb_transfer) {
    // SAFETY: libusb hands back the transfer we submitted
    let user_data = unsafe { (*raw).user_data };
    if user_data.is_null() {
        error!("user context data not found on USB transfer");
        return;
    }
    // SAFETY: set to a boxed Request in submit and reclaimed only here
    let request = unsafe { *Box::from_raw(user_data.cast::<Request>()) };

    // SAFETY: the transfer stays allocated until `request` is dropped
    let (status, actual_length, packets) = unsafe {
        let count = usize::try_from((*raw).num_iso_packets).unwrap_or(0);
        let descriptors =
            addr_of_mut!((*raw).iso_packet_desc).cast::<ffi::libusb_iso_packet_descriptor>();
        let packets: Vec<IsoPacket> = (0..count)
            .map(|i| {
                let desc = &*descriptors.add(i);
                IsoPacket {
                    length: desc.length as usize,
                    actual_length: desc.actual_length as usize,
                }
            })
            .collect();
        (
            (*raw).status,
            usize::try_from((*raw).actual_length).unwrap_or(0),
            packets,
        )
    };

    let mut outcome = outcome_from_status(status);
    // Errors caused by unplugging are reconciled by the disconnect callback
    if outcome == TransferOutcome::Error && !device_present(request.device()) {
        outcome = TransferOutcome::NoDevice;
    }

    for (i, packet) in packets.iter().enumerate() {
        debug!(
            "iso_frame {} len {} act_len {}",
            i, packet.length, packet.actual_length
        );
    }

    let isochronous = request.kind() == EndpointType::Isochronous;
    let completion = if isochronous && outcome == TransferOutcome::Completed {
        Completion::isochronous(packets)
    } else {
        Completion {
            outcome,
            actual_length,
            iso_packets: packets,
        }
    };
    engine::complete(request, completion);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_to_bcd() {
        for bcd in [0x320, 0x310, 0x300, 0x210, 0x201, 0x200, 0x110] {
            assert_eq!(version_to_bcd(rusb::Version::from_bcd(bcd)), bcd);
        }
    }

    #[test]
    fn test_error_from_code() {
        assert_eq!(error_from_code(LIBUSB_ERROR_PIPE), rusb::Error::Pipe);
        assert_eq!(error_from_code(LIBUSB_ERROR_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(error_from_code(-99), rusb::Error::Other);
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_STALL as c_int),
            TransferOutcome::Stall
        );
        assert_eq!(
            outcome_from_status(LIBUSB_TRANSFER_CANCELLED as c_int),
            TransferOutcome::Cancelled
        );
    }
}
