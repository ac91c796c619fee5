//! Device lifecycle
//!
//! A [`VirtualDevice`] is the port mapper's view of one passed-through
//! physical device: the opened native handle, the configuration and
//! alternate settings the guest selected, and the endpoint cache the
//! transfer engine dispatches on.

use crate::backend::{ConfigLayout, NativeDevice};
use crate::endpoint::EndpointTable;
use crate::engine::CompletionPort;
use crate::error::{PortMapperError, Result};
use crate::types::{DeviceInfo, InfoField, InfoValue, usb_major_version};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Interface numbers 0..MAX_INTERFACES can carry an alternate setting
pub const MAX_INTERFACES: usize = 16;

/// Bound on forwarded control transfers
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(300);

/// Check that a device can be passed through, returning its emulated
/// major version
pub fn validate(info: &DeviceInfo) -> Result<u8> {
    if info.path.is_root_hub() {
        return Err(PortMapperError::RootHub(info.path.to_string()));
    }
    usb_major_version(info.bcd_usb).ok_or(PortMapperError::UnsupportedVersion(info.bcd_usb))
}

/// A physical device attached to the virtual controller
pub struct VirtualDevice {
    pub(crate) native: Box<dyn NativeDevice>,
    pub(crate) info: DeviceInfo,
    version: u8,
    /// Guest-assigned address, recorded only
    pub(crate) address: u16,
    configuration: Option<u8>,
    interface_count: usize,
    alt_settings: [u8; MAX_INTERFACES],
    pub(crate) endpoints: EndpointTable,
    pub(crate) port: CompletionPort,
    pub(crate) control_timeout: Duration,
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("info", &self.info)
            .field("version", &self.version)
            .field("address", &self.address)
            .field("configuration", &self.configuration)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl VirtualDevice {
    /// Take over an opened device
    ///
    /// Kernel drivers are detached from every interface of the active
    /// configuration so the interfaces can be claimed later. On failure
    /// drivers detached so far are reattached and the native handle is
    /// dropped, closing it.
    pub fn init(
        info: DeviceInfo,
        native: Box<dyn NativeDevice>,
        port: CompletionPort,
    ) -> Result<Self> {
        let version = validate(&info)?;

        info!(
            "Found USB device {}: VID {:#06x} PID {:#06x} bcd {:#06x} speed {:?}",
            info.path, info.vendor_id, info.product_id, info.bcd_usb, info.speed
        );

        let mut device = Self {
            native,
            info,
            version,
            address: 0,
            configuration: None,
            interface_count: 0,
            alt_settings: [0; MAX_INTERFACES],
            endpoints: EndpointTable::new(),
            port,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        };

        let layout = device.native.active_config().inspect_err(|e| {
            warn!("{}: can't get config: {}", device.info.path, e);
        })?;
        let mut detached = Vec::new();
        if let Err(e) = device.detach_drivers(&layout, &mut detached) {
            device.reattach_drivers(detached);
            return Err(e.into());
        }
        device.endpoints.rebuild(&layout, &device.alt_settings);

        Ok(device)
    }

    pub fn with_control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Emulated major USB version (2 or 3)
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Value of the last successful configuration change
    pub fn configuration(&self) -> Option<u8> {
        self.configuration
    }

    pub fn interface_count(&self) -> usize {
        self.interface_count
    }

    pub fn alt_setting(&self, iface: usize) -> Option<u8> {
        self.alt_settings.get(iface).copied()
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    /// Switch to configuration `value` and claim all of its interfaces
    ///
    /// Drivers are detached and interfaces released before the change. If
    /// any interface fails to claim, everything claimed is released and the
    /// configuration is left unset.
    pub fn set_config(&mut self, value: u8) -> Result<()> {
        let path = self.info.path.clone();

        if let Ok(layout) = self.native.active_config() {
            if let Err(e) = self.detach_drivers(&layout, &mut Vec::new()) {
                debug!("{}: detach before set config: {}", path, e);
            }
            if let Err(e) = self.release_interfaces(&layout) {
                debug!("{}: release before set config: {}", path, e);
            }
        }

        if let Err(e) = self.native.set_configuration(value) {
            warn!("{}: fail to set config {}: {}", path, value, e);
            self.configuration = None;
            return Err(e.into());
        }

        let layout = match self.native.active_config() {
            Ok(layout) => layout,
            Err(e) => {
                warn!("{}: fail to get config: {}", path, e);
                self.configuration = None;
                return Err(e.into());
            }
        };

        if let Err(e) = self.claim_interfaces(&layout) {
            warn!("{}: fail to claim interfaces: {}", path, e);
            if let Err(e) = self.release_interfaces(&layout) {
                warn!("{}: rollback release failed: {}", path, e);
            }
            self.configuration = None;
            return Err(e.into());
        }

        self.interface_count = layout.interfaces.len();
        self.configuration = Some(value);
        self.alt_settings = [0; MAX_INTERFACES];
        self.endpoints.rebuild(&layout, &self.alt_settings);

        debug!(
            "{}: configuration {} with {} interfaces",
            path, value, self.interface_count
        );
        Ok(())
    }

    /// Select alternate setting `alt` on interface `iface`
    pub fn set_interface(&mut self, iface: u16, alt: u16) -> Result<()> {
        let index = iface as usize;
        if index >= MAX_INTERFACES {
            return Err(PortMapperError::InterfaceOutOfRange(iface));
        }

        debug!("{}: set if, iface {} alt {}", self.info.path, iface, alt);
        self.native
            .set_alternate_setting(iface as u8, alt as u8)
            .inspect_err(|e| {
                debug!(
                    "{}: fail to set if, iface {} alt {}: {}",
                    self.info.path, iface, alt, e
                );
            })?;

        self.alt_settings[index] = alt as u8;
        self.refresh_endpoints();
        Ok(())
    }

    /// Reset the physical device
    ///
    /// Issues two resets, rebuilding the endpoint table after each, and
    /// reports the second one's result.
    pub fn reset(&mut self) -> Result<()> {
        debug!("{}: reset endpoints", self.info.path);

        if let Err(e) = self.native.reset() {
            debug!("{}: first reset attempt: {}", self.info.path, e);
        }
        self.refresh_endpoints();

        let result = self.native.reset();
        self.refresh_endpoints();

        result.map_err(|e| {
            warn!("{}: reset failed: {}", self.info.path, e);
            e.into()
        })
    }

    /// Read one descriptive field
    pub fn info_query(&self, field: InfoField) -> InfoValue {
        match field {
            InfoField::Version => InfoValue::Version(self.version),
            InfoField::Speed => InfoValue::Speed(self.info.speed),
            InfoField::Bus => InfoValue::Bus(self.info.path.bus()),
            InfoField::Port => InfoValue::Port(self.info.path.root_port()),
            InfoField::VendorId => InfoValue::VendorId(self.info.vendor_id),
            InfoField::ProductId => InfoValue::ProductId(self.info.product_id),
        }
    }

    /// Hand the device back to the kernel and close it
    pub fn deinit(mut self) {
        let path = self.info.path.clone();
        match self.native.active_config() {
            Ok(layout) => {
                if let Err(e) = self.release_interfaces(&layout) {
                    debug!("{}: release on close: {}", path, e);
                }
                self.reattach_drivers(layout.interface_numbers());
            }
            Err(e) => warn!("{}: fail to attach if drivers: {}", path, e),
        }
        debug!("{}: closed", path);
    }

    /// Reload the endpoint table from the active configuration
    pub(crate) fn refresh_endpoints(&mut self) {
        match self.native.active_config() {
            Ok(layout) => self.endpoints.rebuild(&layout, &self.alt_settings),
            Err(e) => {
                debug!("{}: no active config: {}", self.info.path, e);
                self.endpoints.reset();
            }
        }
    }

    /// Hand interfaces back to their kernel drivers, best effort
    fn reattach_drivers(&mut self, interfaces: impl IntoIterator<Item = u8>) {
        for iface in interfaces {
            match self.native.attach_kernel_driver(iface) {
                Ok(()) => debug!("{}: reattached kernel driver to interface {}", self.info.path, iface),
                Err(e) => debug!(
                    "{}: could not reattach kernel driver to interface {}: {}",
                    self.info.path, iface, e
                ),
            }
        }
    }

    /// Detach every active kernel driver, recording each interface
    /// detached; the first failure is returned after all interfaces have
    /// been tried
    fn detach_drivers(
        &mut self,
        layout: &ConfigLayout,
        detached: &mut Vec<u8>,
    ) -> std::result::Result<(), rusb::Error> {
        let mut result = Ok(());
        for iface in layout.interface_numbers() {
            // NotSupported platforms have no kernel drivers to detach
            if !matches!(self.native.kernel_driver_active(iface), Ok(true)) {
                continue;
            }
            debug!("{}: detaching kernel driver from interface {}", self.info.path, iface);
            match self.native.detach_kernel_driver(iface) {
                Ok(()) => detached.push(iface),
                Err(e) => {
                    warn!(
                        "{}:{}.{} can't detach if driver: {}",
                        self.info.path, layout.value, iface, e
                    );
                    result = result.and(Err(e));
                }
            }
        }
        result
    }

    fn claim_interfaces(&mut self, layout: &ConfigLayout) -> std::result::Result<(), rusb::Error> {
        let mut result = Ok(());
        for iface in layout.interface_numbers() {
            if let Err(e) = self.native.claim_interface(iface) {
                warn!(
                    "{}:{}.{} can't claim if: {}",
                    self.info.path, layout.value, iface, e
                );
                result = result.and(Err(e));
            }
        }
        result
    }

    fn release_interfaces(&mut self, layout: &ConfigLayout) -> std::result::Result<(), rusb::Error> {
        let mut result = Ok(());
        for iface in layout.interface_numbers() {
            match self.native.release_interface(iface) {
                // Never claimed
                Ok(()) | Err(rusb::Error::NotFound) => {}
                Err(e) => {
                    warn!(
                        "{}:{}.{} can't release if: {}",
                        self.info.path, layout.value, iface, e
                    );
                    result = result.and(Err(e));
                }
            }
        }
        result
    }
}
