//! Device identity and classification types

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Tier limit of the native host controller
pub const MAX_TIERS: usize = 7;

/// USB class code of hubs
pub const CLASS_HUB: u8 = 0x09;

/// Position of a device in the physical hub tree
///
/// `ports` runs root to leaf; its length is the device depth. The synthetic
/// root-hub node has no ports (depth 0).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevicePath {
    bus: u8,
    ports: Vec<u8>,
}

impl DevicePath {
    /// Build a path, rejecting anything deeper than [`MAX_TIERS`]
    pub fn new(bus: u8, ports: &[u8]) -> Option<Self> {
        if ports.len() > MAX_TIERS {
            return None;
        }
        Some(Self {
            bus,
            ports: ports.to_vec(),
        })
    }

    pub fn root_hub(bus: u8) -> Self {
        Self {
            bus,
            ports: Vec::new(),
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn ports(&self) -> &[u8] {
        &self.ports
    }

    pub fn depth(&self) -> usize {
        self.ports.len()
    }

    /// Port on the root hub, 0 for the root hub itself
    pub fn root_port(&self) -> u8 {
        self.ports.first().copied().unwrap_or(0)
    }

    pub fn is_root_hub(&self) -> bool {
        self.root_port() == 0
    }

    /// Whether `self` sits strictly below `other` in the tree
    pub fn is_descendant_of(&self, other: &DevicePath) -> bool {
        self.bus == other.bus
            && self.ports.len() > other.ports.len()
            && self.ports.starts_with(&other.ports)
    }

    /// Kernel device name, e.g. `1-2.4`
    pub fn sysfs_name(&self) -> String {
        if self.is_root_hub() {
            return format!("usb{}", self.bus);
        }
        let ports: Vec<String> = self.ports.iter().map(|p| p.to_string()).collect();
        format!("{}-{}", self.bus, ports.join("."))
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ports.is_empty() {
            return write!(f, "{}-0", self.bus);
        }
        write!(f, "{}-", self.bus)?;
        for (i, port) in self.ports.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

/// Where a device sits relative to hubs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    RootHub,
    RootHubSubdevice,
    ExternalHub,
    ExternalHubSubdevice,
}

impl DeviceType {
    pub fn classify(path: &DevicePath, device_class: u8) -> Self {
        if path.is_root_hub() {
            Self::RootHub
        } else if device_class == CLASS_HUB {
            Self::ExternalHub
        } else if path.depth() == 1 {
            Self::RootHubSubdevice
        } else {
            Self::ExternalHubSubdevice
        }
    }
}

/// Negotiated bus speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbSpeed {
    Unknown,
    Low,
    Full,
    High,
    Super,
}

/// Map rusb device speed to the speeds the virtual controller emulates
pub fn map_device_speed(speed: rusb::Speed) -> UsbSpeed {
    match speed {
        rusb::Speed::Low => UsbSpeed::Low,
        rusb::Speed::Full => UsbSpeed::Full,
        rusb::Speed::High => UsbSpeed::High,
        rusb::Speed::Super | rusb::Speed::SuperPlus => UsbSpeed::Super,
        other => {
            warn!("Unexpected device speed {:?}", other);
            UsbSpeed::Unknown
        }
    }
}

/// Major USB version the virtual controller emulates for a bcdUSB word
///
/// USB 1.1 devices are emulated as USB 2 since the virtual xHCI has no
/// separate 1.x path.
pub fn usb_major_version(bcd_usb: u16) -> Option<u8> {
    match bcd_usb {
        0x300 | 0x310 | 0x320 => Some(3),
        0x200 | 0x201 | 0x210 | 0x110 => Some(2),
        _ => None,
    }
}

/// Snapshot of a physical device as discovered
///
/// Never mutated after creation; a reconnect produces a fresh instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: DevicePath,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdUSB from the device descriptor
    pub bcd_usb: u16,
    pub speed: UsbSpeed,
    pub device_type: DeviceType,
    /// Downstream port count, external hubs only
    pub max_child: Option<u8>,
}

impl DeviceInfo {
    pub fn is_hub(&self) -> bool {
        matches!(self.device_type, DeviceType::RootHub | DeviceType::ExternalHub)
    }
}

/// Transfer direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
}

impl Direction {
    pub fn from_endpoint_address(address: u8) -> Self {
        if address & 0x80 != 0 { Self::In } else { Self::Out }
    }

    /// Endpoint address for an endpoint number in this direction
    pub fn endpoint_address(self, number: u8) -> u8 {
        match self {
            Self::In => 0x80 | (number & 0x0f),
            Self::Out => number & 0x0f,
        }
    }
}

/// Transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EndpointType {
    #[default]
    None,
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl From<rusb::TransferType> for EndpointType {
    fn from(kind: rusb::TransferType) -> Self {
        match kind {
            rusb::TransferType::Control => Self::Control,
            rusb::TransferType::Isochronous => Self::Isochronous,
            rusb::TransferType::Bulk => Self::Bulk,
            rusb::TransferType::Interrupt => Self::Interrupt,
        }
    }
}

/// Fields exposed through `info_query`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoField {
    Version,
    Speed,
    Bus,
    Port,
    VendorId,
    ProductId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoValue {
    Version(u8),
    Speed(UsbSpeed),
    Bus(u8),
    Port(u8),
    VendorId(u16),
    ProductId(u16),
}
