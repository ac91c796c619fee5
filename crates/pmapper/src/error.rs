//! Error types and the transfer status taxonomy
//!
//! [`UsbStatus`] is what the virtual controller sees: it is attached to a
//! transfer queue after every submission and completion. [`PortMapperError`]
//! is returned by lifecycle and runtime operations and always maps onto a
//! [`UsbStatus`] via [`PortMapperError::status`].

use std::fmt;
use thiserror::Error;

/// Outcome of a transfer as reported to the virtual controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UsbStatus {
    #[default]
    NormalCompletion,
    /// Fewer bytes than requested; not an error
    ShortTransfer,
    /// Endpoint halt or protocol stall
    Stalled,
    Timeout,
    /// Generic transport failure, including device removal mid-transfer
    IoError,
    /// Native buffer overflow
    BadBufferSize,
    /// Resource busy
    InUse,
    /// Unrecognized endpoint type or malformed request
    InvalidArgument,
}

impl UsbStatus {
    /// Whether the transfer moved data successfully (possibly short)
    pub fn is_success(self) -> bool {
        matches!(self, Self::NormalCompletion | Self::ShortTransfer)
    }
}

impl fmt::Display for UsbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NormalCompletion => "normal completion",
            Self::ShortTransfer => "short transfer",
            Self::Stalled => "stalled",
            Self::Timeout => "timeout",
            Self::IoError => "I/O error",
            Self::BadBufferSize => "bad buffer size",
            Self::InUse => "in use",
            Self::InvalidArgument => "invalid argument",
        };
        f.write_str(name)
    }
}

/// Lifecycle and runtime errors
#[derive(Debug, Error)]
pub enum PortMapperError {
    /// `sys_init` called on a live runtime
    #[error("Port mapper is already initialized")]
    AlreadyInitialized,

    #[error("Port mapper is not initialized")]
    NotInitialized,

    /// The synthetic root-hub node is not an attachable device
    #[error("Root hub {0} cannot be attached")]
    RootHub(String),

    #[error("Unsupported USB version {0:#06x}")]
    UnsupportedVersion(u16),

    #[error("Interface {0} out of range")]
    InterfaceOutOfRange(u16),

    #[error("Device {0} not found")]
    DeviceNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Failed to spawn polling thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl PortMapperError {
    /// Map onto the transfer status taxonomy
    pub fn status(&self) -> UsbStatus {
        match self {
            Self::AlreadyInitialized => UsbStatus::InUse,
            Self::NotInitialized | Self::Thread(_) | Self::DeviceNotFound(_) => UsbStatus::IoError,
            Self::RootHub(_)
            | Self::UnsupportedVersion(_)
            | Self::InterfaceOutOfRange(_)
            | Self::Config(_) => UsbStatus::InvalidArgument,
            Self::Usb(e) => map_rusb_error(*e),
        }
    }
}

pub type Result<T> = std::result::Result<T, PortMapperError>;

/// Map a native error code onto the status taxonomy
pub fn map_rusb_error(err: rusb::Error) -> UsbStatus {
    match err {
        rusb::Error::Timeout => UsbStatus::Timeout,
        rusb::Error::Pipe => UsbStatus::Stalled,
        rusb::Error::NoDevice => UsbStatus::IoError,
        rusb::Error::Busy => UsbStatus::InUse,
        rusb::Error::Overflow => UsbStatus::BadBufferSize,
        rusb::Error::Io => UsbStatus::IoError,
        _ => UsbStatus::IoError,
    }
}
