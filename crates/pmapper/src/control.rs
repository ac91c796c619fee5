//! Control-request interception
//!
//! Standard requests that change device state the guest must see
//! virtualized (address, configuration, interface, endpoint halt) are
//! handled locally. Everything else goes to the physical control pipe.

use crate::device::VirtualDevice;
use crate::error::{UsbStatus, map_rusb_error};
use crate::queue::{BlockStatus, ControlRequest, TransferQueue};
use tracing::{debug, error, warn};

pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const REQUEST_SET_ADDRESS: u8 = 0x05;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

pub const TYPE_WRITE_DEVICE: u8 = 0x00;
pub const TYPE_WRITE_INTERFACE: u8 = 0x01;
pub const TYPE_WRITE_ENDPOINT: u8 = 0x02;
pub const TYPE_READ_DEVICE: u8 = 0x80;

/// wValue of Get-Descriptor(Configuration, index 0)
const CONFIG_DESCRIPTOR: u16 = 0x0200;

const DESC_CONFIG: u8 = 0x02;
const DESC_INTERFACE: u8 = 0x04;
const INTERFACE_DESC_LEN: u8 = 9;
const PROTOCOL_UAS: u8 = 0x62;

/// How a setup packet is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    SetAddress,
    SetConfiguration,
    SetInterface,
    ClearHalt,
    Forward { strip_uas: bool },
}

fn classify(setup: &ControlRequest) -> Action {
    match (setup.request, setup.request_type) {
        (REQUEST_SET_ADDRESS, TYPE_WRITE_DEVICE) => Action::SetAddress,
        (REQUEST_SET_CONFIGURATION, TYPE_WRITE_DEVICE) => Action::SetConfiguration,
        (REQUEST_SET_INTERFACE, TYPE_WRITE_INTERFACE) => Action::SetInterface,
        (REQUEST_GET_DESCRIPTOR, TYPE_READ_DEVICE) => Action::Forward {
            strip_uas: setup.value == CONFIG_DESCRIPTOR,
        },
        (REQUEST_CLEAR_FEATURE, TYPE_WRITE_ENDPOINT) if setup.value == 0 => Action::ClearHalt,
        (REQUEST_CLEAR_FEATURE, TYPE_WRITE_ENDPOINT) => {
            warn!("Clear Feature request with non-zero value {}", setup.value);
            Action::Forward { strip_uas: false }
        }
        _ => Action::Forward { strip_uas: false },
    }
}

/// Mark every block of a control queue Handled, returning the slot of the
/// data stage (the first block with a non-zero length)
pub fn prepare_control(queue: &mut TransferQueue) -> Option<usize> {
    let mut data_stage = None;
    for slot in queue.live_slots() {
        let block = queue.block_mut(slot);
        if data_stage.is_none() && block.remaining() > 0 {
            data_stage = Some(slot);
        }
        block.advance(BlockStatus::Handled);
    }
    data_stage
}

/// Neutralize USB Attached SCSI in a configuration descriptor
///
/// Rewrites the protocol byte of every interface descriptor advertising
/// UAS to 0. Returns the number of descriptors changed.
pub fn strip_uas_protocol(data: &mut [u8]) -> usize {
    if data.len() < 2 || data[1] != DESC_CONFIG {
        return 0;
    }

    let mut cleared = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        let len = data[i];
        if len == 0 {
            break;
        }
        if len == INTERFACE_DESC_LEN
            && data[i + 1] == DESC_INTERFACE
            && data.get(i + 7) == Some(&PROTOCOL_UAS)
        {
            data[i + 7] = 0;
            cleared += 1;
        }
        i += len as usize;
    }
    cleared
}

impl VirtualDevice {
    /// Run the control transfer described by the queue's setup packet
    ///
    /// Completes synchronously; the returned status is also stored on the
    /// queue.
    pub fn submit_control(&mut self, queue: &mut TransferQueue) -> UsbStatus {
        let status = self.run_control(queue);
        queue.set_status(status);
        status
    }

    fn run_control(&mut self, queue: &mut TransferQueue) -> UsbStatus {
        let Some(setup) = queue.setup() else {
            warn!("{}: invalid request, no setup packet", self.info.path);
            return UsbStatus::IoError;
        };

        let data_stage = prepare_control(queue);

        debug!(
            "{}: urb: type {:#04x} req {:#04x} val {:#06x} idx {} len {} data {}",
            self.info.path,
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length,
            data_stage
                .and_then(|slot| queue.block(slot))
                .map_or(0, |b| b.remaining())
        );

        // A data stage exists exactly when wLength is non-zero
        if data_stage.is_some() != (setup.length > 0) {
            return UsbStatus::NormalCompletion;
        }

        let strip_uas = match classify(&setup) {
            Action::SetAddress => {
                debug!("{}: set address {}", self.info.path, setup.value);
                self.address = setup.value;
                return UsbStatus::NormalCompletion;
            }
            Action::SetConfiguration => {
                return match self.set_config((setup.value & 0xff) as u8) {
                    Ok(()) => UsbStatus::NormalCompletion,
                    Err(_) => UsbStatus::Stalled,
                };
            }
            Action::SetInterface => {
                return match self.set_interface(setup.index, setup.value) {
                    Ok(()) => UsbStatus::NormalCompletion,
                    Err(_) => UsbStatus::Stalled,
                };
            }
            Action::ClearHalt => {
                debug!("{}: clear halt on {:#04x}", self.info.path, setup.index);
                if let Err(e) = self.native.clear_halt(setup.index as u8) {
                    warn!("{}: fail to clear halted ep: {}", self.info.path, e);
                }
                return UsbStatus::NormalCompletion;
            }
            Action::Forward { strip_uas } => strip_uas,
        };

        let requested = setup.length as usize;
        let timeout = self.control_timeout;
        let native = &mut self.native;

        let result = match data_stage {
            None => {
                if setup.is_in() {
                    native.read_control(&setup, &mut [], timeout)
                } else {
                    native.write_control(&setup, &[], timeout)
                }
            }
            Some(slot) => {
                let block = queue.block_mut(slot);
                let buf = block.buffer_mut();
                if buf.is_empty() {
                    error!("{}: unexpected empty data stage", self.info.path);
                    return UsbStatus::IoError;
                }
                let len = requested.min(buf.len());
                let result = if setup.is_in() {
                    native.read_control(&setup, &mut buf[..len], timeout)
                } else {
                    native.write_control(&setup, &buf[..len], timeout)
                };
                if let Ok(moved) = result
                    && strip_uas
                    && strip_uas_protocol(&mut buf[..moved.min(len)]) > 0
                {
                    warn!("{}: clear uas protocol", self.info.path);
                }
                result
            }
        };

        let moved = match result {
            Ok(moved) => moved,
            Err(e) => {
                debug!("{}: control transfer failed: {}", self.info.path, e);
                return map_rusb_error(e);
            }
        };

        let Some(slot) = data_stage else {
            return UsbStatus::NormalCompletion;
        };
        let block = queue.block_mut(slot);
        block.settle(requested, moved);
        debug!(
            "{}: usb rc {}, remaining {} done {}",
            self.info.path,
            moved,
            block.remaining(),
            block.done()
        );
        if block.remaining() > 0 {
            UsbStatus::ShortTransfer
        } else {
            UsbStatus::NormalCompletion
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Block, BlockRole};

    fn interface_desc(protocol: u8) -> [u8; 9] {
        [9, DESC_INTERFACE, 0, 0, 2, 0x08, 0x06, protocol, 0]
    }

    #[test]
    fn test_strip_uas_only_touches_uas() {
        let mut desc = vec![9, DESC_CONFIG, 32, 0, 2, 1, 0, 0x80, 50];
        desc.extend_from_slice(&interface_desc(0x50));
        desc.extend_from_slice(&interface_desc(PROTOCOL_UAS));
        let mut expected = desc.clone();
        expected[25] = 0;

        assert_eq!(strip_uas_protocol(&mut desc), 1);
        assert_eq!(desc, expected);
    }

    #[test]
    fn test_strip_uas_ignores_other_descriptors() {
        let mut device_desc = vec![18, 0x01, 0x00, 0x02, 0, 0, 0, 64, 9, 4, 0, 0, 0, 0x62];
        let before = device_desc.clone();
        assert_eq!(strip_uas_protocol(&mut device_desc), 0);
        assert_eq!(device_desc, before);
    }

    #[test]
    fn test_strip_uas_truncated() {
        // Interface descriptor cut short before its protocol byte
        let mut desc = vec![9, DESC_CONFIG, 14, 0, 1, 1, 0, 0x80, 50, 9, DESC_INTERFACE, 0, 0, 2];
        assert_eq!(strip_uas_protocol(&mut desc), 0);

        let mut zero_len = vec![9, DESC_CONFIG, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(strip_uas_protocol(&mut zero_len), 0);
    }

    #[test]
    fn test_prepare_control_finds_data_stage() {
        let mut queue = TransferQueue::new(1, 4);
        queue.push(Block::placeholder()).unwrap();
        queue.push(Block::receive(18, BlockRole::Full)).unwrap();
        queue.push(Block::placeholder()).unwrap();

        assert_eq!(prepare_control(&mut queue), Some(1));
        assert!(queue.blocks().all(|b| b.status() == BlockStatus::Handled));
    }

    #[test]
    fn test_classify() {
        let setup = |request, request_type, value| ControlRequest {
            request_type,
            request,
            value,
            index: 0,
            length: 0,
        };
        assert_eq!(
            classify(&setup(REQUEST_SET_ADDRESS, TYPE_WRITE_DEVICE, 3)),
            Action::SetAddress
        );
        assert_eq!(
            classify(&setup(REQUEST_GET_DESCRIPTOR, TYPE_READ_DEVICE, 0x0200)),
            Action::Forward { strip_uas: true }
        );
        assert_eq!(
            classify(&setup(REQUEST_GET_DESCRIPTOR, TYPE_READ_DEVICE, 0x0100)),
            Action::Forward { strip_uas: false }
        );
        assert_eq!(
            classify(&setup(REQUEST_CLEAR_FEATURE, TYPE_WRITE_ENDPOINT, 0)),
            Action::ClearHalt
        );
        assert_eq!(
            classify(&setup(REQUEST_CLEAR_FEATURE, TYPE_WRITE_ENDPOINT, 1)),
            Action::Forward { strip_uas: false }
        );
    }
}
