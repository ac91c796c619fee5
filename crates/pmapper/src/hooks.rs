//! Callbacks into the virtual host controller

use crate::queue::SharedQueue;
use crate::types::{DeviceInfo, DevicePath};

/// Capabilities the virtual controller supplies to the port mapper
///
/// Hotplug and completion-side calls run on the runtime's polling thread;
/// the initial `connect` calls run on the thread calling `sys_init`. No engine lock is held while a hook runs, so
/// hooks may take their own endpoint lock and then the queue mutex.
pub trait PortMapperHooks: Send + Sync {
    /// A physical device appeared (initial scan or hotplug)
    fn connect(&self, info: &DeviceInfo);

    /// A physical device went away
    fn disconnect(&self, info: &DeviceInfo);

    /// A transfer on `queue` finished; returns whether the guest should be
    /// interrupted
    ///
    /// The queue is unlocked; use [`crate::queue::lock_queue`] to read it.
    fn notify(&self, device: &DevicePath, queue: &SharedQueue) -> bool;

    /// Deliver a guest interrupt
    fn interrupt(&self, device: &DevicePath);

    /// Brackets block mutation by a completion
    fn lock_endpoint(&self, device: &DevicePath, endpoint_id: u8);

    fn unlock_endpoint(&self, device: &DevicePath, endpoint_id: u8);
}
