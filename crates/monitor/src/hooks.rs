//! Controller hooks that forward port-mapper activity to the printer task

use common::EventSink;
use pmapper::{DeviceInfo, DevicePath, PortMapperHooks, SharedQueue, lock_queue};
use serde::Serialize;
use tracing::trace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Connected(DeviceInfo),
    Disconnected(DeviceInfo),
    Completed { device: String, status: String },
}

/// Stand-in for a virtual host controller
///
/// Nothing is ever submitted, so completions only show up if a front end
/// built on top opens devices.
pub struct MonitorHooks {
    events: EventSink<MonitorEvent>,
}

impl MonitorHooks {
    pub fn new(events: EventSink<MonitorEvent>) -> Self {
        Self { events }
    }
}

impl PortMapperHooks for MonitorHooks {
    fn connect(&self, info: &DeviceInfo) {
        self.events.publish(MonitorEvent::Connected(info.clone()));
    }

    fn disconnect(&self, info: &DeviceInfo) {
        self.events.publish(MonitorEvent::Disconnected(info.clone()));
    }

    fn notify(&self, device: &DevicePath, queue: &SharedQueue) -> bool {
        let status = lock_queue(queue).status();
        self.events.publish(MonitorEvent::Completed {
            device: device.to_string(),
            status: status.to_string(),
        });
        false
    }

    fn interrupt(&self, _device: &DevicePath) {}

    fn lock_endpoint(&self, device: &DevicePath, endpoint_id: u8) {
        trace!("{}: lock endpoint {}", device, endpoint_id);
    }

    fn unlock_endpoint(&self, device: &DevicePath, endpoint_id: u8) {
        trace!("{}: unlock endpoint {}", device, endpoint_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::create_event_bridge;
    use pmapper::{TransferQueue, UsbStatus};
    use pmapper::test_utils::create_mock_device_info;

    #[test]
    fn test_events_forwarded() {
        let (sink, bridge) = create_event_bridge(8);
        let hooks = MonitorHooks::new(sink);
        let info = create_mock_device_info(1, &[2], 0x046d, 0xc52b);

        hooks.connect(&info);
        let mut queue = TransferQueue::new(1, 2);
        queue.set_status(UsbStatus::Stalled);
        assert!(!hooks.notify(&info.path, &queue.into_shared()));
        hooks.disconnect(&info);

        assert!(matches!(bridge.try_recv(), Some(MonitorEvent::Connected(i)) if i == info));
        match bridge.try_recv() {
            Some(MonitorEvent::Completed { device, status }) => {
                assert_eq!(device, "1-2");
                assert_eq!(status, UsbStatus::Stalled.to_string());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(bridge.try_recv(), Some(MonitorEvent::Disconnected(_))));
    }

    #[test]
    fn test_connected_event_json() {
        let info = create_mock_device_info(1, &[2], 0x046d, 0xc52b);
        let json = serde_json::to_value(MonitorEvent::Connected(info)).unwrap();
        assert_eq!(json["event"], "connected");
        assert_eq!(json["vendor_id"], 0x046d);
    }
}
