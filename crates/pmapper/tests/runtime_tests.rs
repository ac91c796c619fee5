//! Integration tests for the port-mapper runtime
//!
//! Runs the polling thread against MockHost, whose event service blocks on
//! a condvar until woken or timed out.

use pmapper::test_utils::{
    HookCall, MockDevice, MockHost, RecordingHooks, create_mock_device_info, create_mock_hub_info,
    create_root_hub_info, endpoint, simple_config,
};
use pmapper::{
    Block, BlockRole, DeviceInfo, DevicePath, Direction, EndpointType, PortMapper,
    PortMapperError, PortMapperHooks, RuntimeConfig, SharedQueue, TransferQueue, UsbStatus,
};
use std::sync::{Arc, Mutex, OnceLock, Weak, mpsc};
use std::time::{Duration, Instant};

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        poll_timeout_ms: 20,
        error_backoff_ms: 5,
        ..Default::default()
    }
}

fn mapper(host: &MockHost, hooks: &Arc<RecordingHooks>) -> PortMapper<MockHost> {
    let host = host.clone();
    PortMapper::with_host(hooks.clone(), fast_config(), move |_| Ok(host.clone()))
}

/// Poll `condition` for up to two seconds
fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

mod lifecycle {
    use super::*;

    #[test]
    fn test_initial_scan_reported_before_return() {
        let host = MockHost::new(vec![
            create_mock_device_info(1, &[2, 1], 0x0002, 0x0001),
            create_root_hub_info(1),
            create_mock_hub_info(1, &[2], 4),
        ]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        pm.sys_init().unwrap();

        let depths: Vec<usize> = hooks.connected().iter().map(|i| i.path.depth()).collect();
        assert_eq!(depths, vec![1, 2]);
        assert_eq!(pm.devices().len(), 3);
        pm.sys_deinit();
    }

    #[test]
    fn test_double_init_rejected() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        pm.sys_init().unwrap();
        let err = pm.sys_init().unwrap_err();
        assert!(matches!(err, PortMapperError::AlreadyInitialized));
        assert_eq!(err.status(), UsbStatus::InUse);
        assert!(pm.is_initialized());
        assert_eq!(host.live_registrations(), 1);
    }

    #[test]
    fn test_deinit_is_idempotent() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        pm.sys_deinit();
        pm.sys_init().unwrap();
        pm.sys_deinit();
        pm.sys_deinit();
        assert!(!pm.is_initialized());
        assert!(pm.devices().is_empty());
    }

    #[test]
    fn test_restart_after_deinit() {
        let host = MockHost::new(vec![create_mock_device_info(1, &[1], 1, 1)]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        pm.sys_init().unwrap();
        pm.sys_deinit();
        pm.sys_init().unwrap();

        assert_eq!(hooks.connected().len(), 2);
        assert_eq!(host.live_registrations(), 1);
    }

    #[test]
    fn test_context_failure() {
        let hooks = RecordingHooks::new();
        let pm: PortMapper<MockHost> =
            PortMapper::with_host(hooks.clone(), fast_config(), |_| Err(rusb::Error::Access));

        let err = pm.sys_init().unwrap_err();
        assert_eq!(err.status(), UsbStatus::IoError);
        assert!(!pm.is_initialized());
    }

    #[test]
    fn test_hotplug_registration_failure_fails_init() {
        let host = MockHost::new(vec![]);
        host.state().hotplug_error = Some(rusb::Error::NotSupported);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        assert!(pm.sys_init().is_err());
        assert!(!pm.is_initialized());
        assert_eq!(host.polls(), 0);
    }

    #[test]
    fn test_enumeration_failure_is_not_fatal() {
        let host = MockHost::new(vec![create_mock_device_info(1, &[1], 1, 1)]);
        host.state().enumerate_error = Some(rusb::Error::Io);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        pm.sys_init().unwrap();
        assert!(hooks.connected().is_empty());
        assert!(pm.is_initialized());
    }

    /// Controller that opens every device reported to it
    #[derive(Default)]
    struct AttachingHooks {
        mapper: OnceLock<Weak<PortMapper<MockHost>>>,
        opened: Mutex<Vec<DevicePath>>,
    }

    impl PortMapperHooks for AttachingHooks {
        fn connect(&self, info: &DeviceInfo) {
            let Some(mapper) = self.mapper.get().and_then(Weak::upgrade) else {
                return;
            };
            if let Ok(device) = mapper.open_device(info) {
                self.opened.lock().unwrap().push(device.info().path.clone());
            }
        }

        fn disconnect(&self, _info: &DeviceInfo) {}

        fn notify(&self, _device: &DevicePath, _queue: &SharedQueue) -> bool {
            false
        }

        fn interrupt(&self, _device: &DevicePath) {}

        fn lock_endpoint(&self, _device: &DevicePath, _endpoint_id: u8) {}

        fn unlock_endpoint(&self, _device: &DevicePath, _endpoint_id: u8) {}
    }

    #[test]
    fn test_connect_can_open_device_during_init() {
        let info = create_mock_device_info(1, &[2], 0x0781, 0x5581);
        let host = MockHost::new(vec![info.clone()]);
        host.add_native(
            &info,
            MockDevice::new(vec![simple_config(
                1,
                vec![vec![endpoint(0x81, EndpointType::Bulk, 512)]],
            )]),
        );
        let hooks = Arc::new(AttachingHooks::default());
        let pm = {
            let host = host.clone();
            Arc::new(PortMapper::with_host(hooks.clone(), fast_config(), move |_| {
                Ok(host.clone())
            }))
        };
        hooks.mapper.set(Arc::downgrade(&pm)).unwrap();

        let (tx, rx) = mpsc::channel();
        let init = Arc::clone(&pm);
        std::thread::spawn(move || {
            let _ = tx.send(init.sys_init());
        });

        let result = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("sys_init did not return");
        assert!(result.is_ok());
        assert_eq!(*hooks.opened.lock().unwrap(), vec![info.path.clone()]);
        assert!(pm.is_initialized());

        pm.sys_deinit();
        assert!(!pm.is_initialized());
    }

    #[test]
    fn test_deinit_during_scan_stops_runtime() {
        let info = create_mock_device_info(1, &[2], 0x0781, 0x5581);
        let host = MockHost::new(vec![info]);
        let hooks = Arc::new(StoppingHooks::default());
        let pm = {
            let host = host.clone();
            Arc::new(PortMapper::with_host(hooks.clone(), fast_config(), move |_| {
                Ok(host.clone())
            }))
        };
        hooks.mapper.set(Arc::downgrade(&pm)).unwrap();

        pm.sys_init().unwrap();
        assert!(!pm.is_initialized());

        let polls = host.polls();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(host.polls(), polls);
    }

    /// Controller that shuts the runtime down from its first `connect`
    #[derive(Default)]
    struct StoppingHooks {
        mapper: OnceLock<Weak<PortMapper<MockHost>>>,
    }

    impl PortMapperHooks for StoppingHooks {
        fn connect(&self, _info: &DeviceInfo) {
            if let Some(mapper) = self.mapper.get().and_then(Weak::upgrade) {
                mapper.sys_deinit();
            }
        }

        fn disconnect(&self, _info: &DeviceInfo) {}

        fn notify(&self, _device: &DevicePath, _queue: &SharedQueue) -> bool {
            false
        }

        fn interrupt(&self, _device: &DevicePath) {}

        fn lock_endpoint(&self, _device: &DevicePath, _endpoint_id: u8) {}

        fn unlock_endpoint(&self, _device: &DevicePath, _endpoint_id: u8) {}
    }
}

mod hotplug {
    use super::*;

    #[test]
    fn test_events_reach_hooks() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        let info = create_mock_device_info(3, &[1], 0x1050, 0x0407);
        assert!(host.emit_arrival(&info));
        assert!(host.emit_departure(&info));

        assert_eq!(
            hooks.calls(),
            vec![
                HookCall::Connect(info.path.clone()),
                HookCall::Disconnect(info.path),
            ]
        );
    }

    #[test]
    fn test_no_callbacks_after_deinit() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();
        pm.sys_deinit();

        assert_eq!(host.live_registrations(), 0);
        assert!(!host.emit_arrival(&create_mock_device_info(1, &[1], 1, 1)));
        assert!(hooks.calls().is_empty());
    }

    #[test]
    fn test_drop_deregisters() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        {
            let pm = mapper(&host, &hooks);
            pm.sys_init().unwrap();
        }
        assert_eq!(host.live_registrations(), 0);
    }
}

mod polling {
    use super::*;

    #[test]
    fn test_thread_keeps_polling() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        assert!(wait_for(|| host.polls() >= 3));
        pm.sys_deinit();

        let after = host.polls();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(host.polls(), after);
    }

    #[test]
    fn test_survives_event_errors() {
        let host = MockHost::new(vec![]);
        host.state()
            .event_errors
            .extend([rusb::Error::Io, rusb::Error::Interrupted, rusb::Error::Io]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        assert!(wait_for(|| host.polls() >= 5));
        assert!(pm.is_initialized());
    }

    #[test]
    fn test_deinit_wakes_blocked_thread() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let config = RuntimeConfig {
            poll_timeout_ms: 60_000,
            ..fast_config()
        };
        let opener_host = host.clone();
        let pm = PortMapper::with_host(hooks.clone(), config, move |_| Ok(opener_host.clone()));
        pm.sys_init().unwrap();
        assert!(wait_for(|| host.polls() >= 1));

        let start = Instant::now();
        pm.sys_deinit();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(host.state().wakes >= 1);
    }
}

mod devices {
    use super::*;

    fn storage_config() -> pmapper::ConfigLayout {
        simple_config(
            1,
            vec![vec![
                endpoint(0x81, EndpointType::Bulk, 512),
                endpoint(0x02, EndpointType::Bulk, 512),
            ]],
        )
    }

    #[test]
    fn test_open_device() {
        let info = create_mock_device_info(1, &[4], 0x0781, 0x5581);
        let host = MockHost::new(vec![info.clone()]);
        host.add_native(&info, MockDevice::new(vec![storage_config()]));
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        let device = pm.open_device(&info).unwrap();
        assert_eq!(device.info(), &info);
        assert_eq!(device.version(), 2);
    }

    #[test]
    fn test_open_requires_running_runtime() {
        let info = create_mock_device_info(1, &[4], 0x0781, 0x5581);
        let host = MockHost::new(vec![info.clone()]);
        host.add_native(&info, MockDevice::new(vec![storage_config()]));
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);

        let err = pm.open_device(&info).unwrap_err();
        assert!(matches!(err, PortMapperError::NotInitialized));
    }

    #[test]
    fn test_open_rejects_root_hub() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        let err = pm.open_device(&create_root_hub_info(1)).unwrap_err();
        assert!(matches!(err, PortMapperError::RootHub(_)));
    }

    #[test]
    fn test_open_missing_device() {
        let host = MockHost::new(vec![]);
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        let err = pm
            .open_device(&create_mock_device_info(1, &[9], 1, 1))
            .unwrap_err();
        assert!(matches!(err, PortMapperError::Usb(rusb::Error::NoDevice)));
    }

    #[test]
    fn test_rejected_submit_completed_on_polling_thread() {
        let info = create_mock_device_info(1, &[4], 0x0781, 0x5581);
        let native = MockDevice::new(vec![storage_config()]);
        let host = MockHost::new(vec![info.clone()]);
        host.add_native(&info, native.clone());
        let hooks = RecordingHooks::new();
        let pm = mapper(&host, &hooks);
        pm.sys_init().unwrap();

        let mut device = pm.open_device(&info).unwrap();
        device.set_config(1).unwrap();
        native.state().reject_submit = Some(rusb::Error::Io);

        let mut queue = TransferQueue::new(2, 4);
        queue.push(Block::new(vec![0x55; 31], BlockRole::Full)).unwrap();
        let queue = queue.into_shared();

        assert_eq!(
            device.submit_data(&queue, Direction::Out, 2),
            UsbStatus::IoError
        );
        assert!(wait_for(|| {
            hooks
                .calls()
                .contains(&HookCall::Notify(info.path.clone(), UsbStatus::IoError))
        }));
        assert!(!pmapper::lock_queue(&queue).has_pending());
    }
}
