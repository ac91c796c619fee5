//! Test utilities for the port mapper
//!
//! Scriptable stand-ins for the native layer and the virtual controller,
//! used by unit and integration tests.
//!
//! # Example
//!
//! ```
//! use pmapper::test_utils::create_mock_device_info;
//!
//! let info = create_mock_device_info(1, &[2, 4], 0x1234, 0x5678);
//! assert_eq!(info.path.to_string(), "1-2.4");
//! assert_eq!(info.vendor_id, 0x1234);
//! ```

use crate::backend::{
    CancelHandle, ConfigLayout, EndpointLayout, HotplugGuard, InterfaceLayout, NativeDevice,
    SubmitRejected, UsbHost,
};
use crate::engine::Request;
use crate::error::UsbStatus;
use crate::hooks::PortMapperHooks;
use crate::queue::{ControlRequest, SharedQueue};
use crate::types::{CLASS_HUB, DeviceInfo, DevicePath, DeviceType, EndpointType, UsbSpeed};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a DeviceInfo for a non-hub USB 2.0 device
///
/// # Panics
/// If `ports` is deeper than the tier limit.
pub fn create_mock_device_info(bus: u8, ports: &[u8], vendor_id: u16, product_id: u16) -> DeviceInfo {
    let path = DevicePath::new(bus, ports).expect("path within tier limit");
    DeviceInfo {
        device_type: DeviceType::classify(&path, 0),
        path,
        vendor_id,
        product_id,
        bcd_usb: 0x0200,
        speed: UsbSpeed::High,
        max_child: None,
    }
}

/// Create a DeviceInfo for an external hub with `max_child` ports
pub fn create_mock_hub_info(bus: u8, ports: &[u8], max_child: u8) -> DeviceInfo {
    let path = DevicePath::new(bus, ports).expect("path within tier limit");
    DeviceInfo {
        device_type: DeviceType::classify(&path, CLASS_HUB),
        path,
        vendor_id: 0x05e3,
        product_id: 0x0610,
        bcd_usb: 0x0210,
        speed: UsbSpeed::High,
        max_child: Some(max_child),
    }
}

/// Create the DeviceInfo of a bus's root hub
pub fn create_root_hub_info(bus: u8) -> DeviceInfo {
    DeviceInfo {
        path: DevicePath::root_hub(bus),
        vendor_id: 0x1d6b,
        product_id: 0x0002,
        bcd_usb: 0x0200,
        speed: UsbSpeed::High,
        device_type: DeviceType::RootHub,
        max_child: None,
    }
}

pub fn endpoint(address: u8, kind: EndpointType, max_packet: u16) -> EndpointLayout {
    EndpointLayout {
        address,
        kind,
        max_packet,
    }
}

/// Configuration whose interfaces each have a single alternate setting
pub fn simple_config(value: u8, interfaces: Vec<Vec<EndpointLayout>>) -> ConfigLayout {
    ConfigLayout {
        value,
        interfaces: interfaces
            .into_iter()
            .enumerate()
            .map(|(number, endpoints)| InterfaceLayout {
                number: number as u8,
                alt_settings: vec![endpoints],
            })
            .collect(),
    }
}

/// Native call observed by a [`MockDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    Detach(u8),
    Attach(u8),
    Claim(u8),
    Release(u8),
    SetConfiguration(u8),
    SetAltSetting(u8, u8),
    Reset,
    ClearHalt(u8),
    ReadControl(ControlRequest),
    WriteControl(ControlRequest, Vec<u8>),
    Submit(u64),
}

/// Scriptable state behind a [`MockDevice`]
#[derive(Debug, Default)]
pub struct MockDeviceState {
    pub configs: Vec<ConfigLayout>,
    pub active: Option<u8>,
    pub claimed: BTreeSet<u8>,
    pub kernel_drivers: BTreeSet<u8>,
    pub alt_settings: BTreeMap<u8, u8>,
    pub calls: Vec<DeviceCall>,
    /// Returned by successive resets; Ok once exhausted
    pub reset_results: VecDeque<Result<(), rusb::Error>>,
    pub kernel_driver_error: Option<rusb::Error>,
    pub fail_detach: Option<rusb::Error>,
    /// Interface whose detach fails with Access
    pub fail_detach_iface: Option<u8>,
    /// Interface whose claim fails with Busy
    pub fail_claim: Option<u8>,
    pub fail_set_config: Option<rusb::Error>,
    pub fail_set_interface: Option<rusb::Error>,
    pub fail_clear_halt: Option<rusb::Error>,
    pub control_error: Option<rusb::Error>,
    /// Bytes returned by device-to-host control transfers
    pub control_response: Vec<u8>,
    pub reject_submit: Option<rusb::Error>,
    pub submitted: Vec<Request>,
    pub cancels: usize,
}

/// Scriptable [`NativeDevice`]; clones share state
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockDevice {
    /// Device with `configs`, the first one active
    pub fn new(configs: Vec<ConfigLayout>) -> Self {
        let active = configs.first().map(|c| c.value);
        Self {
            state: Arc::new(Mutex::new(MockDeviceState {
                configs,
                active,
                ..Default::default()
            })),
        }
    }

    /// Mark kernel drivers bound to `interfaces`
    pub fn with_kernel_drivers(self, interfaces: &[u8]) -> Self {
        lock(&self.state).kernel_drivers.extend(interfaces);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, MockDeviceState> {
        lock(&self.state)
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state().calls.clone()
    }

    /// Requests accepted by `submit`, oldest first
    pub fn take_submitted(&self) -> Vec<Request> {
        std::mem::take(&mut self.state().submitted)
    }

    pub fn boxed(&self) -> Box<dyn NativeDevice> {
        Box::new(self.clone())
    }
}

impl MockDeviceState {
    fn active_layout(&self) -> Option<&ConfigLayout> {
        let active = self.active?;
        self.configs.iter().find(|c| c.value == active)
    }
}

impl NativeDevice for MockDevice {
    fn active_config(&self) -> Result<ConfigLayout, rusb::Error> {
        self.state()
            .active_layout()
            .cloned()
            .ok_or(rusb::Error::NotFound)
    }

    fn kernel_driver_active(&self, iface: u8) -> Result<bool, rusb::Error> {
        let state = self.state();
        match state.kernel_driver_error {
            Some(e) => Err(e),
            None => Ok(state.kernel_drivers.contains(&iface)),
        }
    }

    fn detach_kernel_driver(&mut self, iface: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Detach(iface));
        if let Some(e) = state.fail_detach {
            return Err(e);
        }
        if state.fail_detach_iface == Some(iface) {
            return Err(rusb::Error::Access);
        }
        if !state.kernel_drivers.remove(&iface) {
            return Err(rusb::Error::NotFound);
        }
        Ok(())
    }

    fn attach_kernel_driver(&mut self, iface: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Attach(iface));
        if !state.kernel_drivers.insert(iface) {
            return Err(rusb::Error::Busy);
        }
        Ok(())
    }

    fn claim_interface(&mut self, iface: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Claim(iface));
        if state.fail_claim == Some(iface) || state.kernel_drivers.contains(&iface) {
            return Err(rusb::Error::Busy);
        }
        state.claimed.insert(iface);
        Ok(())
    }

    fn release_interface(&mut self, iface: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Release(iface));
        if !state.claimed.remove(&iface) {
            return Err(rusb::Error::NotFound);
        }
        Ok(())
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::SetConfiguration(value));
        if let Some(e) = state.fail_set_config {
            return Err(e);
        }
        // The native stack refuses while interfaces are claimed
        if !state.claimed.is_empty() {
            return Err(rusb::Error::Busy);
        }
        if !state.configs.iter().any(|c| c.value == value) {
            return Err(rusb::Error::NotFound);
        }
        state.active = Some(value);
        state.alt_settings.clear();
        Ok(())
    }

    fn set_alternate_setting(&mut self, iface: u8, alt: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::SetAltSetting(iface, alt));
        if let Some(e) = state.fail_set_interface {
            return Err(e);
        }
        if !state.claimed.contains(&iface) {
            return Err(rusb::Error::NotFound);
        }
        state.alt_settings.insert(iface, alt);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Reset);
        state.reset_results.pop_front().unwrap_or(Ok(()))
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::ClearHalt(endpoint));
        match state.fail_clear_halt {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn read_control(
        &mut self,
        setup: &ControlRequest,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::ReadControl(*setup));
        if let Some(e) = state.control_error {
            return Err(e);
        }
        let n = buf.len().min(state.control_response.len());
        buf[..n].copy_from_slice(&state.control_response[..n]);
        Ok(n)
    }

    fn write_control(
        &mut self,
        setup: &ControlRequest,
        buf: &[u8],
        _timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let mut state = self.state();
        state.calls.push(DeviceCall::WriteControl(*setup, buf.to_vec()));
        match state.control_error {
            Some(e) => Err(e),
            None => Ok(buf.len()),
        }
    }

    fn submit(&mut self, request: Request) -> Result<CancelHandle, SubmitRejected> {
        let mut state = self.state();
        state.calls.push(DeviceCall::Submit(request.seq()));
        if let Some(error) = state.reject_submit {
            return Err(SubmitRejected { error, request });
        }
        state.submitted.push(request);
        drop(state);

        let shared = Arc::clone(&self.state);
        Ok(Arc::new(move || {
            lock(&shared).cancels += 1;
            Ok(())
        }))
    }
}

/// Scriptable state behind a [`MockHost`]
#[derive(Default)]
pub struct MockHostState {
    pub devices: Vec<DeviceInfo>,
    pub native: HashMap<DevicePath, MockDevice>,
    pub open_error: Option<rusb::Error>,
    pub enumerate_error: Option<rusb::Error>,
    pub hotplug_error: Option<rusb::Error>,
    /// Returned by successive event-service calls before any waiting
    pub event_errors: VecDeque<rusb::Error>,
    pub hooks: Option<Arc<dyn PortMapperHooks>>,
    pub live_registrations: usize,
    pub polls: usize,
    pub wakes: usize,
    woken: bool,
}

#[derive(Default)]
struct MockHostInner {
    state: Mutex<MockHostState>,
    wakeup: Condvar,
}

/// Scriptable [`UsbHost`]; clones share state
#[derive(Clone, Default)]
pub struct MockHost {
    inner: Arc<MockHostInner>,
}

impl MockHost {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        let host = Self::default();
        host.state().devices = devices;
        host
    }

    pub fn state(&self) -> MutexGuard<'_, MockHostState> {
        lock(&self.inner.state)
    }

    /// Make `open_device` on `info` return `device`
    pub fn add_native(&self, info: &DeviceInfo, device: MockDevice) {
        self.state().native.insert(info.path.clone(), device);
    }

    pub fn polls(&self) -> usize {
        self.state().polls
    }

    pub fn live_registrations(&self) -> usize {
        self.state().live_registrations
    }

    /// Deliver a hotplug arrival; false when nothing is registered
    pub fn emit_arrival(&self, info: &DeviceInfo) -> bool {
        let hooks = self.state().hooks.clone();
        match hooks {
            Some(hooks) => {
                hooks.connect(info);
                true
            }
            None => false,
        }
    }

    /// Deliver a hotplug departure; false when nothing is registered
    pub fn emit_departure(&self, info: &DeviceInfo) -> bool {
        let hooks = self.state().hooks.clone();
        match hooks {
            Some(hooks) => {
                hooks.disconnect(info);
                true
            }
            None => false,
        }
    }
}

struct MockRegistration {
    host: MockHost,
}

impl Drop for MockRegistration {
    fn drop(&mut self) {
        let mut state = self.host.state();
        state.live_registrations = state.live_registrations.saturating_sub(1);
        state.hooks = None;
    }
}

impl UsbHost for MockHost {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, rusb::Error> {
        let state = self.state();
        match state.enumerate_error {
            Some(e) => Err(e),
            None => Ok(state.devices.clone()),
        }
    }

    fn register_hotplug(
        &self,
        hooks: Arc<dyn PortMapperHooks>,
    ) -> Result<HotplugGuard, rusb::Error> {
        let mut state = self.state();
        if let Some(e) = state.hotplug_error {
            return Err(e);
        }
        state.hooks = Some(hooks);
        state.live_registrations += 1;
        Ok(Box::new(MockRegistration { host: self.clone() }))
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), rusb::Error> {
        let mut state = self.state();
        state.polls += 1;
        if let Some(e) = state.event_errors.pop_front() {
            return Err(e);
        }
        if !state.woken {
            state = self
                .inner
                .wakeup
                .wait_timeout(state, timeout)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        state.woken = false;
        Ok(())
    }

    fn wake(&self) {
        let mut state = self.state();
        state.woken = true;
        state.wakes += 1;
        self.inner.wakeup.notify_all();
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn NativeDevice>, rusb::Error> {
        let state = self.state();
        if let Some(e) = state.open_error {
            return Err(e);
        }
        state
            .native
            .get(&info.path)
            .map(MockDevice::boxed)
            .ok_or(rusb::Error::NoDevice)
    }
}

/// Controller hook invocation observed by [`RecordingHooks`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    Connect(DevicePath),
    Disconnect(DevicePath),
    /// Queue status at notification time
    Notify(DevicePath, UsbStatus),
    Interrupt(DevicePath),
    Lock(DevicePath, u8),
    Unlock(DevicePath, u8),
}

/// [`PortMapperHooks`] that records every call
#[derive(Default)]
pub struct RecordingHooks {
    calls: Mutex<Vec<HookCall>>,
    connected: Mutex<Vec<DeviceInfo>>,
    want_interrupt: AtomicBool,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hooks whose `notify` requests a guest interrupt
    pub fn interrupting() -> Arc<Self> {
        let hooks = Self::default();
        hooks.want_interrupt.store(true, Ordering::Relaxed);
        Arc::new(hooks)
    }

    pub fn calls(&self) -> Vec<HookCall> {
        lock(&self.calls).clone()
    }

    /// Devices passed to `connect`, in call order
    pub fn connected(&self) -> Vec<DeviceInfo> {
        lock(&self.connected).clone()
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
        lock(&self.connected).clear();
    }

    fn record(&self, call: HookCall) {
        lock(&self.calls).push(call);
    }
}

impl PortMapperHooks for RecordingHooks {
    fn connect(&self, info: &DeviceInfo) {
        lock(&self.connected).push(info.clone());
        self.record(HookCall::Connect(info.path.clone()));
    }

    fn disconnect(&self, info: &DeviceInfo) {
        self.record(HookCall::Disconnect(info.path.clone()));
    }

    fn notify(&self, device: &DevicePath, queue: &SharedQueue) -> bool {
        let status = match queue.try_lock() {
            Ok(queue) => queue.status(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().status(),
            Err(TryLockError::WouldBlock) => panic!("{}: notify called with the queue locked", device),
        };
        self.record(HookCall::Notify(device.clone(), status));
        self.want_interrupt.load(Ordering::Relaxed)
    }

    fn interrupt(&self, device: &DevicePath) {
        self.record(HookCall::Interrupt(device.clone()));
    }

    fn lock_endpoint(&self, device: &DevicePath, endpoint_id: u8) {
        self.record(HookCall::Lock(device.clone(), endpoint_id));
    }

    fn unlock_endpoint(&self, device: &DevicePath, endpoint_id: u8) {
        self.record(HookCall::Unlock(device.clone(), endpoint_id));
    }
}
