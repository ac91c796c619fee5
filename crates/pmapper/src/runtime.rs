//! Port-mapper runtime
//!
//! Owns the native context for the lifetime of a virtual controller:
//! reports the initial topology, keeps hotplug callbacks registered and
//! runs the polling thread on which every asynchronous completion and
//! hotplug event is delivered.
//!
//! ```text
//!   sys_init ──► open host ──► scan topology ──► register hotplug ──► spawn "usb_dev_sys"
//!                                                                         │
//!        ┌────────────────────────────────────────────────────────────────┘
//!        ▼
//!   loop { handle_events(poll_timeout) ; drain deferred completions }  until exit flag
//! ```

use crate::backend::{HotplugGuard, UsbHost};
use crate::config::RuntimeConfig;
use crate::device::{self, VirtualDevice};
use crate::engine::{CompletionPort, DeferredCompletions, completion_channel};
use crate::error::{PortMapperError, Result};
use crate::hooks::PortMapperHooks;
use crate::native::RusbHost;
use crate::topology::scan_topology;
use crate::types::DeviceInfo;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Name of the polling thread
pub const POLL_THREAD_NAME: &str = "usb_dev_sys";

type HostOpener<H> = Box<dyn Fn(&RuntimeConfig) -> std::result::Result<H, rusb::Error> + Send + Sync>;

/// State that exists only between `sys_init` and `sys_deinit`
struct Running<H> {
    host: Arc<H>,
    devices: Vec<DeviceInfo>,
    port: CompletionPort,
    hotplug: Option<HotplugGuard>,
    exit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// The port mapper of one virtual controller
pub struct PortMapper<H: UsbHost = RusbHost> {
    hooks: Arc<dyn PortMapperHooks>,
    config: RuntimeConfig,
    opener: HostOpener<H>,
    state: Mutex<Option<Running<H>>>,
}

impl PortMapper<RusbHost> {
    /// Port mapper backed by libusb
    pub fn new(hooks: Arc<dyn PortMapperHooks>, config: RuntimeConfig) -> Self {
        Self::with_host(hooks, config, RusbHost::open)
    }
}

impl<H: UsbHost> PortMapper<H> {
    /// Port mapper whose native context is created by `opener` on each
    /// `sys_init`
    pub fn with_host<F>(hooks: Arc<dyn PortMapperHooks>, config: RuntimeConfig, opener: F) -> Self
    where
        F: Fn(&RuntimeConfig) -> std::result::Result<H, rusb::Error> + Send + Sync + 'static,
    {
        Self {
            hooks,
            config,
            opener: Box::new(opener),
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, Option<Running<H>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().is_some()
    }

    /// Start the runtime
    ///
    /// Reports every device already present through `connect`, in
    /// ascending depth order, before returning. The runtime counts as
    /// initialized from the moment the context is open, so `connect` may
    /// call back into it (to open the reported device, for instance).
    pub fn sys_init(&self) -> Result<()> {
        let (host, devices, exit, deferred) = {
            let mut state = self.lock_state();
            if state.is_some() {
                error!("port mapper is already initialized");
                return Err(PortMapperError::AlreadyInitialized);
            }

            let host = Arc::new((self.opener)(&self.config).inspect_err(|e| {
                error!("Failed to initialize USB context: {}", e);
            })?);

            let devices = host.enumerate().unwrap_or_else(|e| {
                warn!("Failed to enumerate devices: {}", e);
                Vec::new()
            });

            let weak_host = Arc::downgrade(&host);
            let waker: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                if let Some(host) = weak_host.upgrade() {
                    host.wake();
                }
            });
            let (port, deferred) = completion_channel(Arc::clone(&self.hooks), Some(waker));
            let exit = Arc::new(AtomicBool::new(false));

            *state = Some(Running {
                host: Arc::clone(&host),
                devices: devices.clone(),
                port,
                hotplug: None,
                exit: Arc::clone(&exit),
                thread: None,
            });
            (host, devices, exit, deferred)
        };

        // Hooks run without the state lock
        let reported = scan_topology(&devices, |info| {
            if !exit.load(Ordering::Acquire) {
                self.hooks.connect(info);
            }
        });
        info!("found {} devices before Guest OS booted", reported);

        let hotplug = match host.register_hotplug(Arc::clone(&self.hooks)) {
            Ok(guard) => guard,
            Err(e) => {
                error!("Failed to register hot-plug callbacks: {}", e);
                self.abandon(&host);
                return Err(e.into());
            }
        };

        let spawned = {
            let host = Arc::clone(&host);
            let exit = Arc::clone(&exit);
            let poll_timeout = self.config.poll_timeout();
            let backoff = self.config.error_backoff();
            thread::Builder::new()
                .name(POLL_THREAD_NAME.to_string())
                .spawn(move || poll_events(&*host, &deferred, &exit, poll_timeout, backoff))
        };
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                error!("Failed to spawn USB polling thread: {}", e);
                drop(hotplug);
                self.abandon(&host);
                return Err(e.into());
            }
        };

        let mut state = self.lock_state();
        match state.as_mut() {
            Some(running) if Arc::ptr_eq(&running.host, &host) => {
                running.hotplug = Some(hotplug);
                running.thread = Some(thread);
            }
            _ => {
                // sys_deinit ran while the scan was in progress
                drop(state);
                warn!("port mapper stopped during initialization");
                drop(hotplug);
                exit.store(true, Ordering::Release);
                host.wake();
                if thread.join().is_err() {
                    error!("USB polling thread panicked");
                }
            }
        }
        Ok(())
    }

    /// Forget a half-started runtime, unless it was already replaced
    fn abandon(&self, host: &Arc<H>) {
        let running = {
            let mut state = self.lock_state();
            match state.as_ref() {
                Some(running) if Arc::ptr_eq(&running.host, host) => state.take(),
                _ => None,
            }
        };
        if let Some(running) = running {
            running.exit.store(true, Ordering::Release);
        }
    }

    /// Stop the runtime
    ///
    /// No hook fires once this returns. Calling it on a stopped runtime is
    /// a no-op.
    pub fn sys_deinit(&self) {
        // Released before joining so hooks on the polling thread can still
        // reach the runtime
        let Some(mut running) = self.lock_state().take() else {
            return;
        };

        info!("port-mapper de-initialization");
        drop(running.hotplug.take());

        running.exit.store(true, Ordering::Release);
        running.host.wake();
        if let Some(thread) = running.thread.take()
            && thread.join().is_err()
        {
            error!("USB polling thread panicked");
        }

        running.devices.clear();
        debug!("port-mapper stopped");
    }

    /// Devices present when the runtime started
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.lock_state()
            .as_ref()
            .map(|running| running.devices.clone())
            .unwrap_or_default()
    }

    /// Open a discovered device for passthrough
    pub fn open_device(&self, info: &DeviceInfo) -> Result<VirtualDevice> {
        device::validate(info)?;

        let (host, port) = {
            let state = self.lock_state();
            let running = state.as_ref().ok_or(PortMapperError::NotInitialized)?;
            (Arc::clone(&running.host), running.port.clone())
        };

        let native = host.open_device(info).inspect_err(|e| {
            warn!("{}: fail to open device: {}", info.path, e);
        })?;
        let device = VirtualDevice::init(info.clone(), native, port)?;
        Ok(device.with_control_timeout(self.config.control_timeout()))
    }
}

impl<H: UsbHost> Drop for PortMapper<H> {
    fn drop(&mut self) {
        self.sys_deinit();
    }
}

/// Body of the polling thread
fn poll_events<H: UsbHost>(
    host: &H,
    deferred: &DeferredCompletions,
    exit: &AtomicBool,
    timeout: Duration,
    backoff: Duration,
) {
    info!("USB polling thread started");

    while !exit.load(Ordering::Acquire) {
        match catch_unwind(AssertUnwindSafe(|| host.handle_events(timeout))) {
            Ok(Ok(())) => {}
            Ok(Err(rusb::Error::Interrupted)) => {
                debug!("USB event handling interrupted");
            }
            Ok(Err(e)) => {
                warn!("Error handling USB events: {}", e);
                thread::sleep(backoff);
            }
            Err(e) => {
                error!("Panic while handling USB events: {:?}", e);
                thread::sleep(backoff);
            }
        }

        let ran = deferred.drain();
        if ran > 0 {
            debug!("ran {} deferred completions", ran);
        }
    }

    // Release anything rejected while shutting down
    deferred.drain();
    info!("poll thread exit");
}
