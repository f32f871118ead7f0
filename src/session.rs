//! Acquisition sessions: devices, the event loop and the datafeed bus.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::datafeed::{DatafeedBus, DatafeedSink, DeviceId};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::input::InputFormat;
use crate::plugin::AcquisitionContext;

// =============================================================================
// Session Control
// =============================================================================

/// Thread-safe handle for stopping a running [`Session`].
#[derive(Clone, Default)]
pub struct SessionControl {
    inner: Arc<SessionControlInner>,
}

#[derive(Default)]
struct SessionControlInner {
    stop_requested: AtomicBool,
}

impl SessionControl {
    fn new() -> Self {
        Self::default()
    }

    /// Request the session to stop. Takes effect on the next loop iteration.
    pub fn stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Check if a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.inner.stop_requested.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Session
// =============================================================================

/// Runs acquisitions on one or more devices and feeds their packets to the
/// subscribed sinks.
///
/// # Example
///
/// ```no_run
/// use logic_capture::{open_device, DeviceConfig, PacketCollector, Session};
///
/// let device = open_device("demo:0").unwrap();
/// device.configure(&DeviceConfig::new().with_limit_samples(1000)).unwrap();
///
/// let mut session = Session::new();
/// let collector = PacketCollector::new();
/// session.subscribe(collector.clone());
/// session.add_device(device);
/// session.start().unwrap();
/// session.run();
/// ```
pub struct Session {
    devices: Vec<Device>,
    bus: DatafeedBus,
    event_loop: EventLoop,
    control: SessionControl,
    next_input: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::with_event_loop(EventLoop::new())
    }

    /// Uses a custom event loop (e.g. with a shorter poll interval).
    pub fn with_event_loop(event_loop: EventLoop) -> Self {
        Self {
            devices: Vec::new(),
            bus: DatafeedBus::new(),
            event_loop,
            control: SessionControl::new(),
            next_input: 0,
        }
    }

    /// Adds a device. Its packets carry the returned id.
    pub fn add_device(&mut self, device: Device) -> DeviceId {
        self.devices.push(device);
        DeviceId(self.devices.len() - 1)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn subscribe(&mut self, sink: impl DatafeedSink + 'static) {
        self.bus.subscribe(sink);
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Starts acquisition on every device, in the order they were added.
    ///
    /// If a device fails to start, devices already started are stopped and
    /// the error is returned.
    pub fn start(&mut self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::msg("session has no devices"));
        }
        self.control.clear();

        for (n, device) in self.devices.iter().enumerate() {
            let id = DeviceId(n);
            self.bus.reset(id);
            let mut ctx = AcquisitionContext::new(id, &mut self.event_loop, &mut self.bus);
            if let Err(e) = device.start(&mut ctx) {
                error!("{}: failed to start acquisition: {}", device.info(), e);
                for (m, started) in self.devices.iter().enumerate().take(n) {
                    let mut ctx =
                        AcquisitionContext::new(DeviceId(m), &mut self.event_loop, &mut self.bus);
                    let _ = started.stop(&mut ctx);
                }
                return Err(e);
            }
            info!("{}: acquisition started", device.info());
        }
        Ok(())
    }

    /// Runs the event loop until every source has finished or a stop is
    /// requested through [`SessionControl`].
    pub fn run(&mut self) {
        while self.event_loop.has_sources() {
            if self.control.is_stop_requested() {
                self.stop();
                break;
            }
            self.event_loop.iteration(&mut self.bus);
        }
    }

    /// Stops acquisition on every device. Each stream still open gets its
    /// End packet.
    pub fn stop(&mut self) {
        for (n, device) in self.devices.iter().enumerate() {
            let mut ctx = AcquisitionContext::new(DeviceId(n), &mut self.event_loop, &mut self.bus);
            if let Err(e) = device.stop(&mut ctx) {
                error!("{}: failed to stop acquisition: {}", device.info(), e);
            }
        }
        info!("session stopped");
    }

    /// Feeds a recorded capture through the bus as if a device produced it.
    pub fn load_input(
        &mut self,
        format: &mut dyn InputFormat,
        reader: &mut dyn Read,
    ) -> Result<DeviceId> {
        let id = DeviceId(usize::MAX - self.next_input);
        self.next_input += 1;
        self.bus.reset(id);
        format.load(reader, id, &mut self.bus)?;
        Ok(id)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
