// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Unplug detection (spec.md C3's "surprise removal" handling), adapted
//! from the teacher's `hotplug.rs`: a libusb hotplug callback registered
//! for `DEVICE_LEFT` events on the bound device, running on a dedicated
//! event-pump thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};
use rusb::{Context, Device, Hotplug, UsbContext};

/// Minimal teardown run synchronously from the hotplug callback itself
/// (spec.md section 4.3/6, scenario 6): stop DNS-SD and close the TCP
/// listeners, then exit. Boxed rather than generic since `Hotplug` is
/// registered as a trait object already.
pub type UnplugCallback = Box<dyn FnMut() + Send>;

#[derive(Debug)]
pub enum Error {
    HotplugUnsupported,
    Register(rusb::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::HotplugUnsupported => {
                write!(f, "libusb hotplug support is not available on this platform")
            }
            Error::Register(e) => write!(f, "Failed to register hotplug callback: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Polling interval for the libusb event pump, matching spec.md section
/// 8's "event-pump interval" boundary: unplug detection is not
/// instantaneous, it is bounded by how often `handle_events` runs.
const EVENT_PUMP_INTERVAL: Duration = Duration::from_millis(500);

struct CallbackHandler {
    bus_number: u8,
    address: u8,
    on_unplug: UnplugCallback,
}

impl Hotplug<Context> for CallbackHandler {
    fn device_arrived(&mut self, _device: Device<Context>) {
        // The bridge only reacts to removal of the device it is already
        // bound to; re-arrival of some other device is not interesting.
    }

    fn device_left(&mut self, device: Device<Context>) {
        if device.bus_number() == self.bus_number && device.address() == self.address {
            info!(
                "USB device {}:{} was disconnected, performing fast-path shutdown",
                self.bus_number, self.address
            );
            // Runs synchronously on libusb's event thread and does not
            // return: spec.md's scenario 6 bounds this at <=1s, which rules
            // out falling back to the ordinary shutdown sequence's relay
            // draining and USB bus reset.
            (self.on_unplug)();
        }
    }
}

/// Watches one USB device for removal and runs the fast-path teardown
/// callback when it goes away. Dropping this stops the event-pump thread
/// and deregisters the callback.
pub struct UnplugDetector {
    context: Context,
    event_thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl UnplugDetector {
    pub fn new(
        context: Context,
        bus_number: u8,
        address: u8,
        on_unplug: UnplugCallback,
    ) -> Result<Self> {
        if !rusb::has_hotplug() {
            return Err(Error::HotplugUnsupported);
        }

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_context = context.clone();

        let _registration = rusb::HotplugBuilder::new()
            .enumerate(false)
            .register(
                &context,
                Box::new(CallbackHandler {
                    bus_number,
                    address,
                    on_unplug,
                }),
            )
            .map_err(Error::Register)?;

        let event_thread = thread::Builder::new()
            .name("usb-hotplug".into())
            .spawn(move || {
                while thread_running.load(Ordering::Relaxed) {
                    if let Err(e) = thread_context.handle_events(Some(EVENT_PUMP_INTERVAL)) {
                        warn!("libusb event handling failed: {}", e);
                        break;
                    }
                }
                // `_registration` is dropped here on the same context it
                // was registered against, deregistering the callback.
                drop(_registration);
            })
            .expect("failed to spawn USB hotplug event thread");

        Ok(UnplugDetector {
            context,
            event_thread: Some(event_thread),
            running,
        })
    }
}

impl Drop for UnplugDetector {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.event_thread.take() {
            let _ = handle.join();
        }
        let _ = &self.context;
    }
}
