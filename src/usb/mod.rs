// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! USB socket / interface pool (spec.md C3) and leased connections (C4).
//!
//! Grounded in `usb_connector.rs` from the `ippusb_bridge` teacher crate:
//! the claimed-interface pool with a mutex + condvar is kept essentially
//! as-is and generalized to also parse the IEEE-1284 device ID and detect
//! a co-resident eSCL scanner, per spec.md section 4.3. Unlike the
//! teacher, interfaces are claimed once at startup and held for the
//! daemon's lifetime (spec.md's "Claim"/"Close" steps do not describe an
//! idle release-and-reclaim cycle, so that ChromeOS-specific optimization
//! is not carried over -- see DESIGN.md).

mod connection;
mod device;
mod pool;

pub use connection::{ReadOutcome, ReadTransfer, SendError, UsbConn};
pub use device::IppusbInterfaceInfo;

use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use log::info;
use rusb::{Context, UsbContext};

use crate::args::DeviceFilter;
use pool::Pool;

#[derive(Debug)]
pub enum Error {
    CreateContext(rusb::Error),
    DeviceList(rusb::Error),
    ReadDeviceDescriptor(rusb::Error),
    ReadConfigDescriptor(rusb::Error),
    OpenDevice(rusb::Error),
    ClaimInterface(u8, rusb::Error),
    ReleaseInterface(u8, rusb::Error),
    SetAlternateSetting(u8, rusb::Error),
    SetActiveConfig(rusb::Error),
    DetachDrivers(u8, rusb::Error),
    RegisterCallback(rusb::Error),
    NoDevice,
    SingleInterfaceDevice,
    NoFreeInterface,
    PoolCorrupt,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            CreateContext(err) => write!(f, "Failed to create libusb context: {}", err),
            DeviceList(err) => write!(f, "Failed to read device list: {}", err),
            ReadDeviceDescriptor(err) => write!(f, "Failed to read device descriptor: {}", err),
            ReadConfigDescriptor(err) => write!(f, "Failed to read config descriptor: {}", err),
            OpenDevice(err) => write!(f, "Failed to open device: {}", err),
            ClaimInterface(i, err) => write!(f, "Failed to claim interface {}: {}", i, err),
            ReleaseInterface(i, err) => write!(f, "Failed to release interface {}: {}", i, err),
            SetAlternateSetting(i, err) => {
                write!(f, "Failed to set interface {} alternate setting: {}", i, err)
            }
            SetActiveConfig(err) => write!(f, "Failed to set active config: {}", err),
            DetachDrivers(i, err) => {
                write!(f, "Failed to detach kernel driver for interface {}: {}", i, err)
            }
            RegisterCallback(err) => write!(f, "Failed to register hotplug callback: {}", err),
            NoDevice => write!(f, "No matching IPP-USB device found"),
            SingleInterfaceDevice => write!(
                f,
                "Device exposes a single IPP-USB interface; at least two are required"
            ),
            NoFreeInterface => write!(f, "Timed out waiting for a free USB interface"),
            PoolCorrupt => write!(f, "USB interface pool invariant violated"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Owns the USB device handle and the pool of claimed IPP-USB interfaces.
/// Cloning shares the same underlying pool (spec.md's `UsbSock`).
#[derive(Clone)]
pub struct UsbSock {
    handle: Arc<rusb::DeviceHandle<Context>>,
    pool: Pool,
    device_id: Option<String>,
    escl_present: bool,
}

impl UsbSock {
    /// Discovers, opens and claims all IPP-USB interfaces on the selected
    /// device. `filter` narrows device selection; when every field is
    /// `None`, the first device with >= 2 IPP-USB interfaces is chosen.
    pub fn open(filter: &DeviceFilter) -> Result<Self> {
        let context = Context::new().map_err(Error::CreateContext)?;
        let device_list =
            rusb::DeviceList::new_with_context(context.clone()).map_err(Error::DeviceList)?;

        let mut selected = None;
        for device in device_list.iter() {
            if !device::matches_filter(&device, filter) {
                continue;
            }
            match device::read_ippusb_info(&device) {
                Ok(Some(info)) => {
                    selected = Some((device, info));
                    break;
                }
                Ok(None) => continue,
                Err(Error::SingleInterfaceDevice) if filter_is_specific(filter) => {
                    return Err(Error::SingleInterfaceDevice)
                }
                Err(_) => continue,
            }
        }
        let (device, info) = selected.ok_or(Error::NoDevice)?;

        info!(
            "Selected device {}:{} with {} IPP-USB interface(s)",
            device.bus_number(),
            device.address(),
            info.interfaces.len()
        );

        let handle = Arc::new(device.open().map_err(Error::OpenDevice)?);
        handle
            .set_auto_detach_kernel_driver(true)
            .map_err(|e| Error::DetachDrivers(u8::MAX, e))?;
        device::set_active_config(&handle, info.config)?;

        let mut claimed = Vec::with_capacity(info.interfaces.len());
        for iface in &info.interfaces {
            handle
                .claim_interface(iface.interface_number)
                .map_err(|e| Error::ClaimInterface(iface.interface_number, e))?;
            handle
                .set_alternate_setting(iface.interface_number, iface.alternate_setting)
                .map_err(|e| Error::SetAlternateSetting(iface.interface_number, e))?;
            claimed.push(*iface);
        }

        let device_id = device::read_device_id(&handle, &claimed, info.config);
        let escl_present = claimed.iter().any(|i| i.supports_escl);

        Ok(UsbSock {
            handle,
            pool: Pool::new(claimed),
            device_id,
            escl_present,
        })
    }

    pub fn device(&self) -> rusb::Device<Context> {
        self.handle.device()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn escl_present(&self) -> bool {
        self.escl_present
    }

    pub fn num_interfaces(&self) -> usize {
        self.pool.num_interfaces()
    }

    /// Leases one interface from the pool, blocking up to 3 seconds
    /// (spec.md section 4.3's `acquire`).
    pub fn acquire(&self, terminate: &AtomicBool) -> Result<UsbConn> {
        let lease = self.pool.acquire(terminate, Duration::from_secs(3))?;
        Ok(UsbConn::new(self.handle.clone(), self.pool.clone(), lease))
    }

    /// Releases every claimed interface and resets the bus, in that order
    /// (spec.md section 4.3's `Close`).
    pub fn close(self) {
        self.pool.release_all(&self.handle);
        if let Err(e) = self.handle.reset() {
            log::warn!("USB bus reset failed during shutdown: {}", e);
        }
    }
}

fn filter_is_specific(filter: &DeviceFilter) -> bool {
    filter.vid.is_some() || filter.pid.is_some() || filter.serial.is_some() || filter.bus.is_some()
}
