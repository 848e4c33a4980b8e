// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Device discovery: finding IPP-USB interfaces, the class-specific eSCL
//! capability bit, and the IEEE-1284 device ID. Ported and extended from
//! `read_ippusb_device_info`/`set_device_config` in the teacher's
//! `usb_connector.rs`.

use log::{error, info};
use rusb::{Context, Direction, TransferType, UsbContext};

use super::{Error, Result};
use crate::args::DeviceFilter;

/// Class-specific "Basic Capabilities" bit indicating a co-resident eSCL
/// scanner, per spec.md section 4.3.
const ESCL_CAPABILITY_BIT: u8 = 0x02;

fn is_ippusb_interface(descriptor: &rusb::InterfaceDescriptor) -> bool {
    descriptor.class_code() == 0x07
        && descriptor.sub_class_code() == 0x01
        && descriptor.protocol_code() == 0x04
}

/// Scans an interface's class-specific descriptor bytes for the printer
/// class "Basic Capabilities" tuple and checks the eSCL bit. The IPP-USB
/// class-specific functional descriptor is a short TLV sequence embedded
/// in the interface's `extra()` bytes; the last byte of the first
/// CS_INTERFACE (0x24) sub-descriptor carries the capability bitmap.
fn interface_supports_escl(descriptor: &rusb::InterfaceDescriptor) -> bool {
    extra_bytes_have_escl_bit(descriptor.extra())
}

/// Walks a sequence of `[bLength, bDescriptorType, ...]` sub-descriptors
/// looking for a CS_INTERFACE (0x24) tuple and tests its last byte for the
/// eSCL capability bit. Split out from `interface_supports_escl` so the
/// TLV walk can be unit tested without a live USB descriptor.
fn extra_bytes_have_escl_bit(extra: &[u8]) -> bool {
    const CS_INTERFACE: u8 = 0x24;
    let mut offset = 0usize;
    while offset + 1 < extra.len() {
        let len = extra[offset] as usize;
        if len == 0 || offset + len > extra.len() {
            break;
        }
        let descriptor_type = extra[offset + 1];
        if descriptor_type == CS_INTERFACE && len >= 3 {
            let capabilities = extra[offset + len - 1];
            if capabilities & ESCL_CAPABILITY_BIT != 0 {
                return true;
            }
        }
        offset += len;
    }
    false
}

#[derive(Copy, Clone, Debug)]
pub struct IppusbInterfaceInfo {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub in_endpoint: u8,
    pub out_endpoint: u8,
    pub max_packet_size: u16,
    pub supports_escl: bool,
}

pub(super) struct IppusbDeviceInfo {
    pub config: u8,
    pub interfaces: Vec<IppusbInterfaceInfo>,
}

/// Searches a device's configurations for one exposing >= 2 IPP-USB
/// interfaces. Returns `Err(SingleInterfaceDevice)` if exactly one such
/// interface is found in the best configuration, per spec.md's "A device
/// with exactly one such interface is rejected as spec-violating."
pub(super) fn read_ippusb_info<T: UsbContext>(
    device: &rusb::Device<T>,
) -> Result<Option<IppusbDeviceInfo>> {
    let desc = device
        .device_descriptor()
        .map_err(Error::ReadDeviceDescriptor)?;

    for i in 0..desc.num_configurations() {
        let config = device
            .config_descriptor(i)
            .map_err(Error::ReadConfigDescriptor)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            for alternate in interface.descriptors() {
                if !is_ippusb_interface(&alternate) {
                    continue;
                }

                let mut in_endpoint = None;
                let mut out_endpoint = None;
                let mut max_packet_size = 0u16;
                for endpoint in alternate.endpoint_descriptors() {
                    match (endpoint.direction(), endpoint.transfer_type()) {
                        (Direction::In, TransferType::Bulk) => {
                            in_endpoint.get_or_insert(endpoint.address());
                            max_packet_size = max_packet_size.max(endpoint.max_packet_size());
                        }
                        (Direction::Out, TransferType::Bulk) => {
                            out_endpoint.get_or_insert(endpoint.address());
                            max_packet_size = max_packet_size.max(endpoint.max_packet_size());
                        }
                        _ => {}
                    }
                }

                if let (Some(in_endpoint), Some(out_endpoint)) = (in_endpoint, out_endpoint) {
                    info!(
                        "Device {}:{} - found IPP-USB interface {} alt {}",
                        device.bus_number(),
                        device.address(),
                        interface.number(),
                        alternate.setting_number()
                    );
                    interfaces.push(IppusbInterfaceInfo {
                        interface_number: interface.number(),
                        alternate_setting: alternate.setting_number(),
                        in_endpoint,
                        out_endpoint,
                        max_packet_size,
                        supports_escl: interface_supports_escl(&alternate),
                    });
                    break;
                }
            }
        }

        if interfaces.len() >= 2 {
            return Ok(Some(IppusbDeviceInfo {
                config: config.number(),
                interfaces,
            }));
        }
        if interfaces.len() == 1 {
            return Err(Error::SingleInterfaceDevice);
        }
    }

    Ok(None)
}

pub(super) fn matches_filter<T: UsbContext>(device: &rusb::Device<T>, filter: &DeviceFilter) -> bool {
    if let (Some(bus), Some(addr)) = (filter.bus, filter.device) {
        return device.bus_number() == bus && device.address() == addr;
    }
    if filter.vid.is_some() || filter.pid.is_some() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => return false,
        };
        if let Some(vid) = filter.vid {
            if desc.vendor_id() != vid {
                return false;
            }
        }
        if let Some(pid) = filter.pid {
            if desc.product_id() != pid {
                return false;
            }
        }
        return true;
    }
    if let Some(ref serial) = filter.serial {
        return device_serial(device).as_deref() == Some(serial.as_str());
    }
    // No filter given: every device is a candidate; read_ippusb_info()
    // narrows the field to actual IPP-USB devices.
    true
}

fn device_serial<T: UsbContext>(device: &rusb::Device<T>) -> Option<String> {
    let desc = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    let timeout = std::time::Duration::from_millis(500);
    let languages = handle.read_languages(timeout).ok()?;
    let language = *languages.first()?;
    handle
        .read_serial_number_string(language, &desc, timeout)
        .ok()
}

pub(super) fn set_active_config(handle: &rusb::DeviceHandle<Context>, new_config: u8) -> Result<()> {
    let cur_config = handle
        .device()
        .active_config_descriptor()
        .map_err(Error::ReadConfigDescriptor)?;

    if cur_config.number() == new_config {
        return Ok(());
    }

    for interface in cur_config.interfaces() {
        match handle.kernel_driver_active(interface.number()) {
            Ok(false) | Err(_) => continue,
            Ok(true) => {}
        }
        if let Err(e) = handle.detach_kernel_driver(interface.number()) {
            if e != rusb::Error::NotFound {
                return Err(Error::DetachDrivers(interface.number(), e));
            }
        }
    }

    info!(
        "Switching from configuration {} to {}",
        cur_config.number(),
        new_config
    );
    handle
        .set_active_configuration(new_config)
        .map_err(Error::SetActiveConfig)
}

/// Reads the IEEE-1284 device ID over a class-typed IN control transfer,
/// trying each claimed interface in turn until one succeeds (spec.md
/// section 4.3). Returns `None` if every interface fails.
pub(super) fn read_device_id(
    handle: &rusb::DeviceHandle<Context>,
    interfaces: &[IppusbInterfaceInfo],
    config: u8,
) -> Option<String> {
    for iface in interfaces {
        match read_device_id_for_interface(handle, config, iface) {
            Ok(id) => return Some(id),
            Err(e) => {
                error!(
                    "Failed to read IEEE-1284 device ID on interface {}: {}",
                    iface.interface_number, e
                );
            }
        }
    }
    None
}

fn read_device_id_for_interface(
    handle: &rusb::DeviceHandle<Context>,
    config: u8,
    iface: &IppusbInterfaceInfo,
) -> std::result::Result<String, rusb::Error> {
    let mut buf = [0u8; 1024];
    let request_type = rusb::request_type(
        rusb::Direction::In,
        rusb::RequestType::Class,
        rusb::Recipient::Interface,
    );
    let index = ((iface.interface_number as u16) << 8) | iface.alternate_setting as u16;
    let timeout = std::time::Duration::from_secs(5);
    let n = handle.read_control(request_type, 0, config as u16, index, &mut buf, timeout)?;

    parse_device_id(&buf[..n]).ok_or(rusb::Error::Other)
}

/// Parses the length-prefixed IEEE-1284 device ID string, trying MSB-first
/// length first and falling back to LSB-first, per spec.md section 4.3
/// and invariant I6. Bound-checks throughout rather than walking past a
/// malformed `'\0'`, unlike the pointer arithmetic in the original C
/// source (see spec.md section 9, "possibly-buggy source behavior").
pub fn parse_device_id(buf: &[u8]) -> Option<String> {
    if buf.len() < 2 {
        return None;
    }
    let msb_first = ((buf[0] as usize) << 8) | buf[1] as usize;
    let length = if (14..=buf.len()).contains(&msb_first) {
        msb_first
    } else {
        let lsb_first = ((buf[1] as usize) << 8) | buf[0] as usize;
        if (14..=buf.len()).contains(&lsb_first) {
            lsb_first
        } else {
            return None;
        }
    };

    let payload_len = length.saturating_sub(2).min(buf.len().saturating_sub(2));
    let payload = &buf[2..2 + payload_len];
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    Some(String::from_utf8_lossy(&payload[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_msb_first_length() {
        let body = b"MFG:Acme;MDL:X1;CMD:PDF;";
        let mut buf = vec![0u8, (body.len() + 2) as u8];
        buf.extend_from_slice(body);
        let parsed = parse_device_id(&buf).unwrap();
        assert_eq!(parsed, "MFG:Acme;MDL:X1;CMD:PDF;");
    }

    #[test]
    fn falls_back_to_lsb_first_length() {
        let body = b"MFG:Acme;MDL:X1;CMD:PDF;";
        let len = (body.len() + 2) as u16;
        // LSB-first: low byte first, high byte second. Since len < 256 the
        // MSB-first interpretation (high byte first) would read as 0x00len
        // which is too short, forcing the LSB-first fallback.
        let mut buf = vec![(len & 0xff) as u8, (len >> 8) as u8];
        buf.extend_from_slice(body);
        let parsed = parse_device_id(&buf).unwrap();
        assert_eq!(parsed, "MFG:Acme;MDL:X1;CMD:PDF;");
    }

    #[test]
    fn rejects_too_short_length() {
        let mut buf = vec![0u8, 10u8];
        buf.extend_from_slice(b"short");
        assert!(parse_device_id(&buf).is_none());
    }

    #[test]
    fn never_walks_past_buffer_end() {
        // Malformed: claims a huge length but the buffer is short. Must not
        // panic or read out of bounds.
        let buf = vec![0xffu8, 0xffu8, b'M', b'F', b'G'];
        let _ = parse_device_id(&buf);
    }

    #[test]
    fn escl_capability_bit_detected() {
        // A minimal CS_INTERFACE descriptor: length 4, type 0x24, subtype,
        // capabilities byte with bit 0x02 set.
        let extra = [4u8, 0x24, 0x00, 0x02];
        assert!(extra_bytes_have_escl_bit(&extra));
    }

    #[test]
    fn escl_capability_bit_absent() {
        let extra = [4u8, 0x24, 0x00, 0x00];
        assert!(!extra_bytes_have_escl_bit(&extra));
    }

    #[test]
    fn malformed_descriptor_length_does_not_panic() {
        let extra = [0xffu8, 0x24, 0x00];
        assert!(!extra_bytes_have_escl_bit(&extra));
    }
}
