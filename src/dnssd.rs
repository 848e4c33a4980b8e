// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DNS-SD / mDNS publishing (spec.md section 4.8). Realized with
//! `mdns-sd`, the only DNS-SD crate anywhere in the retrieval pack
//! (`eatsome-printer-daemon`'s `discovery.rs` uses it for browsing; this
//! module is the registration side of the same crate's API), filling the
//! role `avahi-client` plays in `examples/original_source/src/dnssd.c`.

use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::capabilities::{PrinterInfo, ScannerInfo};

#[derive(Debug)]
pub enum Error {
    Daemon(mdns_sd::Error),
    Register(mdns_sd::Error),
    MissingRequiredField(&'static str),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Daemon(e) => write!(f, "Failed to start mDNS responder: {}", e),
            Error::Register(e) => write!(f, "Failed to register DNS-SD service: {}", e),
            Error::MissingRequiredField(field) => {
                write!(f, "Device ID is missing required field {}", field)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

const IPP_TYPE: &str = "_ipp._tcp.local.";
const PRINTER_TYPE: &str = "_printer._tcp.local.";
const HTTP_TYPE: &str = "_http._tcp.local.";
const USCAN_TYPE: &str = "_uscan._tcp.local.";

/// Fields pulled out of the IEEE-1284 device ID string, per spec.md
/// section 4.8. `MFG`/`MDL`/`CMD` (or their long forms) are required;
/// their absence is fatal to registration.
#[derive(Debug, Clone, Default)]
struct DeviceIdFields {
    mfg: Option<String>,
    mdl: Option<String>,
    cmd: Option<String>,
    serial: Option<String>,
}

fn parse_device_id_fields(device_id: &str) -> DeviceIdFields {
    let mut fields = DeviceIdFields::default();
    for entry in device_id.split(';') {
        let Some((key, value)) = entry.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_uppercase();
        let value = value.trim().to_string();
        match key.as_str() {
            "MFG" | "MANUFACTURER" => fields.mfg.get_or_insert(value),
            "MDL" | "MODEL" => fields.mdl.get_or_insert(value),
            "CMD" | "COMMAND SET" => fields.cmd.get_or_insert(value),
            "SN" | "SERN" | "SERIALNUMBER" => fields.serial.get_or_insert(value),
            _ => continue,
        };
    }
    fields
}

/// Scans `CMD`/`COMMAND SET` for the page-description-language keyword
/// substrings named in spec.md section 4.8, case-insensitively, and
/// returns the comma-joined `pdl` TXT value.
fn pdl_from_command_set(cmd: &str) -> Option<String> {
    let lower = cmd.to_ascii_lowercase();
    let mut pdl = Vec::new();
    let mut push = |value: &str| {
        if !pdl.iter().any(|v: &String| v == value) {
            pdl.push(value.to_string());
        }
    };
    if lower.contains("pwg") && lower.contains("raster") {
        push("image/pwg-raster");
    }
    if lower.contains("apple") && lower.contains("raster") {
        push("image/urf");
    }
    if lower.contains("urf") {
        push("image/urf");
    }
    if lower.contains("pclm") {
        push("application/PCLm");
    }
    if lower.contains("pdf") {
        push("application/pdf");
    }
    if lower.contains("jpeg") || lower.contains("jpg") {
        push("image/jpeg");
    }
    if pdl.is_empty() {
        None
    } else {
        Some(pdl.join(","))
    }
}

/// Classifies duplex support from the `URF` attribute's `DMn` token
/// (`n` in 1..4), per spec.md section 4.8. `DM3`/`DM4` indicate two-sided
/// duplex support in Apple's URF registry; `DM1`/`DM2` are simplex-only.
fn duplex_from_urf(urf: &str) -> &'static str {
    if urf.contains("DM3") || urf.contains("DM4") {
        "T"
    } else if urf.contains("DM1") || urf.contains("DM2") {
        "F"
    } else {
        "U"
    }
}

/// Chooses the IPP service subtype from the resolved `pdl` value (spec.md
/// section 4.8): `_universal` only when URF raster is supported *and* PWG
/// raster is not, mirroring `dnssd.c`'s pdl-based subtype selection rather
/// than pattern-matching the raw `urf-supported` device-ID token.
fn subtype_for_pdl(pdl: Option<&str>) -> &'static str {
    match pdl {
        Some(pdl) if pdl.contains("image/urf") && !pdl.contains("image/pwg-raster") => {
            "_universal._sub._ipp._tcp.local."
        }
        _ => "_print._sub._ipp._tcp.local.",
    }
}

/// Holds the running mDNS responder and the fullnames of whatever is
/// currently registered, so `update_with_capabilities`/`shutdown` can
/// unregister the right records (spec.md's `DnssdState`).
pub struct DnssdState {
    daemon: ServiceDaemon,
    instance_name: String,
    host_ip: std::net::IpAddr,
    port: u16,
    device_id_fields: DeviceIdFields,
    ipp_registered: bool,
    uscan_registered: bool,
    /// Fullnames of the printer group's currently-registered records, so a
    /// later re-registration with refreshed capability data can unregister
    /// the stale set first. `mdns-sd` has no in-place TXT update, and the
    /// subtype fullname itself can change between the pre-probe and
    /// post-probe registration (`_print` vs `_universal`).
    printer_fullnames: Vec<String>,
}

impl DnssdState {
    /// Starts the mDNS responder and registers the printer composite
    /// group (`_ipp._tcp`, `_printer._tcp`, `_http._tcp`), per spec.md
    /// section 4.8's "S_RUNNING: register printer services" step.
    /// `ipp_ref` (the printer group) is always established before
    /// `uscan_ref` is ever committed, matching the `DnssdState` invariant
    /// in spec.md section 3.
    pub fn start(device_id: &str, host_ip: std::net::IpAddr, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(Error::Daemon)?;
        let fields = parse_device_id_fields(device_id);

        let mdl = fields.mdl.clone().ok_or(Error::MissingRequiredField("MDL"))?;
        fields.mfg.clone().ok_or(Error::MissingRequiredField("MFG"))?;
        fields.cmd.clone().ok_or(Error::MissingRequiredField("CMD"))?;

        let instance_name = match &fields.serial {
            Some(serial) => format!("{} [{}]", mdl, serial),
            None => mdl,
        };

        let mut state = DnssdState {
            daemon,
            instance_name,
            host_ip,
            port,
            device_id_fields: fields,
            ipp_registered: false,
            uscan_registered: false,
            printer_fullnames: Vec::new(),
        };
        state.register_printer_group(None)?;
        Ok(state)
    }

    fn host_name(&self) -> String {
        format!("{}.local.", self.instance_name.replace(' ', "-"))
    }

    fn register_printer_group(&mut self, printer: Option<&PrinterInfo>) -> Result<()> {
        let mfg = self.device_id_fields.mfg.clone().unwrap_or_default();
        let mdl = self.device_id_fields.mdl.clone().unwrap_or_default();
        let pdl = self
            .device_id_fields
            .cmd
            .as_deref()
            .and_then(pdl_from_command_set)
            .or_else(|| printer.and_then(|p| p.pdl.clone()));
        let ufr = printer.and_then(|p| p.ufr.clone());
        let duplex = duplex_from_urf(ufr.as_deref().unwrap_or(""));

        let mut txt = HashMap::new();
        txt.insert("rp".to_string(), "ipp/print".to_string());
        txt.insert("Duplex".to_string(), duplex.to_string());
        txt.insert("usb_MFG".to_string(), mfg.clone());
        txt.insert("usb_MDL".to_string(), mdl.clone());
        txt.insert("priority".to_string(), "60".to_string());
        txt.insert("txtvers".to_string(), "1".to_string());
        txt.insert("qtotal".to_string(), "1".to_string());
        if let Some(printer) = printer {
            insert_if_some(&mut txt, "adminurl", &printer.adminurl);
            insert_if_some(&mut txt, "UUID", &printer.uuid);
            insert_if_some(&mut txt, "mopria-certified", &printer.mopria_certified);
            insert_if_some(&mut txt, "kind", &printer.kind);
            insert_if_some(&mut txt, "Color", &printer.color);
            insert_if_some(&mut txt, "note", &printer.note);
            insert_if_some(&mut txt, "ty", &printer.ty);
            if let Some(ty) = &printer.ty {
                txt.insert("product".to_string(), format!("({})", ty));
            }
            insert_if_some(&mut txt, "UFR", &printer.ufr);
            insert_if_some(&mut txt, "PaperMax", &printer.papermax);
        }
        if let Some(pdl) = &pdl {
            txt.insert("pdl".to_string(), pdl.clone());
        }

        let subtype = subtype_for_pdl(pdl.as_deref());

        // Drop whatever the printer group's previous registration left
        // behind before committing the refreshed set: the subtype fullname
        // itself may differ from the pre-probe registration.
        for fullname in self.printer_fullnames.drain(..) {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!("Failed to unregister stale DNS-SD record {}: {}", fullname, e);
            }
        }

        let mut fullnames = Vec::with_capacity(5);
        fullnames.push(self.register_service(subtype, &txt)?);
        fullnames.push(self.register_service(IPP_TYPE, &txt)?);
        fullnames.push(self.register_service(PRINTER_TYPE, &txt)?);
        fullnames.push(self.register_service("_printer._sub._http._tcp.local.", &txt)?);
        fullnames.push(self.register_service(HTTP_TYPE, &txt)?);
        self.printer_fullnames = fullnames;
        self.ipp_registered = true;
        info!("Registered DNS-SD printer services for '{}'", self.instance_name);
        Ok(())
    }

    /// Re-registers the printer composite group once the capability probe
    /// completes, refreshing the TXT fields (`adminurl`, `UUID`, `ty`,
    /// `product`, `Color`, `note`, `kind`, `mopria-certified`, `UFR`,
    /// `PaperMax`, `pdl`, `Duplex`) and subtype that the initial
    /// device-ID-only registration in `start` could not yet know, per
    /// spec.md section 4.8's `S_RUNNING` step.
    pub fn update_with_capabilities(&mut self, printer: &PrinterInfo) -> Result<()> {
        self.register_printer_group(Some(printer))
    }

    /// Registers the scanner group (`_uscan._tcp`), falling back to the
    /// printer-side TXT fields where the scanner side is null. Only
    /// called once `ipp_ref` is already committed.
    pub fn register_scanner(&mut self, scanner: Option<&ScannerInfo>, printer: &PrinterInfo) -> Result<()> {
        if !self.ipp_registered {
            warn!("Attempted to register scanner service before printer group was committed");
        }

        let mut txt = HashMap::new();
        txt.insert("txtvers".to_string(), "1".to_string());
        txt.insert("rs".to_string(), "eSCL".to_string());
        insert_or_fallback(&mut txt, "representation", scanner.and_then(|s| s.representation.clone()), printer.representation.clone());
        insert_or_fallback(&mut txt, "note", scanner.and_then(|s| s.note.clone()), printer.note.clone());
        insert_or_fallback(&mut txt, "UUID", scanner.and_then(|s| s.uuid.clone()), printer.uuid.clone());
        insert_or_fallback(&mut txt, "adminurl", scanner.and_then(|s| s.adminurl.clone()), printer.adminurl.clone());
        insert_or_fallback(&mut txt, "duplex", scanner.and_then(|s| s.duplex.clone()), None);
        insert_or_fallback(&mut txt, "cs", scanner.and_then(|s| s.cs.clone()), None);
        insert_or_fallback(&mut txt, "pdl", scanner.and_then(|s| s.pdl.clone()), printer.pdl.clone());
        insert_or_fallback(&mut txt, "ty", scanner.and_then(|s| s.ty.clone()), printer.ty.clone());
        insert_or_fallback(&mut txt, "vers", scanner.and_then(|s| s.vers.clone()), None);

        self.register_service(USCAN_TYPE, &txt)?;
        self.uscan_registered = true;
        info!("Registered DNS-SD scanner service for '{}'", self.instance_name);
        Ok(())
    }

    fn register_service(&self, ty_domain: &str, txt: &HashMap<String, String>) -> Result<String> {
        let info = ServiceInfo::new(
            ty_domain,
            &self.instance_name,
            &self.host_name(),
            self.host_ip.to_string(),
            self.port,
            txt.clone(),
        )
        .map_err(Error::Register)?;
        let fullname = info.get_fullname().to_string();
        self.daemon.register(info).map_err(Error::Register)?;
        Ok(fullname)
    }

    /// Resets both entry groups on `S_REGISTERING`/`S_COLLISION` (the
    /// server's host name may have changed), per spec.md section 4.8's
    /// client-state callback.
    pub fn reset(&mut self, device_id: &str) -> Result<()> {
        self.device_id_fields = parse_device_id_fields(device_id);
        self.ipp_registered = false;
        self.uscan_registered = false;
        self.register_printer_group(None)
    }

    /// Stops the mDNS responder, tearing down every registered record.
    /// Part of both the ordinary shutdown sequence (C6) and the unplug
    /// fast path (C3).
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.shutdown() {
            error!("Failed to shut down mDNS responder cleanly: {}", e);
        }
        // Give the responder's background thread a moment to flush
        // "goodbye" packets before the process moves on.
        thread::sleep(Duration::from_millis(50));
    }
}

fn insert_if_some(txt: &mut HashMap<String, String>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        txt.insert(key.to_string(), value.clone());
    }
}

fn insert_or_fallback(txt: &mut HashMap<String, String>, key: &str, primary: Option<String>, fallback: Option<String>) {
    if let Some(value) = primary.or(fallback) {
        txt.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_required_and_optional_device_id_fields() {
        let fields = parse_device_id_fields("MFG:Acme;MDL:X1;CMD:PDF,URF;SN:12345;");
        assert_eq!(fields.mfg.as_deref(), Some("Acme"));
        assert_eq!(fields.mdl.as_deref(), Some("X1"));
        assert_eq!(fields.cmd.as_deref(), Some("PDF,URF"));
        assert_eq!(fields.serial.as_deref(), Some("12345"));
    }

    #[test]
    fn long_form_keys_are_also_recognized() {
        let fields = parse_device_id_fields("MANUFACTURER:Acme;MODEL:X1;COMMAND SET:PDF;");
        assert_eq!(fields.mfg.as_deref(), Some("Acme"));
        assert_eq!(fields.mdl.as_deref(), Some("X1"));
    }

    #[test]
    fn pdl_scans_command_set_case_insensitively() {
        let pdl = pdl_from_command_set("PDF,urf,JPEG").unwrap();
        assert!(pdl.contains("application/pdf"));
        assert!(pdl.contains("image/urf"));
        assert!(pdl.contains("image/jpeg"));
    }

    #[test]
    fn pwg_raster_requires_both_substrings() {
        assert!(pdl_from_command_set("pwg").is_none());
        assert!(pdl_from_command_set("pwg-raster").unwrap().contains("image/pwg-raster"));
    }

    #[test]
    fn duplex_classification_from_urf_tokens() {
        assert_eq!(duplex_from_urf("DM3"), "T");
        assert_eq!(duplex_from_urf("DM1"), "F");
        assert_eq!(duplex_from_urf("V1.4"), "U");
    }

    #[test]
    fn universal_subtype_requires_urf_without_pwg_raster() {
        assert_eq!(subtype_for_pdl(Some("image/urf,application/pdf")), "_universal._sub._ipp._tcp.local.");
        assert_eq!(
            subtype_for_pdl(Some("image/urf,image/pwg-raster")),
            "_print._sub._ipp._tcp.local.",
            "PWG raster support rules out the universal subtype even when URF is also present"
        );
        assert_eq!(subtype_for_pdl(Some("application/pdf")), "_print._sub._ipp._tcp.local.");
        assert_eq!(subtype_for_pdl(None), "_print._sub._ipp._tcp.local.");
    }
}
