// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Command line parsing, mirroring the flag table of the original
//! `ippusbxd` (`examples/original_source/src/ippusbxd.c`'s `parse_opts`)
//! with `getopts` in place of `getopt_long`.

use std::fmt;
use std::num::ParseIntError;

use getopts::Options;

#[derive(Debug)]
pub enum Error {
    Getopts(getopts::Fail),
    BadHex(String, ParseIntError),
    BadPort(String, ParseIntError),
    PortOutOfRange(i64),
    BadBusDevice(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Getopts(err) => write!(f, "{}", err),
            BadHex(s, err) => write!(f, "Invalid hex value '{}': {}", s, err),
            BadPort(s, err) => write!(f, "Invalid port '{}': {}", s, err),
            PortOutOfRange(p) => write!(f, "Port {} is out of range 0-65535", p),
            BadBusDevice(s) => write!(f, "Invalid bus:device '{}', expected BUS:DEVICE", s),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Port exit codes, per spec.md section 6.
pub const EXIT_PORT_NEGATIVE: i32 = 1;
pub const EXIT_PORT_TOO_LARGE: i32 = 2;
pub const EXIT_BAD_BUS_DEVICE: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPolicy {
    /// `-P/--from-port`: slide up on conflict.
    FromPort(u16),
    /// `-p/--only-port`: fail on conflict.
    OnlyPort(u16),
    /// Neither flag given: bind an ephemeral port.
    Ephemeral,
}

#[derive(Debug, Clone)]
pub struct DeviceFilter {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial: Option<String>,
    pub bus: Option<u8>,
    pub device: Option<u8>,
}

impl DeviceFilter {
    fn is_empty(&self) -> bool {
        self.vid.is_none()
            && self.pid.is_none()
            && self.serial.is_none()
            && self.bus.is_none()
            && self.device.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Args {
    pub filter: DeviceFilter,
    pub port_policy: PortPolicy,
    pub interface: String,
    pub syslog: bool,
    pub verbose: bool,
    pub debug: bool,
    pub no_fork: bool,
    pub no_broadcast: bool,
}

fn parse_hex(s: &str) -> Result<u16> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|e| Error::BadHex(s.to_string(), e))
}

fn parse_port(s: &str) -> Result<u16> {
    let value: i64 = s.parse().map_err(|e| Error::BadPort(s.to_string(), e))?;
    if value < 0 {
        return Err(Error::PortOutOfRange(value));
    }
    if value > 65535 {
        return Err(Error::PortOutOfRange(value));
    }
    Ok(value as u16)
}

impl Args {
    fn opts() -> Options {
        let mut opts = Options::new();
        opts.optopt("v", "vid", "Filter by USB vendor ID", "HEX");
        opts.optopt("m", "pid", "Filter by USB product ID", "HEX");
        opts.optopt("s", "serial", "Filter by USB serial number", "STRING");
        opts.optopt("", "bus", "Filter by USB bus number", "DEC");
        opts.optopt("", "device", "Filter by USB device address", "DEC");
        opts.optopt("X", "bus-device", "Filter by bus:device", "BUS:DEV");
        opts.optopt("P", "from-port", "Preferred port, slide up on conflict", "PORT");
        opts.optopt("p", "only-port", "Exclusive port, exit on conflict", "PORT");
        opts.optopt("i", "interface", "Network interface name (default lo)", "NAME");
        opts.optflag("l", "logging", "Log to syslog");
        opts.optflag("q", "verbose", "Verbose logging");
        opts.optflag("d", "debug", "Verbose + no fork");
        opts.optflag("n", "no-fork", "Run in foreground");
        opts.optflag("B", "no-broadcast", "Skip DNS-SD registration");
        opts.optflag("h", "help", "Print help and exit");
        opts
    }

    /// Parses `argv`. Returns `Ok(None)` when `--help` was given (caller
    /// should print usage and exit 0).
    pub fn parse(argv: &[String]) -> Result<Option<Args>> {
        let opts = Self::opts();
        let matches = opts.parse(&argv[1..]).map_err(Error::Getopts)?;

        if matches.opt_present("h") {
            let brief = format!("Usage: {} [options]", argv[0]);
            print!("{}", opts.usage(&brief));
            return Ok(None);
        }

        let mut filter = DeviceFilter {
            vid: None,
            pid: None,
            serial: matches.opt_str("s"),
            bus: None,
            device: None,
        };
        if let Some(v) = matches.opt_str("v") {
            filter.vid = Some(parse_hex(&v)?);
        }
        if let Some(v) = matches.opt_str("m") {
            filter.pid = Some(parse_hex(&v)?);
        }
        if let Some(v) = matches.opt_str("bus") {
            filter.bus = Some(v.parse().map_err(|e| Error::BadPort(v, e))? as u8);
        }
        if let Some(v) = matches.opt_str("device") {
            filter.device = Some(v.parse().map_err(|e| Error::BadPort(v, e))? as u8);
        }
        if let Some(v) = matches.opt_str("X") {
            let (bus, dev) = v
                .split_once(':')
                .ok_or_else(|| Error::BadBusDevice(v.clone()))?;
            filter.bus = Some(bus.parse().map_err(|_| Error::BadBusDevice(v.clone()))?);
            filter.device = Some(dev.parse().map_err(|_| Error::BadBusDevice(v.clone()))?);
        }
        let _ = filter.is_empty(); // filter may legitimately be empty: auto-pick the device.

        let port_policy = match (matches.opt_str("P"), matches.opt_str("p")) {
            (_, Some(p)) => PortPolicy::OnlyPort(parse_port(&p)?),
            (Some(p), None) => PortPolicy::FromPort(parse_port(&p)?),
            (None, None) => PortPolicy::Ephemeral,
        };

        let debug = matches.opt_present("d");
        Ok(Some(Args {
            filter,
            port_policy,
            interface: matches.opt_str("i").unwrap_or_else(|| "lo".to_string()),
            syslog: matches.opt_present("l"),
            verbose: matches.opt_present("q") || debug,
            debug,
            no_fork: matches.opt_present("n") || debug,
            no_broadcast: matches.opt_present("B"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Args>> {
        let argv: Vec<String> = std::iter::once("ippusb-net-bridge".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        Args::parse(&argv)
    }

    #[test]
    fn defaults_to_ephemeral_port_and_lo() {
        let args = parse(&[]).unwrap().unwrap();
        assert_eq!(args.port_policy, PortPolicy::Ephemeral);
        assert_eq!(args.interface, "lo");
        assert!(!args.no_broadcast);
    }

    #[test]
    fn from_port_slides() {
        let args = parse(&["--from-port", "60000"]).unwrap().unwrap();
        assert_eq!(args.port_policy, PortPolicy::FromPort(60000));
    }

    #[test]
    fn only_port_is_exclusive() {
        let args = parse(&["--only-port", "60000"]).unwrap().unwrap();
        assert_eq!(args.port_policy, PortPolicy::OnlyPort(60000));
    }

    #[test]
    fn negative_port_is_out_of_range() {
        let err = parse(&["-p", "-1"]).unwrap_err();
        assert!(matches!(err, Error::PortOutOfRange(_) | Error::BadPort(..)));
    }

    #[test]
    fn port_above_65535_is_out_of_range() {
        let err = parse(&["-p", "70000"]).unwrap_err();
        assert!(matches!(err, Error::PortOutOfRange(_)));
    }

    #[test]
    fn bad_bus_device_is_rejected() {
        let err = parse(&["-X", "not-a-pair"]).unwrap_err();
        assert!(matches!(err, Error::BadBusDevice(_)));
    }

    #[test]
    fn bus_device_splits_correctly() {
        let args = parse(&["-X", "2:5"]).unwrap().unwrap();
        assert_eq!(args.filter.bus, Some(2));
        assert_eq!(args.filter.device, Some(5));
    }

    #[test]
    fn vid_pid_accept_hex_with_prefix() {
        let args = parse(&["--vid", "0x03f0", "--pid", "1234"]).unwrap().unwrap();
        assert_eq!(args.filter.vid, Some(0x03f0));
        assert_eq!(args.filter.pid, Some(0x1234));
    }

    #[test]
    fn debug_implies_verbose_and_no_fork() {
        let args = parse(&["-d"]).unwrap().unwrap();
        assert!(args.verbose);
        assert!(args.no_fork);
    }

    #[test]
    fn help_returns_none() {
        let result = parse(&["-h"]).unwrap();
        assert!(result.is_none());
    }
}
