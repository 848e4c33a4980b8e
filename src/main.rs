// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod args;
mod capabilities;
mod daemon;
mod dnssd;
mod error;
mod hotplug;
mod ipp;
mod packet;
mod relay;
mod tcp;
mod usb;

use log::error;

use crate::args::{Args, EXIT_BAD_BUS_DEVICE, EXIT_PORT_NEGATIVE, EXIT_PORT_TOO_LARGE};
use crate::error::{Error, Result};

fn init_logging(args: &Args) -> Result<()> {
    if args.syslog {
        let level = if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        syslog::init_unix(syslog::Facility::LOG_DAEMON, level).map_err(Error::Syslog)?;
    } else {
        let level = if args.verbose { "debug" } else { "info" };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
    }
    Ok(())
}

/// Parses argv, exiting with the specific codes spec.md section 6
/// assigns to malformed arguments (port range, bad `bus:device`) rather
/// than the generic nonzero exit used for other startup failures.
fn parse_args_or_exit(argv: &[String]) -> Option<Args> {
    match Args::parse(argv) {
        Ok(args) => args,
        Err(err @ args::Error::PortOutOfRange(value)) => {
            eprintln!("{}", err);
            std::process::exit(if value < 0 { EXIT_PORT_NEGATIVE } else { EXIT_PORT_TOO_LARGE });
        }
        Err(err @ args::Error::BadBusDevice(_)) => {
            eprintln!("{}", err);
            std::process::exit(EXIT_BAD_BUS_DEVICE);
        }
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<()> {
    init_logging(&args)?;
    daemon::run(args).map_err(Error::Daemon)
}

fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args_or_exit(&argv) {
        Some(args) => args,
        // --help was given: usage already printed, exit 0.
        None => return,
    };

    // run() rather than a Result-returning main so errors print with
    // Display instead of main's Debug formatting.
    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
