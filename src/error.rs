// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;

/// `main`'s top-level error: logging setup, and everything the daemon
/// loop itself can fail with (which keeps its own, more specific `Error`
/// enum). Argument-parsing errors are handled separately in `main.rs`,
/// since spec.md section 6 assigns them specific exit codes rather than
/// the generic nonzero exit used here.
#[derive(Debug)]
pub enum Error {
    Syslog(syslog::Error),
    Daemon(crate::daemon::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            Syslog(err) => write!(f, "Failed to initialize logging: {}", err),
            Daemon(err) => write!(f, "{}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
