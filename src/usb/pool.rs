// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The claimed-interface pool, generalized from the teacher's
//! `InterfaceManager` (`usb_connector.rs`). Interfaces are claimed once
//! at `UsbSock::open` time and simply leased out and returned here; there
//! is no idle release-and-reclaim cycle (see usb/mod.rs's module doc).

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use std::sync::atomic::{AtomicBool, Ordering};

use super::device::IppusbInterfaceInfo;
use super::{Error, Result};

struct State {
    /// Indices of interfaces currently available for lease. Acts as the
    /// "array of indices [0,N)" from spec.md section 4.3: the split
    /// between available and taken is just this vector's length versus
    /// `num_interfaces - len`.
    available: Vec<usize>,
    /// One flag per interface, `true` while leased out. Stands in for the
    /// per-interface binary semaphore of spec.md section 4.3: acquiring
    /// it twice without a release in between is a pool corruption bug.
    held: Vec<bool>,
}

/// A pool of claimed USB interfaces, shared by every `UsbConn` lease.
#[derive(Clone)]
pub(super) struct Pool {
    interfaces: Arc<Vec<IppusbInterfaceInfo>>,
    state: Arc<Mutex<State>>,
    available_cond: Arc<Condvar>,
}

/// A leased interface, returned to the pool on `Pool::release`.
pub(super) struct Lease {
    pub index: usize,
    pub info: IppusbInterfaceInfo,
}

impl Pool {
    pub fn new(interfaces: Vec<IppusbInterfaceInfo>) -> Self {
        let n = interfaces.len();
        Pool {
            interfaces: Arc::new(interfaces),
            state: Arc::new(Mutex::new(State {
                available: (0..n).collect(),
                held: vec![false; n],
            })),
            available_cond: Arc::new(Condvar::new()),
        }
    }

    pub fn num_interfaces(&self) -> usize {
        self.interfaces.len()
    }

    /// Waits up to `timeout` (polled every 100ms, per spec.md section 4.3)
    /// for a free interface, honoring `terminate`.
    pub fn acquire(&self, terminate: &AtomicBool, timeout: Duration) -> Result<Lease> {
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(100);

        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(index) = state.available.pop() {
                if state.held[index] {
                    // The semaphore was already held for an index we just
                    // popped as available: the pool's internal invariant
                    // (I2) has been violated.
                    return Err(Error::PoolCorrupt);
                }
                state.held[index] = true;
                return Ok(Lease {
                    index,
                    info: self.interfaces[index],
                });
            }

            if terminate.load(Ordering::Relaxed) || Instant::now() >= deadline {
                return Err(Error::NoFreeInterface);
            }

            let wait = poll_interval.min(deadline.saturating_duration_since(Instant::now()));
            let (guard, _timeout_result) =
                self.available_cond.wait_timeout(state, wait).unwrap();
            state = guard;
        }
    }

    pub fn release(&self, lease: Lease) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.held[lease.index], "releasing an interface that wasn't held");
        state.held[lease.index] = false;
        state.available.push(lease.index);
        self.available_cond.notify_all();
    }

    pub fn release_all(&self, handle: &rusb::DeviceHandle<rusb::Context>) {
        for iface in self.interfaces.iter() {
            if let Err(e) = handle.release_interface(iface.interface_number) {
                log::warn!(
                    "Failed to release interface {} during shutdown: {}",
                    iface.interface_number,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interfaces(n: usize) -> Vec<IppusbInterfaceInfo> {
        (0..n)
            .map(|i| IppusbInterfaceInfo {
                interface_number: i as u8,
                alternate_setting: 0,
                in_endpoint: 0x81,
                out_endpoint: 0x01,
                max_packet_size: 512,
                supports_escl: false,
            })
            .collect()
    }

    #[test]
    fn acquire_then_release_restores_availability() {
        let pool = Pool::new(interfaces(2));
        let terminate = AtomicBool::new(false);

        let lease = pool.acquire(&terminate, Duration::from_millis(100)).unwrap();
        assert_eq!(pool.state.lock().unwrap().available.len(), 1);
        pool.release(lease);
        assert_eq!(pool.state.lock().unwrap().available.len(), 2);
    }

    #[test]
    fn no_two_leases_share_an_index() {
        // I2: no two live leases share an interface index.
        let pool = Pool::new(interfaces(2));
        let terminate = AtomicBool::new(false);

        let a = pool.acquire(&terminate, Duration::from_millis(100)).unwrap();
        let b = pool.acquire(&terminate, Duration::from_millis(100)).unwrap();
        assert_ne!(a.index, b.index);

        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn acquire_times_out_when_pool_exhausted() {
        let pool = Pool::new(interfaces(1));
        let terminate = AtomicBool::new(false);

        let _lease = pool.acquire(&terminate, Duration::from_millis(100)).unwrap();
        let result = pool.acquire(&terminate, Duration::from_millis(200));
        assert!(matches!(result, Err(Error::NoFreeInterface)));
    }

    #[test]
    fn acquire_honors_terminate_flag() {
        let pool = Pool::new(interfaces(1));
        let terminate = AtomicBool::new(true);

        let _lease = pool.acquire(&terminate, Duration::from_secs(5)).unwrap();
        let start = Instant::now();
        let result = pool.acquire(&terminate, Duration::from_secs(5));
        assert!(matches!(result, Err(Error::NoFreeInterface)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn num_avail_plus_num_taken_invariant() {
        // I1: num_avail + num_taken == num_interfaces at every point
        // outside the pool critical section.
        let pool = Pool::new(interfaces(3));
        let terminate = AtomicBool::new(false);

        let a = pool.acquire(&terminate, Duration::from_millis(100)).unwrap();
        let b = pool.acquire(&terminate, Duration::from_millis(100)).unwrap();
        {
            let state = pool.state.lock().unwrap();
            let num_avail = state.available.len();
            let num_taken = state.held.iter().filter(|&&h| h).count();
            assert_eq!(num_avail + num_taken, 3);
        }
        pool.release(a);
        pool.release(b);
        let state = pool.state.lock().unwrap();
        assert_eq!(state.available.len(), 3);
    }
}
