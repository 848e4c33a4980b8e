// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The unit of transfer shuttled between a TCP connection and a USB
//! interface. A `Packet` owns a resizable byte buffer; `filled` is always
//! `<= capacity`.

/// Default packet capacity. Matches `BUFFER_SIZE` in the original
/// `ippusbxd` C sources: a page-sized buffer is large enough for most
/// IPP-USB bulk transfers and is grown to the endpoint's `wMaxPacketSize`
/// only when that is larger.
pub const DEFAULT_CAPACITY: usize = 4096;

/// A contiguous byte region used as the unit of transfer on both the TCP
/// and USB sides of a relay. Never reused across threads: owned by
/// whoever created it until handed off into a send/receive call.
pub struct Packet {
    buf: Vec<u8>,
    filled: usize,
}

impl Packet {
    /// Allocates a new, empty packet with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Allocates a new, empty packet sized for a specific endpoint's
    /// `wMaxPacketSize`, when that's larger than the default.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(DEFAULT_CAPACITY)],
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn set_filled(&mut self, filled: usize) {
        assert!(filled <= self.capacity(), "filled must not exceed capacity");
        self.filled = filled;
    }

    /// The portion of the buffer holding valid data.
    pub fn as_filled_slice(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// The whole backing buffer, writable up to `capacity()`, for a bulk
    /// read to fill.
    pub fn as_full_slice_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_packet_is_empty() {
        let p = Packet::new();
        assert_eq!(p.filled(), 0);
        assert_eq!(p.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn with_capacity_never_shrinks_below_default() {
        let p = Packet::with_capacity(64);
        assert_eq!(p.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn with_capacity_grows_for_large_endpoints() {
        let p = Packet::with_capacity(8192);
        assert_eq!(p.capacity(), 8192);
    }

    #[test]
    fn set_filled_bounds_slice() {
        let mut p = Packet::with_capacity(16);
        p.set_filled(5);
        assert_eq!(p.as_filled_slice().len(), 5);
    }

    #[test]
    #[should_panic]
    fn set_filled_beyond_capacity_panics() {
        let mut p = Packet::with_capacity(16);
        p.set_filled(17);
    }
}
