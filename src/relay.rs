// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-connection relay (spec.md section 4.5): two cooperating flows,
//! socket-side and printer-side, sharing one `TcpConn`, one `UsbConn` and
//! one condition variable. Grounded in the teacher's `InterfaceManager`
//! cleanup thread for the mutex+condvar idiom; the relay loops themselves
//! follow spec.md's pseudocode directly rather than the teacher's
//! hyper-based bridge loop, since this system does not parse HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::tcp::{self, TcpConn};
use crate::usb::{self, ReadOutcome, ReadTransfer, UsbConn, UsbSock};

/// Async read timeout, per spec.md section 5's "USB async read 2 s".
const ASYNC_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Observable relay lifecycle, per spec.md section 4.5's state machine.
/// Held only for diagnostics; no code branches on it besides logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    UsbAcquired,
    Running,
    Closing,
    Done,
}

struct Shared {
    read_inflight: Mutex<bool>,
    cond: Condvar,
}

/// A registry entry for one relay: lets the daemon (C6) cancel a relay
/// asynchronously and wait for it to finish, per spec.md section 5's
/// "main thread may cancel any registered relay thread".
pub struct RelayHandle {
    thread_num: u32,
    local_terminate: Arc<AtomicBool>,
    socket_thread: Option<JoinHandle<()>>,
}

use crate::daemon::Terminate;

impl RelayHandle {
    pub fn thread_num(&self) -> u32 {
        self.thread_num
    }

    /// Requests this relay alone stop, without touching the process-wide
    /// terminate flag.
    pub fn cancel(&self) {
        self.local_terminate.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.socket_thread.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    pub fn join(mut self) {
        if let Some(handle) = self.socket_thread.take() {
            let _ = handle.join();
        }
    }
}

fn should_stop(global_terminate: &AtomicBool, local_terminate: &AtomicBool) -> bool {
    global_terminate.load(Ordering::Relaxed) || local_terminate.load(Ordering::Relaxed)
}

/// Accepts one TCP connection's ownership and a USB socket's pool,
/// acquires an interface and runs both relay flows. `thread_num` is the
/// even slot assigned by the daemon's accept loop; the printer-side
/// sibling uses `thread_num + 1`.
pub fn spawn(thread_num: u32, tcp: Arc<TcpConn>, usb_sock: UsbSock, global_terminate: Terminate) -> RelayHandle {
    let local_terminate = Arc::new(AtomicBool::new(false));
    let thread_local_terminate = local_terminate.clone();

    let socket_thread = thread::Builder::new()
        .name(format!("relay-{}-sock", thread_num))
        .spawn(move || run_socket_side(thread_num, tcp, usb_sock, global_terminate, thread_local_terminate))
        .expect("failed to spawn relay socket-side thread");

    RelayHandle {
        thread_num,
        local_terminate,
        socket_thread: Some(socket_thread),
    }
}

fn run_socket_side(
    thread_num: u32,
    tcp: Arc<TcpConn>,
    usb_sock: UsbSock,
    global_terminate: Terminate,
    local_terminate: Arc<AtomicBool>,
) {
    let mut state = State::Init;
    debug!("relay {}: {:?}", thread_num, state);

    let usb_conn = match usb_sock.acquire(global_terminate) {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            warn!("relay {}: failed to acquire USB interface: {}", thread_num, e);
            tcp.close();
            return;
        }
    };
    state = State::UsbAcquired;
    debug!("relay {}: {:?}", thread_num, state);

    let shared = Arc::new(Shared {
        read_inflight: Mutex::new(false),
        cond: Condvar::new(),
    });

    let printer_tcp = tcp.clone();
    let printer_usb = usb_conn.clone();
    let printer_shared = shared.clone();
    let printer_global_terminate = global_terminate;
    let printer_local_terminate = local_terminate.clone();
    let printer_thread = thread::Builder::new()
        .name(format!("relay-{}-print", thread_num + 1))
        .spawn(move || {
            run_printer_side(
                thread_num + 1,
                printer_tcp,
                printer_usb,
                printer_shared,
                printer_global_terminate,
                printer_local_terminate,
            )
        })
        .expect("failed to spawn relay printer-side thread");

    state = State::Running;
    debug!("relay {}: {:?}", thread_num, state);

    loop {
        if tcp.is_closed() || should_stop(global_terminate, &local_terminate) {
            break;
        }
        match tcp.recv() {
            Ok(None) => break,
            Ok(Some(packet)) => {
                if let Err(e) = usb_conn.send(&packet) {
                    match e {
                        usb::SendError::NoDevice => {
                            warn!("relay {}: USB device disconnected on send", thread_num);
                            global_terminate.store(true, Ordering::Relaxed);
                        }
                        usb::SendError::Usb(err) => {
                            warn!("relay {}: USB send failed: {}", thread_num, err);
                            local_terminate.store(true, Ordering::Relaxed);
                        }
                    }
                    break;
                }
            }
            Err(tcp::Error::Timeout) => continue,
            Err(e) => {
                debug!("relay {}: TCP recv ended: {}", thread_num, e);
                break;
            }
        }
    }

    state = State::Closing;
    debug!("relay {}: {:?}", thread_num, state);
    tcp.close();
    shared.cond.notify_all();
    let _ = printer_thread.join();

    state = State::Done;
    debug!("relay {}: {:?}", thread_num, state);
    // usb_conn (and its clone held by the printer-side, now joined) drop
    // here, returning the leased interface to the pool.
}

fn run_printer_side(
    thread_num: u32,
    tcp: Arc<TcpConn>,
    usb_conn: Arc<UsbConn>,
    shared: Arc<Shared>,
    global_terminate: Terminate,
    local_terminate: Arc<AtomicBool>,
) {
    let mut last_xfer: Option<ReadTransfer> = None;

    loop {
        {
            let mut inflight = shared.read_inflight.lock().unwrap();
            while !tcp.is_closed() && *inflight {
                inflight = shared.cond.wait(inflight).unwrap();
            }
        }

        if tcp.is_closed() || should_stop(global_terminate, &local_terminate) {
            break;
        }

        let packet = crate::packet::Packet::new();
        let tcp_cb = tcp.clone();
        let shared_cb = shared.clone();
        let global_terminate_cb = global_terminate;
        let local_terminate_cb = local_terminate.clone();

        *shared.read_inflight.lock().unwrap() = true;
        let xfer = usb_conn.submit_read(packet, ASYNC_READ_TIMEOUT, move |outcome| {
            match outcome {
                ReadOutcome::Completed(packet) => {
                    if let Err(e) = tcp_cb.send(&packet) {
                        debug!("relay {}: TCP send of USB read failed: {}", thread_num, e);
                    }
                }
                ReadOutcome::Cancelled => {
                    debug!("relay {}: USB read cancelled", thread_num);
                }
                ReadOutcome::TimedOut => {
                    debug!("relay {}: USB read timed out, reissuing", thread_num);
                }
                ReadOutcome::NoDevice => {
                    info!("relay {}: USB device disconnected on read", thread_num);
                    global_terminate_cb.store(true, Ordering::Relaxed);
                }
                ReadOutcome::Error => {
                    warn!("relay {}: USB read failed", thread_num);
                    local_terminate_cb.store(true, Ordering::Relaxed);
                }
            }
            *shared_cb.read_inflight.lock().unwrap() = false;
            shared_cb.cond.notify_all();
        });

        if let Some(previous) = last_xfer.replace(xfer) {
            previous.join();
        }
    }

    // Teardown: if a read is still in flight, cancel it and wait for the
    // callback to clear the flag before this thread (and its Arc<UsbConn>
    // clone) goes away, per spec.md section 5's asynchronous-cancellation
    // contract.
    if let Some(xfer) = last_xfer.take() {
        xfer.cancel();
        let mut inflight = shared.read_inflight.lock().unwrap();
        while *inflight {
            inflight = shared.cond.wait(inflight).unwrap();
        }
    }
}
