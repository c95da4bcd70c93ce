// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Shared blocking-socket helpers: the socket timeout and the retry policy
//! applied to every read and write in the crate.

use parking_lot::Mutex;
use std::{
    io,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Timeout set on every connected socket, send and receive side. Bounds how
/// long a blocked reader can outlive a shutdown request.
pub(crate) const SOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Retry policy for timed-out socket operations: retry freely while the
/// connection is live, allow exactly one extra timeout once it is closing.
/// Guarantees readers observe a shutdown within two timeout periods without
/// abandoning a legitimately slow peer.
#[derive(Clone)]
pub(crate) struct IoPolicy {
    closing: Arc<AtomicBool>,
    /// Optional hard deadline (handshake bound); shared across clones so
    /// it can be lifted once the handshake completes.
    deadline: Arc<Mutex<Option<Instant>>>,
}

impl IoPolicy {
    pub(crate) fn new(closing: Arc<AtomicBool>) -> Self {
        Self {
            closing,
            deadline: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn with_deadline(self, deadline: Option<Instant>) -> Self {
        *self.deadline.lock() = deadline;
        self
    }

    pub(crate) fn clear_deadline(&self) {
        *self.deadline.lock() = None;
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Called when an operation timed out; decides whether to go again.
    pub(crate) fn on_timeout(&self, timed_out_once: &mut bool) -> io::Result<()> {
        if let Some(deadline) = *self.deadline.lock() {
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "operation deadline elapsed",
                ));
            }
        }
        if !self.is_closing() {
            return Ok(());
        }
        if !*timed_out_once {
            *timed_out_once = true;
            return Ok(());
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "connection is closing",
        ))
    }
}

#[inline]
pub(crate) fn is_timeout(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Apply [`SOCK_TIMEOUT`] to both directions of a raw socket.
pub(crate) fn set_socket_timeouts(fd: RawFd) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: SOCK_TIMEOUT.as_secs() as libc::time_t,
        tv_usec: 0,
    };
    for opt in [libc::SO_RCVTIMEO, libc::SO_SNDTIMEO] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
