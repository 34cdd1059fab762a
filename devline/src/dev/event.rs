//! Timer device ("OS Events").
//!
//! `Query` blocks for `length` milliseconds, returning early when a
//! [`WakeHandle`] fires. `Connect` parks a request on the pending list
//! forever (until aborted) so the poll loop always has something to visit.

use std::os::fd::RawFd;
use std::sync::Arc;

use crate::command::{CommandSet, Outcome};
use crate::device::{Device, DeviceCtx};
use crate::error::Error;
use crate::request::Request;
use crate::sys;

/// Wake descriptor: an eventfd on Linux, a self-pipe elsewhere.
#[derive(Debug)]
struct WakeFd {
    read: RawFd,
    write: RawFd,
}

impl WakeFd {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn new() -> Result<Self, Error> {
        let fd = sys::cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(WakeFd { read: fd, write: fd })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn new() -> Result<Self, Error> {
        let mut fds = [0 as libc::c_int; 2];
        sys::cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        let wake = WakeFd {
            read: fds[0],
            write: fds[1],
        };
        for fd in fds {
            sys::set_cloexec(fd)?;
            sys::set_nonblocking(fd)?;
        }
        Ok(wake)
    }

    fn wake(&self) {
        let val: u64 = 1;
        // A full pipe or saturated counter already means "wake pending".
        unsafe {
            libc::write(self.write, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                return;
            }
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            if self.write != self.read {
                libc::close(self.write);
            }
        }
    }
}

/// Wakes a blocked timer query from any thread.
///
/// A wake that arrives while nobody is waiting is remembered, and the next
/// wait returns immediately.
#[derive(Debug, Clone)]
pub struct WakeHandle {
    inner: Arc<WakeFd>,
}

impl WakeHandle {
    pub fn wake(&self) {
        self.inner.wake();
    }
}

/// The timer device.
pub struct EventDevice {
    wake: Arc<WakeFd>,
}

impl EventDevice {
    /// Create the device and the handle that wakes it.
    pub fn new() -> Result<(Self, WakeHandle), Error> {
        let wake = Arc::new(WakeFd::new()?);
        let handle = WakeHandle {
            inner: wake.clone(),
        };
        Ok((EventDevice { wake }, handle))
    }
}

impl Device for EventDevice {
    fn name(&self) -> &'static str {
        "OS Events"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::INIT | CommandSet::CONNECT | CommandSet::QUERY
    }

    fn connect(&mut self, _req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        Ok(Outcome::Pending)
    }

    fn query(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let timeout = req.length.min(i32::MAX as usize) as i32;
        if sys::poll_readable(self.wake.read, timeout)? {
            self.wake.drain();
        }
        Ok(Outcome::Done)
    }
}
