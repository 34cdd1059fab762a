//! POSIX signal device ("Signal"), Linux only.
//!
//! `Open` blocks the request's signals for the calling thread so they queue
//! up instead of being delivered. `Read` collects whatever is queued without
//! waiting and stays pending while nothing has arrived.

use crate::command::{CommandSet, Outcome};
use crate::device::{Device, DeviceCtx};
use crate::error::Error;
use crate::event::EventKind;
use crate::request::{Request, RequestExt, RequestFlags};
use crate::sys;

/// A signal taken off the queue by `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedSignal {
    pub signo: i32,
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
}

#[derive(Debug, Default)]
pub struct SignalState {
    /// Signal numbers this request listens for.
    pub signals: Vec<i32>,
    /// Filled by `Read`; `actual` holds the count.
    pub received: Vec<ReceivedSignal>,
}

impl SignalState {
    pub fn new(signals: impl Into<Vec<i32>>) -> Self {
        SignalState {
            signals: signals.into(),
            received: Vec::new(),
        }
    }

    fn mask(&self) -> Result<libc::sigset_t, Error> {
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        sys::cvt(unsafe { libc::sigemptyset(&mut set) })?;
        for &signo in &self.signals {
            sys::cvt(unsafe { libc::sigaddset(&mut set, signo) })?;
        }
        Ok(set)
    }
}

fn state(ext: &mut RequestExt) -> Result<&mut SignalState, Error> {
    match ext {
        RequestExt::Signal(s) => Ok(s),
        _ => Err(Error::Protocol("request has no signal state".into())),
    }
}

fn set_blocked(set: &libc::sigset_t, how: libc::c_int) -> Result<(), Error> {
    sys::cvt(unsafe { libc::sigprocmask(how, set, std::ptr::null_mut()) }).map(drop)
}

#[derive(Debug, Default)]
pub struct SignalDevice;

impl SignalDevice {
    pub fn new() -> Self {
        SignalDevice
    }
}

impl Device for SignalDevice {
    fn name(&self) -> &'static str {
        "Signal"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::OPEN | CommandSet::CLOSE | CommandSet::READ
    }

    fn request_ext(&self) -> RequestExt {
        RequestExt::Signal(SignalState::default())
    }

    fn open(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let mask = state(&mut req.ext)?.mask()?;
        set_blocked(&mask, libc::SIG_BLOCK)?;
        req.flags.insert(RequestFlags::OPEN);
        cx.signal(EventKind::Open);
        Ok(Outcome::Done)
    }

    fn close(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let mask = state(&mut req.ext)?.mask()?;
        set_blocked(&mask, libc::SIG_UNBLOCK)?;
        req.flags.remove(RequestFlags::OPEN);
        Ok(Outcome::Done)
    }

    fn read(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let max = req.length;
        let sig = state(&mut req.ext)?;
        let mask = sig.mask()?;
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        sig.received.clear();
        while sig.received.len() < max {
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let ret = unsafe { libc::sigtimedwait(&mask, &mut info, &timeout) };
            if ret < 0 {
                let code = sys::errno();
                if code != libc::EAGAIN && sig.received.is_empty() {
                    return Err(Error::from_os(code));
                }
                break;
            }
            sig.received.push(ReceivedSignal {
                signo: ret,
                pid: unsafe { info.si_pid() },
                uid: unsafe { info.si_uid() },
            });
        }

        req.actual = sig.received.len();
        if req.actual == 0 {
            return Ok(Outcome::Pending);
        }
        log::debug!("read {} signals", req.actual);
        cx.signal(EventKind::Read);
        Ok(Outcome::Done)
    }
}
