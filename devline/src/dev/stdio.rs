//! Console device ("Standard IO").
//!
//! Moves bytes between request buffers and a pair of descriptors, stdin and
//! stdout by default. The device is opened once; later opens share it. A
//! request opened in null mode discards writes and reads nothing.

use std::os::fd::RawFd;

use crate::command::{CommandSet, Outcome};
use crate::device::{Device, DeviceCtx};
use crate::error::Error;
use crate::request::{Request, RequestExt, RequestFlags};
use crate::sys;

#[derive(Debug, Default, Clone, Copy)]
pub struct StdioState {
    /// Discard output, read nothing.
    pub null: bool,
}

fn state(ext: &mut RequestExt) -> Result<&mut StdioState, Error> {
    match ext {
        RequestExt::Stdio(st) => Ok(st),
        _ => Err(Error::Protocol("request has no stdio state".into())),
    }
}

pub struct StdioDevice {
    input: RawFd,
    output: RawFd,
    opened: bool,
    null: bool,
}

impl Default for StdioDevice {
    fn default() -> Self {
        Self::with_fds(libc::STDIN_FILENO, libc::STDOUT_FILENO)
    }
}

impl StdioDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `input` and `output` instead of stdin and stdout. The descriptors
    /// stay owned by the caller.
    pub fn with_fds(input: RawFd, output: RawFd) -> Self {
        StdioDevice {
            input,
            output,
            opened: false,
            null: false,
        }
    }
}

impl Device for StdioDevice {
    fn name(&self) -> &'static str {
        "Standard IO"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::QUIT | CommandSet::OPEN | CommandSet::CLOSE | CommandSet::READ | CommandSet::WRITE
    }

    fn request_ext(&self) -> RequestExt {
        RequestExt::Stdio(StdioState::default())
    }

    fn quit(&mut self) -> Result<(), Error> {
        self.opened = false;
        Ok(())
    }

    fn open(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let st = state(&mut req.ext)?;
        if self.opened {
            // Already open; a device opened as null stays null.
            if self.null {
                st.null = true;
            }
        } else {
            self.null = st.null;
            self.opened = true;
            log::debug!("stdio opened (null: {})", self.null);
        }
        req.flags.insert(RequestFlags::OPEN);
        Ok(Outcome::Done)
    }

    fn close(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.opened = false;
        req.flags.remove(RequestFlags::OPEN);
        Ok(Outcome::Done)
    }

    fn write(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        if state(&mut req.ext)?.null {
            req.actual = req.length;
            return Ok(Outcome::Done);
        }
        let len = req.length.min(req.data.len());
        let ret = unsafe {
            libc::write(
                self.output,
                req.data.as_ptr() as *const libc::c_void,
                len,
            )
        };
        req.actual = sys::cvt_size(ret)?;
        Ok(Outcome::Done)
    }

    fn read(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        req.data.clear();
        req.actual = 0;
        if state(&mut req.ext)?.null {
            return Ok(Outcome::Done);
        }
        req.data.resize(req.length, 0);
        let ret = unsafe {
            libc::read(
                self.input,
                req.data.as_mut_ptr() as *mut libc::c_void,
                req.length,
            )
        };
        let n = match sys::cvt_size(ret) {
            Ok(n) => n,
            Err(e) => {
                req.data.clear();
                return Err(e);
            }
        };
        req.data.truncate(n);
        req.actual = n;
        Ok(Outcome::Done)
    }
}
