//! The dispatch engine: route one command on one request to its device.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::command::{Command, Outcome};
use crate::device::{DeviceCtx, invoke};
use crate::error::Error;
use crate::metrics;
use crate::request::ReqToken;
use crate::runtime::Runtime;

impl Runtime {
    /// Execute `command` on the request behind `token`.
    ///
    /// `Done` detaches the request from its device's pending list, `Pending`
    /// attaches it (idempotently), and an error detaches it before being
    /// returned. The device is lazily initialized on first use unless it is
    /// marked `MUST_INIT`.
    pub fn do_device(&mut self, token: ReqToken, command: Command) -> Result<Outcome, Error> {
        metrics::DISPATCH_CALLS.increment();
        let result = self.dispatch(token, command);
        if let Err(e) = &result {
            metrics::DISPATCH_ERRORS.increment();
            log::trace!("{command:?} failed: {e}");
        }
        result
    }

    /// Like [`do_device`](Self::do_device), for commands the caller needs
    /// finished now. A `Pending` outcome is reported as
    /// [`Error::NotSynchronous`]; the request stays attached and can still
    /// be aborted.
    pub fn do_device_sync(&mut self, token: ReqToken, command: Command) -> Result<(), Error> {
        match self.do_device(token, command)? {
            Outcome::Done => Ok(()),
            Outcome::Pending => Err(Error::NotSynchronous(command)),
        }
    }

    fn dispatch(&mut self, token: ReqToken, command: Command) -> Result<Outcome, Error> {
        let req = self.requests.get_mut(token).ok_or(Error::InvalidRequest)?;
        req.set_command(command);
        let device = req.device();

        let entry = self.registry.get_mut(device)?;
        entry.ensure_init()?;
        if !entry.commands.supports(command) {
            return Err(Error::InvalidCommand {
                device: entry.name,
                command,
            });
        }

        let mut req = self.requests.take(token).ok_or(Error::InvalidRequest)?;
        let mut cx = DeviceCtx::new(device, Some(token), &mut self.requests, &self.events);
        let handler = entry.device.as_mut();
        let result = guarded(entry.name, command, || {
            invoke(handler, command, &mut req, &mut cx)
        });
        self.requests.put_back(token, req);

        match result {
            Ok(Outcome::Done) => {
                entry.detach(&mut self.requests, token);
                Ok(Outcome::Done)
            }
            Ok(Outcome::Pending) => {
                entry.attach(&mut self.requests, token);
                Ok(Outcome::Pending)
            }
            Err(e) => {
                entry.detach(&mut self.requests, token);
                Err(e)
            }
        }
    }
}

/// Run a handler under the failure boundary: a panic becomes
/// [`Error::Fault`] instead of unwinding through the runtime.
pub(crate) fn guarded<T>(
    device: &'static str,
    command: Command,
    f: impl FnOnce() -> Result<T, Error>,
) -> Result<T, Error> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            metrics::HANDLER_FAULTS.increment();
            let text = panic_text(payload.as_ref());
            log::warn!("{device}: {command:?} handler panicked: {text}");
            Err(Error::Fault(text))
        }
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
