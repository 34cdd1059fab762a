//! The device contract.
//!
//! A device is one I/O subsystem (sockets, files, stdio, signals, timers).
//! It declares which commands it supports through [`Device::commands`] and
//! implements one trait method per supported command. The dispatch engine
//! checks the declared set before calling, so a missing command is always a
//! typed [`Error::InvalidCommand`] and never reaches the device.
//!
//! Every request-level handler returns `Result<Outcome, Error>`:
//! [`Outcome::Done`] when the operation finished, [`Outcome::Pending`] when
//! the request should stay attached and be re-invoked by the poll loop.

use bitflags::bitflags;

use crate::command::{Command, CommandSet, Outcome};
use crate::error::Error;
use crate::event::{Event, EventKind, EventQueue};
use crate::request::{ReqToken, Request, RequestExt, RequestTable};

/// Stable identifier of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u32);

impl DeviceId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Device status and option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceFlags: u8 {
        /// Status: the device has been initialized.
        const INIT = 1 << 0;
        /// Option: do not auto-initialize on first command; require
        /// [`Runtime::init_device`](crate::Runtime::init_device).
        const MUST_INIT = 1 << 2;
        /// Option: poll even when the pending list is empty.
        const AUTO_POLL = 1 << 3;
    }
}

/// Context handed to a device handler.
///
/// Gives the handler access to runtime services without exposing the
/// registry: posting events, allocating requests (a listening socket hands
/// out accepted connections this way), and, for custom pollers, marking
/// requests complete.
pub struct DeviceCtx<'a> {
    pub(crate) device: DeviceId,
    pub(crate) current: Option<ReqToken>,
    pub(crate) requests: &'a mut RequestTable,
    pub(crate) events: &'a EventQueue,
    pub(crate) completed: Vec<ReqToken>,
}

impl<'a> DeviceCtx<'a> {
    pub(crate) fn new(
        device: DeviceId,
        current: Option<ReqToken>,
        requests: &'a mut RequestTable,
        events: &'a EventQueue,
    ) -> Self {
        DeviceCtx {
            device,
            current,
            requests,
            events,
            completed: Vec::new(),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Token of the request being serviced, if any.
    pub fn current(&self) -> Option<ReqToken> {
        self.current
    }

    /// Post an event for the request being serviced.
    pub fn signal(&self, kind: EventKind) {
        if let Some(request) = self.current {
            self.signal_for(request, kind);
        }
    }

    /// Post an event for an arbitrary request.
    pub fn signal_for(&self, request: ReqToken, kind: EventKind) {
        self.events.signal(Event {
            kind,
            device: self.device,
            request,
        });
    }

    /// Allocate a new request owned by the caller of the runtime.
    pub fn alloc_request(&mut self, request: Request) -> ReqToken {
        self.requests.insert(request)
    }

    /// Free a request this device allocated and never handed out.
    pub fn free_request(&mut self, token: ReqToken) -> Option<Request> {
        if self.requests.is_linked(token) {
            return None;
        }
        self.requests.remove(token)
    }

    /// Access a request other than the one being serviced.
    pub fn request(&self, token: ReqToken) -> Option<&Request> {
        self.requests.get(token)
    }

    pub fn request_mut(&mut self, token: ReqToken) -> Option<&mut Request> {
        self.requests.get_mut(token)
    }

    /// From a custom poller: mark a pending request complete. The runtime
    /// detaches it once the poller returns.
    pub fn complete(&mut self, token: ReqToken) {
        self.completed.push(token);
    }
}

/// An I/O subsystem.
///
/// Handlers for commands the device does not list in [`commands`](Self::commands)
/// are never called; their default bodies exist only so a device implements
/// what it needs and nothing else.
pub trait Device {
    /// Display name, used in errors and logs.
    fn name(&self) -> &'static str;

    /// Commands this device implements.
    fn commands(&self) -> CommandSet;

    /// Option flags ([`DeviceFlags::MUST_INIT`], [`DeviceFlags::AUTO_POLL`]).
    fn options(&self) -> DeviceFlags {
        DeviceFlags::empty()
    }

    /// Device-specific state for a freshly made request.
    fn request_ext(&self) -> RequestExt {
        RequestExt::None
    }

    /// Initialize device resources. Called lazily before the first command.
    fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Release device resources at shutdown.
    fn quit(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Custom poller. Return `None` to use the default poller, or
    /// `Some(changed)` after servicing `pending` directly.
    fn poll(&mut self, pending: &[ReqToken], cx: &mut DeviceCtx<'_>) -> Option<bool> {
        let _ = (pending, cx);
        None
    }

    fn open(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Open))
    }

    fn close(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Close))
    }

    fn read(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Read))
    }

    fn write(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Write))
    }

    fn connect(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Connect))
    }

    fn query(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Query))
    }

    fn modify(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Modify))
    }

    fn create(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Create))
    }

    fn delete(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Delete))
    }

    fn rename(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Rename))
    }

    fn lookup(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let _ = (req, cx);
        Err(unsupported(self.name(), Command::Lookup))
    }
}

fn unsupported(device: &'static str, command: Command) -> Error {
    Error::InvalidCommand { device, command }
}

/// Route a request-level command to the matching handler.
///
/// `Init`, `Quit` and `Poll` are device-level and never valid on a request.
pub(crate) fn invoke(
    device: &mut dyn Device,
    command: Command,
    req: &mut Request,
    cx: &mut DeviceCtx<'_>,
) -> Result<Outcome, Error> {
    match command {
        Command::Open => device.open(req, cx),
        Command::Close => device.close(req, cx),
        Command::Read => device.read(req, cx),
        Command::Write => device.write(req, cx),
        Command::Connect => device.connect(req, cx),
        Command::Query => device.query(req, cx),
        Command::Modify => device.modify(req, cx),
        Command::Create => device.create(req, cx),
        Command::Delete => device.delete(req, cx),
        Command::Rename => device.rename(req, cx),
        Command::Lookup => device.lookup(req, cx),
        Command::Init | Command::Quit | Command::Poll => Err(unsupported(device.name(), command)),
    }
}
