use crossbeam_channel::Receiver;

use crate::command::{Command, Outcome};
use crate::config::Config;
use crate::dev::event::{EventDevice, WakeHandle};
use crate::device::{Device, DeviceCtx, DeviceFlags, DeviceId, invoke};
use crate::error::Error;
use crate::event::{Event, EventQueue};
use crate::registry::DeviceRegistry;
use crate::request::{ReqToken, Request, RequestTable};

/// Startup phase of a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before [`Runtime::start`]. [`Runtime::boot_open`] is available.
    Boot,
    Running,
}

/// Device runtime context: the registry, the request arena, the event queue
/// and the timer used by [`wait`](Runtime::wait).
///
/// One thread drives a runtime. Several runtimes may coexist; nothing here
/// is process-global.
pub struct Runtime {
    pub(crate) config: Config,
    pub(crate) registry: DeviceRegistry,
    pub(crate) requests: RequestTable,
    pub(crate) events: EventQueue,
    pub(crate) phase: Phase,
    pub(crate) timer: DeviceId,
    /// Request reused for every timer query issued by `wait`.
    pub(crate) timer_request: ReqToken,
    waker: WakeHandle,
}

impl Runtime {
    /// Create a runtime. The timer device is registered first, so it is
    /// always device 0.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let (timer_device, waker) = EventDevice::new()?;
        let mut registry = DeviceRegistry::default();
        let timer = registry.register(Box::new(timer_device));
        let mut requests = RequestTable::new(config.request_capacity);
        let timer_request = requests.insert(Request::new(timer));
        let events = EventQueue::new(config.event_queue_capacity);
        Ok(Runtime {
            config,
            registry,
            requests,
            events,
            phase: Phase::Boot,
            timer,
            timer_request,
            waker,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Add a device. Returns its stable id. Registration order is polling
    /// order.
    pub fn register(&mut self, device: Box<dyn Device>) -> DeviceId {
        self.registry.register(device)
    }

    /// Id of the first device registered under `name`.
    pub fn find_device(&self, name: &str) -> Option<DeviceId> {
        self.registry.find(name)
    }

    pub fn timer_device(&self) -> DeviceId {
        self.timer
    }

    /// Handle that interrupts a blocked [`wait`](Runtime::wait) from any thread.
    pub fn waker(&self) -> WakeHandle {
        self.waker.clone()
    }

    /// Status and option flags of a device.
    pub fn device_flags(&self, id: DeviceId) -> Result<DeviceFlags, Error> {
        Ok(self.registry.get(id)?.flags)
    }

    /// Number of requests attached to a device's pending list.
    pub fn pending_count(&self, id: DeviceId) -> Result<usize, Error> {
        Ok(self.registry.get(id)?.pending.len())
    }

    /// Pending requests of a device, in attach order.
    pub fn pending(&self, id: DeviceId) -> Result<Vec<ReqToken>, Error> {
        Ok(self.registry.get(id)?.pending.tokens(&self.requests))
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Allocate a request for `device`, with the device's default extension
    /// state.
    pub fn make_request(&mut self, device: DeviceId) -> Result<ReqToken, Error> {
        let ext = self.registry.get(device)?.device.request_ext();
        Ok(self.requests.insert(Request::with_ext(device, ext)))
    }

    /// Release a request, detaching it from its pending list first.
    pub fn free_request(&mut self, token: ReqToken) -> Result<Request, Error> {
        self.abort(token)?;
        self.requests.remove(token).ok_or(Error::InvalidRequest)
    }

    pub fn request(&self, token: ReqToken) -> Result<&Request, Error> {
        self.requests.get(token).ok_or(Error::InvalidRequest)
    }

    pub fn request_mut(&mut self, token: ReqToken) -> Result<&mut Request, Error> {
        self.requests.get_mut(token).ok_or(Error::InvalidRequest)
    }

    /// Number of live requests, the timer's own included.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Cancel a request: detach it from its device's pending list. OS
    /// resources stay open until the request is closed. Returns whether the
    /// request was pending.
    pub fn abort(&mut self, token: ReqToken) -> Result<bool, Error> {
        let device = self.request(token)?.device();
        let entry = self.registry.get_mut(device)?;
        Ok(entry.detach(&mut self.requests, token))
    }

    /// Claim the connections a listening socket has accepted so far.
    pub fn take_accepted(&mut self, listener: ReqToken) -> Result<Vec<ReqToken>, Error> {
        let net = self
            .request_mut(listener)?
            .net_mut()
            .ok_or_else(|| Error::Protocol("not a socket request".into()))?;
        Ok(std::mem::take(&mut net.accepted))
    }

    // ── Events ───────────────────────────────────────────────────────

    /// Receiver side of the event queue. Clones share the queue.
    pub fn events(&self) -> Receiver<Event> {
        self.events.receiver()
    }

    pub fn next_event(&self) -> Option<Event> {
        self.events.try_recv()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Leave the boot phase.
    pub fn start(&mut self) {
        if self.phase == Phase::Boot {
            log::debug!("runtime started");
        }
        self.phase = Phase::Running;
    }

    /// Initialize a device explicitly. Required for `MUST_INIT` devices;
    /// a no-op for devices already initialized.
    pub fn init_device(&mut self, id: DeviceId) -> Result<(), Error> {
        self.registry.get_mut(id)?.init()
    }

    /// Open a request during the boot phase, before the general dispatch
    /// machinery is in use. Does no pending-list bookkeeping; the open must
    /// finish synchronously.
    pub fn boot_open(&mut self, token: ReqToken) -> Result<(), Error> {
        if self.phase != Phase::Boot {
            return Err(Error::AlreadyStarted);
        }
        let device = self.request(token)?.device();
        let entry = self.registry.get_mut(device)?;
        entry.init()?;
        let mut req = self.requests.take(token).ok_or(Error::InvalidRequest)?;
        req.set_command(Command::Open);
        let mut cx = DeviceCtx::new(device, Some(token), &mut self.requests, &self.events);
        let result = invoke(entry.device.as_mut(), Command::Open, &mut req, &mut cx);
        self.requests.put_back(token, req);
        match result? {
            Outcome::Done => Ok(()),
            Outcome::Pending => Err(Error::NotSynchronous(Command::Open)),
        }
    }

    /// Shut down every initialized device, in reverse registration order.
    pub fn quit_devices(&mut self) {
        for entry in self.registry.iter_mut_rev() {
            entry.quit();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.quit_devices();
    }
}
