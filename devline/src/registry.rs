use crate::command::{Command, CommandSet};
use crate::device::{Device, DeviceFlags, DeviceId};
use crate::dispatch::guarded;
use crate::error::Error;
use crate::metrics;
use crate::request::{PendingList, ReqToken, RequestTable};

/// A registered device plus the runtime-side state kept for it.
pub(crate) struct DeviceEntry {
    pub(crate) device: Box<dyn Device>,
    pub(crate) name: &'static str,
    /// Fixed at registration.
    pub(crate) commands: CommandSet,
    /// Options from the device plus the runtime's `INIT` status bit.
    pub(crate) flags: DeviceFlags,
    pub(crate) pending: PendingList,
}

impl DeviceEntry {
    fn new(device: Box<dyn Device>) -> Self {
        let name = device.name();
        let commands = device.commands();
        let flags = device.options() & (DeviceFlags::MUST_INIT | DeviceFlags::AUTO_POLL);
        DeviceEntry {
            device,
            name,
            commands,
            flags,
            pending: PendingList::default(),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.flags.contains(DeviceFlags::INIT)
    }

    /// Run the device's init hook and record success.
    pub(crate) fn init(&mut self) -> Result<(), Error> {
        if self.is_initialized() {
            return Ok(());
        }
        let device = &mut self.device;
        match guarded(self.name, Command::Init, || device.init()) {
            Ok(()) => {
                self.flags.insert(DeviceFlags::INIT);
                log::debug!("device {} initialized", self.name);
                Ok(())
            }
            Err(e) => {
                log::warn!("device {} failed to initialize: {e}", self.name);
                Err(e)
            }
        }
    }

    /// Lazy init before a command. A `MUST_INIT` device is never
    /// auto-initialized. Otherwise the device counts as initialized whatever
    /// its init hook returns, and the command proceeds.
    pub(crate) fn ensure_init(&mut self) -> Result<(), Error> {
        if self.is_initialized() {
            return Ok(());
        }
        if self.flags.contains(DeviceFlags::MUST_INIT) {
            return Err(Error::DeviceUninitialized(self.name));
        }
        if self.init().is_err() {
            self.flags.insert(DeviceFlags::INIT);
        }
        Ok(())
    }

    pub(crate) fn quit(&mut self) {
        if !self.is_initialized() {
            return;
        }
        let device = &mut self.device;
        if let Err(e) = guarded(self.name, Command::Quit, || device.quit()) {
            log::warn!("device {} failed to shut down: {e}", self.name);
        }
        self.flags.remove(DeviceFlags::INIT);
        log::debug!("device {} shut down", self.name);
    }

    pub(crate) fn attach(&mut self, requests: &mut RequestTable, token: ReqToken) {
        if self.pending.attach(requests, token) {
            metrics::REQUESTS_PENDING.increment();
        }
    }

    pub(crate) fn detach(&mut self, requests: &mut RequestTable, token: ReqToken) -> bool {
        let detached = self.pending.detach(requests, token);
        if detached {
            metrics::REQUESTS_PENDING.decrement();
        }
        detached
    }
}

/// The devices known to one runtime, in registration order.
///
/// Registration order is polling priority. Shutdown runs in reverse.
#[derive(Default)]
pub(crate) struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
}

impl DeviceRegistry {
    pub(crate) fn register(&mut self, device: Box<dyn Device>) -> DeviceId {
        let id = DeviceId(self.entries.len() as u32);
        log::debug!("registered device {} as {}", device.name(), id.0);
        self.entries.push(DeviceEntry::new(device));
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, id: DeviceId) -> Result<&DeviceEntry, Error> {
        self.entries.get(id.index()).ok_or(Error::DeviceNotFound)
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Result<&mut DeviceEntry, Error> {
        self.entries.get_mut(id.index()).ok_or(Error::DeviceNotFound)
    }

    pub(crate) fn find(&self, name: &str) -> Option<DeviceId> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| DeviceId(i as u32))
    }

    pub(crate) fn iter_mut_rev(&mut self) -> impl Iterator<Item = &mut DeviceEntry> {
        self.entries.iter_mut().rev()
    }
}
