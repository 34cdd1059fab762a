//! The poll loop and the wait primitive built on it.

use std::time::Instant;

use crate::command::{Command, Outcome};
use crate::device::{DeviceCtx, DeviceFlags, DeviceId, invoke};
use crate::dispatch::guarded;
use crate::error::Error;
use crate::event::{Event, EventKind, EventQueue};
use crate::metrics;
use crate::registry::DeviceEntry;
use crate::request::{RequestFlags, RequestTable};
use crate::runtime::Runtime;
use crate::sys;

/// How a [`Runtime::wait`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A poll pass reported a change.
    Changed,
    /// The time budget was used up without blocking.
    Expired,
    /// Blocked on the timer for the remaining budget.
    Waited,
}

impl WaitOutcome {
    /// Numeric contract value: `-1` changed, `0` expired, `1` waited.
    pub fn code(self) -> i32 {
        match self {
            WaitOutcome::Changed => -1,
            WaitOutcome::Expired => 0,
            WaitOutcome::Waited => 1,
        }
    }
}

impl Runtime {
    /// Run one poll pass over every device with pending work (or that asks
    /// to be polled regardless). Returns the number of devices that changed.
    pub fn poll_devices(&mut self) -> usize {
        metrics::POLL_PASSES.increment();
        let mut changed = 0;
        for index in 0..self.registry.len() {
            let id = DeviceId(index as u32);
            let Ok(entry) = self.registry.get_mut(id) else {
                continue;
            };
            if entry.pending.is_empty() && !entry.flags.contains(DeviceFlags::AUTO_POLL) {
                continue;
            }
            if poll_device(id, entry, &mut self.requests, &self.events) {
                changed += 1;
            }
        }
        if changed > 0 {
            metrics::POLL_CHANGED.add(changed as u64);
        }
        changed
    }

    /// Wait up to `millisec` for device activity, with `resolution` ms of
    /// slack: reap children, poll once, and block on the timer for whatever
    /// budget is left.
    pub fn wait(&mut self, millisec: u32, resolution: u32) -> Result<WaitOutcome, Error> {
        let start = Instant::now();
        if self.config.reap_children {
            let reaped = sys::reap_children();
            if reaped > 0 {
                log::debug!("reaped {reaped} child processes");
            }
        }

        if self.poll_devices() > 0 {
            metrics::WAIT_CHANGED.increment();
            return Ok(WaitOutcome::Changed);
        }

        let delta = start.elapsed().as_millis() as u64 + resolution as u64;
        if delta >= millisec as u64 {
            metrics::WAIT_EXPIRED.increment();
            return Ok(WaitOutcome::Expired);
        }

        let timer = self.timer_request;
        self.request_mut(timer)?.length = (millisec as u64 - delta) as usize;
        self.do_device_sync(timer, Command::Query)?;
        metrics::WAIT_SLEPT.increment();
        Ok(WaitOutcome::Waited)
    }
}

/// Service one device's pending list. Returns whether anything changed.
fn poll_device(
    id: DeviceId,
    entry: &mut DeviceEntry,
    requests: &mut RequestTable,
    events: &EventQueue,
) -> bool {
    let pending = entry.pending.tokens(requests);

    let mut cx = DeviceCtx::new(id, None, requests, events);
    let handler = entry.device.as_mut();
    let custom = guarded(entry.name, Command::Poll, || Ok(handler.poll(&pending, &mut cx)));
    let completed = std::mem::take(&mut cx.completed);
    match custom {
        Ok(Some(changed)) => {
            for token in completed {
                entry.detach(requests, token);
            }
            return changed;
        }
        Ok(None) => {}
        // The fault is already logged; skip the device for this pass.
        Err(_) => return false,
    }

    let mut changed = false;
    let mut cursor = entry.pending.first(requests);
    while let Some(token) = cursor {
        cursor = entry.pending.next_of(requests, token);

        let Some(mut req) = requests.take(token) else {
            entry.detach(requests, token);
            continue;
        };
        req.flags.remove(RequestFlags::ACTIVE);
        let command = req.command();

        let mut cx = DeviceCtx::new(id, Some(token), requests, events);
        let handler = entry.device.as_mut();
        let result = guarded(entry.name, command, || {
            invoke(handler, command, &mut req, &mut cx)
        });
        let active = req.flags.contains(RequestFlags::ACTIVE);
        requests.put_back(token, req);

        match result {
            Ok(Outcome::Done) => {
                entry.detach(requests, token);
                changed = true;
            }
            Ok(Outcome::Pending) => changed |= active,
            Err(e) => {
                log::debug!("{}: pending {command:?} failed: {e}", entry.name);
                metrics::DISPATCH_ERRORS.increment();
                entry.detach(requests, token);
                if let Some(req) = requests.get_mut(token) {
                    req.set_error(e);
                }
                events.signal(Event {
                    kind: EventKind::Error,
                    device: id,
                    request: token,
                });
                changed = true;
            }
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_codes() {
        assert_eq!(WaitOutcome::Changed.code(), -1);
        assert_eq!(WaitOutcome::Expired.code(), 0);
        assert_eq!(WaitOutcome::Waited.code(), 1);
    }
}
