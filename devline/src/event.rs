//! Device event notifications.
//!
//! Devices post an [`Event`] when a request makes a visible state transition
//! (opened, connected, accepted, data read or written, peer closed, lookup
//! finished). The port layer drains the queue to decide which ports to wake.
//! Posting never blocks: when the queue is full the event is dropped.

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::device::DeviceId;
use crate::metrics;
use crate::request::ReqToken;

/// What happened to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Open,
    Connect,
    Accept,
    Read,
    Wrote,
    Close,
    Lookup,
    /// A request failed while being re-driven by the poll loop. The error is
    /// stored in the request.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub device: DeviceId,
    pub request: ReqToken,
}

/// Bounded, fire-and-forget event queue shared by all devices of a runtime.
pub(crate) struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        EventQueue { tx, rx }
    }

    pub(crate) fn signal(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {
                metrics::EVENTS_SIGNALED.increment();
            }
            Err(TrySendError::Full(ev)) => {
                metrics::EVENTS_DROPPED.increment();
                log::warn!("event queue full, dropping {:?}", ev.kind);
            }
            // The runtime holds the receiver, so this only happens during teardown.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn receiver(&self) -> Receiver<Event> {
        self.rx.clone()
    }

    pub(crate) fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
