//! devline metrics.
//!
//! Process-wide counters for dispatch, polling, events and socket traffic.
//! Exposed through the `metriken` registry, so any exporter that walks
//! `metriken::metrics()` picks them up.

use metriken::{Counter, Gauge, metric};

// ── Dispatch ─────────────────────────────────────────────────────

#[metric(name = "devline/dispatch/calls", description = "Total device commands dispatched")]
pub static DISPATCH_CALLS: Counter = Counter::new();

#[metric(
    name = "devline/dispatch/errors",
    description = "Device commands that returned an error"
)]
pub static DISPATCH_ERRORS: Counter = Counter::new();

#[metric(
    name = "devline/dispatch/faults",
    description = "Handler panics intercepted by the dispatch boundary"
)]
pub static HANDLER_FAULTS: Counter = Counter::new();

#[metric(
    name = "devline/requests/pending",
    description = "Requests currently attached to a pending list"
)]
pub static REQUESTS_PENDING: Gauge = Gauge::new();

// ── Polling ──────────────────────────────────────────────────────

#[metric(name = "devline/poll/passes", description = "Total poll passes")]
pub static POLL_PASSES: Counter = Counter::new();

#[metric(
    name = "devline/poll/changed",
    description = "Devices reporting a change during a poll pass"
)]
pub static POLL_CHANGED: Counter = Counter::new();

#[metric(name = "devline/wait/changed", description = "Waits that returned on a change")]
pub static WAIT_CHANGED: Counter = Counter::new();

#[metric(name = "devline/wait/expired", description = "Waits that returned on expiry")]
pub static WAIT_EXPIRED: Counter = Counter::new();

#[metric(name = "devline/wait/slept", description = "Waits that blocked on the timer")]
pub static WAIT_SLEPT: Counter = Counter::new();

// ── Events ───────────────────────────────────────────────────────

#[metric(name = "devline/events/signaled", description = "Events posted to the queue")]
pub static EVENTS_SIGNALED: Counter = Counter::new();

#[metric(
    name = "devline/events/dropped",
    description = "Events dropped because the queue was full"
)]
pub static EVENTS_DROPPED: Counter = Counter::new();

// ── Sockets ──────────────────────────────────────────────────────

#[metric(name = "devline/sockets/opened", description = "Total sockets opened")]
pub static SOCKETS_OPENED: Counter = Counter::new();

#[metric(name = "devline/sockets/closed", description = "Total sockets closed")]
pub static SOCKETS_CLOSED: Counter = Counter::new();

#[metric(
    name = "devline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(name = "devline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(name = "devline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new();
