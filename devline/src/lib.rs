//! devline — non-blocking device layer for a language runtime.
//!
//! Ports (files, TCP/UDP sockets, signals, stdio) issue [`Request`]s against
//! registered [`Device`]s through one uniform entry point,
//! [`Runtime::do_device`]. A command that can finish now returns
//! [`Outcome::Done`]. One that would block returns [`Outcome::Pending`], and
//! the request sits on its device's pending list until
//! [`Runtime::poll_devices`] (usually driven by [`Runtime::wait`]) finishes
//! it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use devline::dev::net::NetDevice;
//! use devline::{Command, Config, Outcome, Runtime};
//!
//! fn main() -> Result<(), devline::Error> {
//!     let mut rt = Runtime::new(Config::default())?;
//!     let net = rt.register(Box::new(NetDevice::new(rt.config().net.clone())));
//!     rt.start();
//!
//!     let sock = rt.make_request(net)?;
//!     rt.do_device_sync(sock, Command::Open)?;
//!     if let Some(state) = rt.request_mut(sock)?.net_mut() {
//!         state.set_remote("127.0.0.1:7878".parse().unwrap());
//!     }
//!     while rt.do_device(sock, Command::Connect)? == Outcome::Pending {
//!         rt.wait(100, 0)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Unix. The signal device is Linux only.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod dispatch;
pub(crate) mod event;
pub(crate) mod metrics;
pub(crate) mod poll;
pub(crate) mod registry;
pub(crate) mod runtime;
pub(crate) mod sys;

// ── Public modules ──────────────────────────────────────────────────────
pub mod command;
pub mod config;
pub mod dev;
pub mod device;
pub mod error;
pub mod request;

// ── Re-exports: Core types ──────────────────────────────────────────────

/// Device command (ordinal contract).
pub use command::Command;
/// Set of commands a device implements.
pub use command::CommandSet;
/// Synchronous outcome of a command: done or pending.
pub use command::Outcome;
/// Context handed to device handlers.
pub use device::DeviceCtx;
/// Device status and option flags.
pub use device::DeviceFlags;
/// Stable device identifier.
pub use device::DeviceId;
/// The device contract.
pub use device::Device;
/// One I/O operation.
pub use request::Request;
/// Device-specific request state.
pub use request::RequestExt;
/// Request status flags.
pub use request::RequestFlags;
/// Generation-checked request handle.
pub use request::ReqToken;

// ── Re-exports: Runtime ─────────────────────────────────────────────────

/// Device event posted to the runtime's queue.
pub use event::Event;
/// Kind of [`Event`].
pub use event::EventKind;
/// Result of [`Runtime::wait`].
pub use poll::WaitOutcome;
/// Startup phase.
pub use runtime::Phase;
/// The device runtime context.
pub use runtime::Runtime;
/// Cross-thread wake handle for [`Runtime::wait`].
pub use dev::event::WakeHandle;

// ── Re-exports: Config & errors ─────────────────────────────────────────

pub use config::{Config, ConfigBuilder, NetConfig};
pub use error::{Error, ErrorCategory};
