//! Built-in devices.
//!
//! Only the timer ([`event::EventDevice`]) is registered automatically, by
//! [`Runtime::new`](crate::Runtime::new). Register the others as needed.

pub mod event;
pub mod file;
pub mod net;
#[cfg(target_os = "linux")]
pub mod signal;
pub mod stdio;
