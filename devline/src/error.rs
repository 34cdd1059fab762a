use std::io;

use thiserror::Error;

use crate::command::Command;

/// Errors surfaced across the device boundary.
///
/// Every failure, whether it came from an OS call, a misuse of a device, or a
/// handler that panicked, is reported through this one type so the port layer
/// has a single error channel.
#[derive(Debug, Error)]
pub enum Error {
    /// The request refers to a device that is not registered.
    #[error("device not found")]
    DeviceNotFound,
    /// The device requires explicit initialization and none has run.
    #[error("device uninitialized: {0}")]
    DeviceUninitialized(&'static str),
    /// The device has no handler for the command.
    #[error("invalid command {command:?} for device {device}")]
    InvalidCommand {
        device: &'static str,
        command: Command,
    },
    /// Stale or out-of-range request token.
    #[error("invalid request")]
    InvalidRequest,
    /// A socket transfer was attempted before the connection was established.
    #[error("socket is not connected")]
    NotConnected,
    /// A command expected to complete synchronously returned pending.
    #[error("{0:?} did not complete synchronously")]
    NotSynchronous(Command),
    /// The bootstrap path was used after the runtime started.
    #[error("runtime already started")]
    AlreadyStarted,
    /// Host name resolution produced no usable address.
    #[error("lookup failed: {0}")]
    Lookup(String),
    /// A device was asked to do something its protocol does not allow.
    #[error("protocol misuse: {0}")]
    Protocol(String),
    /// A handler panicked; the panic payload is kept as text.
    #[error("device fault: {0}")]
    Fault(String),
    /// An OS call failed with the given errno.
    #[error("OS error {code}: {message}")]
    Os { code: i32, message: String },
    /// Setup I/O failed (e.g., creating the wake descriptor).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Configuration value out of range.
    #[error("invalid config: {0}")]
    Config(String),
}

/// Broad class of an [`Error`], for callers that map errors onto their own
/// error catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Device lookup, initialization, command support, configuration.
    Config,
    /// Operating system failure carrying an errno.
    Os,
    /// Misuse of a device protocol.
    Protocol,
    /// Handler fault intercepted by the dispatch boundary.
    Fault,
    /// Bad request handle or call sequence.
    Request,
}

impl Error {
    /// Build an [`Error::Os`] from the calling thread's current `errno`.
    pub fn last_os() -> Self {
        Self::from_os(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// Build an [`Error::Os`] from an explicit errno value.
    pub fn from_os(code: i32) -> Self {
        Error::Os {
            code,
            message: io::Error::from_raw_os_error(code).to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::DeviceNotFound
            | Error::DeviceUninitialized(_)
            | Error::InvalidCommand { .. }
            | Error::Config(_) => ErrorCategory::Config,
            Error::Os { .. } | Error::Io(_) | Error::Lookup(_) => ErrorCategory::Os,
            Error::NotConnected | Error::Protocol(_) => ErrorCategory::Protocol,
            Error::Fault(_) => ErrorCategory::Fault,
            Error::InvalidRequest | Error::NotSynchronous(_) | Error::AlreadyStarted => {
                ErrorCategory::Request
            }
        }
    }

    /// The platform errno carried by this error, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Error::Os { code, .. } => Some(*code),
            Error::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_carries_code_and_message() {
        let err = Error::from_os(libc::ECONNREFUSED);
        assert_eq!(err.os_code(), Some(libc::ECONNREFUSED));
        assert_eq!(err.category(), ErrorCategory::Os);
        let text = err.to_string();
        assert!(text.starts_with(&format!("OS error {}", libc::ECONNREFUSED)));
    }

    #[test]
    fn categories() {
        assert_eq!(Error::DeviceNotFound.category(), ErrorCategory::Config);
        assert_eq!(
            Error::InvalidCommand {
                device: "x",
                command: Command::Rename
            }
            .category(),
            ErrorCategory::Config
        );
        assert_eq!(Error::NotConnected.category(), ErrorCategory::Protocol);
        assert_eq!(Error::Fault("boom".into()).category(), ErrorCategory::Fault);
        assert_eq!(Error::InvalidRequest.category(), ErrorCategory::Request);
        assert_eq!(Error::InvalidRequest.os_code(), None);
    }
}
