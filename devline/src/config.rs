use crate::error::Error;

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the event queue. When full, further events are dropped.
    pub event_queue_capacity: usize,
    /// Initial number of request slots. The arena grows past this on demand.
    pub request_capacity: usize,
    /// Reap exited child processes at the start of every [`wait`](crate::Runtime::wait).
    pub reap_children: bool,
    /// Socket device settings.
    pub net: NetConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_queue_capacity: 1024,
            request_capacity: 64,
            reap_children: true,
            net: NetConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.event_queue_capacity == 0 {
            return Err(Error::Config("event_queue_capacity must be > 0".into()));
        }
        if self.net.max_transfer == 0 || self.net.max_transfer > i32::MAX as usize {
            return Err(Error::Config(
                "net.max_transfer must be > 0 and fit in an i32".into(),
            ));
        }
        if self.net.backlog <= 0 {
            return Err(Error::Config("net.backlog must be > 0".into()));
        }
        Ok(())
    }
}

/// Configuration for the socket device.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Largest chunk moved by one send or receive call.
    pub max_transfer: usize,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Enable TCP_NODELAY on connected and accepted sockets.
    pub nodelay: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_transfer: 32000,
            backlog: libc::SOMAXCONN,
            nodelay: false,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use devline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .event_queue_capacity(256)
///     .max_transfer(16 * 1024)
///     .backlog(128)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.net.max_transfer, 16 * 1024);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Runtime settings ─────────────────────────────────────────────

    /// Set the event queue capacity.
    pub fn event_queue_capacity(mut self, n: usize) -> Self {
        self.config.event_queue_capacity = n;
        self
    }

    /// Set the initial number of request slots.
    pub fn request_capacity(mut self, n: usize) -> Self {
        self.config.request_capacity = n;
        self
    }

    /// Enable or disable child reaping during waits.
    pub fn reap_children(mut self, enable: bool) -> Self {
        self.config.reap_children = enable;
        self
    }

    // ── Socket settings ──────────────────────────────────────────────

    /// Set the largest chunk moved by one socket transfer.
    pub fn max_transfer(mut self, n: usize) -> Self {
        self.config.net.max_transfer = n;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.net.backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY.
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.config.net.nodelay = enable;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
