use bitflags::bitflags;

/// Device commands.
///
/// The discriminants are an ordinal contract: callers that persist a command
/// numerically (port state, event payloads) rely on these exact values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Initialize device resources.
    Init = 0,
    /// Release device resources.
    Quit = 1,
    Open = 2,
    Close = 3,
    Read = 4,
    Write = 5,
    /// Custom device poll.
    Poll = 6,
    /// Connect (inbound or outbound).
    Connect = 7,
    Query = 8,
    /// Device-specific escape hatch carrying a sub-operation.
    Modify = 9,
    /// Create a target; sockets use this slot for accept.
    Create = 10,
    Delete = 11,
    Rename = 12,
    /// Name resolution.
    Lookup = 13,
}

impl Command {
    /// Number of command slots.
    pub const COUNT: usize = 14;

    pub const ALL: [Command; Self::COUNT] = [
        Command::Init,
        Command::Quit,
        Command::Open,
        Command::Close,
        Command::Read,
        Command::Write,
        Command::Poll,
        Command::Connect,
        Command::Query,
        Command::Modify,
        Command::Create,
        Command::Delete,
        Command::Rename,
        Command::Lookup,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    #[inline]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The single-bit set containing this command.
    #[inline]
    pub fn bit(self) -> CommandSet {
        CommandSet::from_bits_retain(1 << self as u16)
    }
}

bitflags! {
    /// The set of commands a device implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandSet: u16 {
        const INIT = 1 << 0;
        const QUIT = 1 << 1;
        const OPEN = 1 << 2;
        const CLOSE = 1 << 3;
        const READ = 1 << 4;
        const WRITE = 1 << 5;
        const POLL = 1 << 6;
        const CONNECT = 1 << 7;
        const QUERY = 1 << 8;
        const MODIFY = 1 << 9;
        const CREATE = 1 << 10;
        const DELETE = 1 << 11;
        const RENAME = 1 << 12;
        const LOOKUP = 1 << 13;
    }
}

impl CommandSet {
    #[inline]
    pub fn supports(self, command: Command) -> bool {
        self.contains(command.bit())
    }
}

/// Synchronous outcome of a device handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation finished. Request-embedded state says how.
    Done,
    /// Not finished yet; the request stays attached and is retried by polling.
    Pending,
}

impl Outcome {
    pub fn is_done(self) -> bool {
        self == Outcome::Done
    }

    pub fn is_pending(self) -> bool {
        self == Outcome::Pending
    }
}
