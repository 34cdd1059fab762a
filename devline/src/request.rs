//! I/O requests, the request arena, and per-device pending lists.
//!
//! Requests live in a [`RequestTable`] owned by the runtime and are referred
//! to by generation-checked [`ReqToken`]s. A device's pending list is a doubly
//! linked list threaded through the arena slots, so attach and detach are O(1)
//! and a request can sit in at most one list.

use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::command::Command;
use crate::dev::file::FileState;
use crate::dev::net::NetState;
#[cfg(target_os = "linux")]
use crate::dev::signal::SignalState;
use crate::dev::stdio::StdioState;
use crate::device::DeviceId;
use crate::error::Error;

bitflags! {
    /// Request status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u16 {
        /// The port is open.
        const OPEN = 1 << 0;
        /// Completed outside the normal return path (e.g., failed during polling).
        const DONE = 1 << 1;
        /// Flush after write.
        const FLUSH = 1 << 2;
        /// Attached to its device's pending list.
        const PENDING = 1 << 3;
        /// Made progress during the current poll pass.
        const ACTIVE = 1 << 5;
    }
}

/// Opaque handle to a request in the runtime's arena.
///
/// Includes a generation counter so a token kept after
/// [`Runtime::free_request`](crate::Runtime::free_request) is rejected
/// instead of aliasing a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReqToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ReqToken {
    /// Slot index. Useful for indexing into per-request side tables.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Device-specific request state.
#[derive(Debug, Default)]
pub enum RequestExt {
    #[default]
    None,
    Net(NetState),
    File(FileState),
    Stdio(StdioState),
    #[cfg(target_os = "linux")]
    Signal(SignalState),
}

/// One pending or completed I/O operation.
///
/// The port layer fills in the fields a command needs before dispatching it
/// and reads the results back afterwards. Devices mutate the request in
/// place: a partial write advances `actual`, a listen switches the stored
/// command to accept, and so on.
#[derive(Debug)]
pub struct Request {
    device: DeviceId,
    command: Command,
    pub flags: RequestFlags,
    /// OS handle (file descriptor or socket), `-1` when none.
    pub handle: RawFd,
    /// Timeout in milliseconds, where the device honors one.
    pub timeout: i32,
    /// Transfer buffer. Writes send `data[actual..length]`; reads fill it.
    pub data: Vec<u8>,
    /// Number of bytes (or items) requested.
    pub length: usize,
    /// Number of bytes (or items) actually transferred.
    pub actual: usize,
    /// Stream offset for seekable devices, `-1` for append.
    pub index: i64,
    pub ext: RequestExt,
    error: Option<Error>,
}

impl Request {
    pub fn new(device: DeviceId) -> Self {
        Request {
            device,
            command: Command::Init,
            flags: RequestFlags::empty(),
            handle: -1,
            timeout: 0,
            data: Vec::new(),
            length: 0,
            actual: 0,
            index: 0,
            ext: RequestExt::None,
            error: None,
        }
    }

    pub fn with_ext(device: DeviceId, ext: RequestExt) -> Self {
        let mut req = Request::new(device);
        req.ext = ext;
        req
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The command the request is currently executing (and that polling
    /// will re-invoke).
    pub fn command(&self) -> Command {
        self.command
    }

    /// Change the command the poll loop re-invokes on the next pass.
    pub fn set_command(&mut self, command: Command) {
        self.command = command;
    }

    /// Load `data` as the payload of a write.
    pub fn set_payload(&mut self, data: Vec<u8>) {
        self.length = data.len();
        self.data = data;
        self.actual = 0;
    }

    /// Prepare the buffer for a read of up to `len` bytes.
    pub fn prepare_read(&mut self, len: usize) {
        self.data.clear();
        self.length = len;
        self.actual = 0;
    }

    /// Bytes moved by the last transfer.
    pub fn transferred(&self) -> &[u8] {
        &self.data[..self.actual.min(self.data.len())]
    }

    pub fn is_pending(&self) -> bool {
        self.flags.contains(RequestFlags::PENDING)
    }

    /// Take the error stored by the poll loop when a pending request failed.
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn set_error(&mut self, error: Error) {
        self.flags.insert(RequestFlags::DONE);
        self.error = Some(error);
    }

    pub fn net(&self) -> Option<&NetState> {
        match &self.ext {
            RequestExt::Net(n) => Some(n),
            _ => None,
        }
    }

    pub fn net_mut(&mut self) -> Option<&mut NetState> {
        match &mut self.ext {
            RequestExt::Net(n) => Some(n),
            _ => None,
        }
    }

    pub fn file(&self) -> Option<&FileState> {
        match &self.ext {
            RequestExt::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileState> {
        match &mut self.ext {
            RequestExt::File(f) => Some(f),
            _ => None,
        }
    }
}

/// Arena slot. `linked` is the source of truth for pending-list membership;
/// the request's `PENDING` flag mirrors it.
struct Slot {
    request: Option<Request>,
    occupied: bool,
    linked: bool,
    generation: u32,
    prev: Option<u32>,
    next: Option<u32>,
}

impl Slot {
    fn vacant() -> Self {
        Slot {
            request: None,
            occupied: false,
            linked: false,
            generation: 0,
            prev: None,
            next: None,
        }
    }
}

/// Arena of requests with a free list for O(1) allocation.
pub(crate) struct RequestTable {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
}

impl RequestTable {
    pub(crate) fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot::vacant());
        }
        // Free list: indices in reverse order so pop gives lowest first.
        let free_list: Vec<u32> = (0..capacity as u32).rev().collect();
        RequestTable { slots, free_list }
    }

    pub(crate) fn insert(&mut self, request: Request) -> ReqToken {
        let index = match self.free_list.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::vacant());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.request = Some(request);
        slot.occupied = true;
        ReqToken {
            index,
            generation: slot.generation,
        }
    }

    /// Remove a request. The caller must have detached it first.
    pub(crate) fn remove(&mut self, token: ReqToken) -> Option<Request> {
        let slot = self.slot_mut(token)?;
        debug_assert!(!slot.linked, "removing a request that is still pending");
        let req = slot.request.take();
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(token.index);
        req
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, token: ReqToken) -> bool {
        self.slot(token).is_some()
    }

    pub(crate) fn get(&self, token: ReqToken) -> Option<&Request> {
        self.slot(token)?.request.as_ref()
    }

    pub(crate) fn get_mut(&mut self, token: ReqToken) -> Option<&mut Request> {
        self.slot_mut(token)?.request.as_mut()
    }

    /// Take a request out of its slot while a handler runs. The slot stays
    /// occupied (and linked, if it was) until [`put_back`](Self::put_back).
    pub(crate) fn take(&mut self, token: ReqToken) -> Option<Request> {
        self.slot_mut(token)?.request.take()
    }

    pub(crate) fn put_back(&mut self, token: ReqToken, mut request: Request) {
        if let Some(slot) = self.slot_mut(token) {
            request.flags.set(RequestFlags::PENDING, slot.linked);
            slot.request = Some(request);
        }
    }

    pub(crate) fn is_linked(&self, token: ReqToken) -> bool {
        self.slot(token).is_some_and(|s| s.linked)
    }

    /// Number of live requests.
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied).count()
    }

    fn token_at(&self, index: u32) -> ReqToken {
        ReqToken {
            index,
            generation: self.slots[index as usize].generation,
        }
    }

    fn slot(&self, token: ReqToken) -> Option<&Slot> {
        self.slots
            .get(token.index as usize)
            .filter(|s| s.occupied && s.generation == token.generation)
    }

    fn slot_mut(&mut self, token: ReqToken) -> Option<&mut Slot> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|s| s.occupied && s.generation == token.generation)
    }
}

/// A device's queue of requests awaiting completion, in attach order.
#[derive(Debug, Default)]
pub(crate) struct PendingList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl PendingList {
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Append a request. Returns false (and changes nothing) if the request
    /// is already linked or the token is stale.
    pub(crate) fn attach(&mut self, table: &mut RequestTable, token: ReqToken) -> bool {
        let tail = self.tail;
        let Some(slot) = table.slot_mut(token) else {
            return false;
        };
        if slot.linked {
            return false;
        }
        slot.linked = true;
        slot.prev = tail;
        slot.next = None;
        if let Some(req) = slot.request.as_mut() {
            req.flags.insert(RequestFlags::PENDING);
        }
        match tail {
            Some(t) => table.slots[t as usize].next = Some(token.index),
            None => self.head = Some(token.index),
        }
        self.tail = Some(token.index);
        self.len += 1;
        true
    }

    /// Unlink a request. Returns false if it was not linked.
    pub(crate) fn detach(&mut self, table: &mut RequestTable, token: ReqToken) -> bool {
        let Some(slot) = table.slot_mut(token) else {
            return false;
        };
        if !slot.linked {
            return false;
        }
        let (prev, next) = (slot.prev, slot.next);
        slot.linked = false;
        slot.prev = None;
        slot.next = None;
        if let Some(req) = slot.request.as_mut() {
            req.flags.remove(RequestFlags::PENDING);
        }
        match prev {
            Some(p) => table.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => table.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
        true
    }

    pub(crate) fn first(&self, table: &RequestTable) -> Option<ReqToken> {
        self.head.map(|i| table.token_at(i))
    }

    /// The request after `token`, if `token` is still linked.
    pub(crate) fn next_of(&self, table: &RequestTable, token: ReqToken) -> Option<ReqToken> {
        let slot = table.slot(token)?;
        if !slot.linked {
            return None;
        }
        slot.next.map(|i| table.token_at(i))
    }

    /// Snapshot of the linked tokens in attach order.
    pub(crate) fn tokens(&self, table: &RequestTable) -> Vec<ReqToken> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(i) = cur {
            out.push(table.token_at(i));
            cur = table.slots[i as usize].next;
        }
        out
    }
}
