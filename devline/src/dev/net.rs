//! TCP/UDP socket device ("TCP/IP Network"), IPv4 only.
//!
//! A socket request moves through
//! `closed -> OPEN -> (CONNECT | BIND -> LISTEN) -> transferring -> closed`.
//! Every call is non-blocking: a connect still in flight, a listener with no
//! connection waiting, or a transfer that would block returns
//! [`Outcome::Pending`] and is re-driven by the poll loop.

use std::net::{Ipv4Addr, SocketAddrV4, ToSocketAddrs};
use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::command::{Command, CommandSet, Outcome};
use crate::config::NetConfig;
use crate::device::{Device, DeviceCtx};
use crate::error::Error;
use crate::event::EventKind;
use crate::metrics;
use crate::request::{ReqToken, Request, RequestExt, RequestFlags};
use crate::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

bitflags! {
    /// Socket state machine bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketState: u16 {
        const OPEN = 1 << 0;
        /// Non-blocking connect in flight.
        const ATTEMPT = 1 << 1;
        const CONNECT = 1 << 2;
        const BIND = 1 << 3;
        const LISTEN = 1 << 4;
        const SEND = 1 << 5;
        const RECEIVE = 1 << 6;
        const ACCEPT = 1 << 7;
    }
}

/// Sub-operation of a `Modify` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetModify {
    /// Join (or, with `drop`, leave) an IPv4 multicast group on the
    /// interface `member` (`0.0.0.0` for any).
    Multicast {
        group: Ipv4Addr,
        member: Ipv4Addr,
        drop: bool,
    },
    /// Set IP_TTL.
    Ttl(u32),
    /// A code this device does not understand.
    Unknown(u32),
}

/// Per-request socket state.
#[derive(Debug)]
pub struct NetState {
    pub transport: Transport,
    /// Listen mode: `Connect` binds and listens instead of connecting.
    /// Switched on by `Open` when a local port is set.
    pub listen: bool,
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: SocketState,
    /// Host name for `Lookup`.
    pub host: Option<String>,
    /// Every IPv4 address the last lookup produced.
    pub resolved: Vec<Ipv4Addr>,
    pub modify: Option<NetModify>,
    /// Accepted connections not yet claimed by the caller.
    pub(crate) accepted: Vec<ReqToken>,
}

impl Default for NetState {
    fn default() -> Self {
        NetState {
            transport: Transport::Tcp,
            listen: false,
            local_ip: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
            state: SocketState::empty(),
            host: None,
            resolved: Vec::new(),
            modify: None,
            accepted: Vec::new(),
        }
    }
}

impl NetState {
    pub fn tcp() -> Self {
        Self::default()
    }

    pub fn udp() -> Self {
        NetState {
            transport: Transport::Udp,
            ..Self::default()
        }
    }

    /// Set the local address. A nonzero port puts the socket in listen
    /// mode on `Open`.
    pub fn with_local(mut self, ip: Ipv4Addr, port: u16) -> Self {
        self.local_ip = ip;
        self.local_port = port;
        self
    }

    pub fn is_udp(&self) -> bool {
        self.transport == Transport::Udp
    }

    pub fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }

    pub fn set_remote(&mut self, addr: SocketAddrV4) {
        self.remote_ip = *addr.ip();
        self.remote_port = addr.port();
    }

    pub fn local(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.local_ip, self.local_port)
    }

    /// Number of accepted connections waiting to be claimed.
    pub fn accepted_len(&self) -> usize {
        self.accepted.len()
    }

    fn capture_local(&mut self, fd: RawFd) {
        if let Some(addr) = sys::local_addr(fd) {
            self.local_ip = *addr.ip();
            self.local_port = addr.port();
        }
    }
}

fn state(ext: &mut RequestExt) -> Result<&mut NetState, Error> {
    match ext {
        RequestExt::Net(net) => Ok(net),
        _ => Err(Error::Protocol("request has no socket state".into())),
    }
}

/// The socket device.
#[derive(Default)]
pub struct NetDevice {
    config: NetConfig,
}

impl NetDevice {
    pub fn new(config: NetConfig) -> Self {
        NetDevice { config }
    }

    fn set_nodelay(&self, fd: RawFd) {
        if self.config.nodelay
            && let Err(e) = sys::setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
        {
            log::warn!("TCP_NODELAY on fd {fd}: {e}");
        }
    }

    fn listen(&mut self, req: &mut Request) -> Result<Outcome, Error> {
        let fd = req.handle;
        let net = state(&mut req.ext)?;

        sys::setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        let sa = sys::sockaddr_in(net.local());
        sys::cvt(unsafe {
            libc::bind(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                sys::SOCKADDR_IN_LEN,
            )
        })?;
        net.state.insert(SocketState::BIND);

        if !net.is_udp() {
            sys::cvt(unsafe { libc::listen(fd, self.config.backlog) })?;
            net.state.insert(SocketState::LISTEN);
        }
        net.capture_local(fd);
        log::debug!("fd {fd} listening on {}", net.local());

        // Polling re-invokes the stored command, so the listener now waits
        // for connections.
        req.set_command(Command::Create);
        Ok(Outcome::Pending)
    }

    fn transfer(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let fd = req.handle;
        let writing = req.command() == Command::Write;
        let net = state(&mut req.ext)?;
        if !net.state.contains(SocketState::CONNECT) && !net.is_udp() {
            return Err(Error::NotConnected);
        }

        if writing {
            net.state.insert(SocketState::SEND);
            let end = req.length.min(req.data.len());
            if req.actual >= end {
                cx.signal(EventKind::Wrote);
                return Ok(Outcome::Done);
            }
            let chunk = (end - req.actual).min(self.config.max_transfer);
            let buf = &req.data[req.actual..req.actual + chunk];

            let ret = if net.is_udp() && net.remote_port != 0 {
                let sa = sys::sockaddr_in(net.remote());
                unsafe {
                    libc::sendto(
                        fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        sys::SEND_FLAGS,
                        &sa as *const _ as *const libc::sockaddr,
                        sys::SOCKADDR_IN_LEN,
                    )
                }
            } else {
                unsafe {
                    libc::send(
                        fd,
                        buf.as_ptr() as *const libc::c_void,
                        buf.len(),
                        sys::SEND_FLAGS,
                    )
                }
            };
            if ret < 0 {
                let code = sys::errno();
                if sys::is_would_block(code) {
                    return Ok(Outcome::Pending);
                }
                return Err(Error::from_os(code));
            }

            let n = ret as usize;
            req.actual += n;
            metrics::BYTES_SENT.add(n as u64);
            log::trace!("fd {fd} sent {n} bytes ({}/{end})", req.actual);
            if req.actual >= end {
                cx.signal(EventKind::Wrote);
                return Ok(Outcome::Done);
            }
            req.flags.insert(RequestFlags::ACTIVE);
            return Ok(Outcome::Pending);
        }

        net.state.insert(SocketState::RECEIVE);
        let chunk = if req.length == 0 {
            self.config.max_transfer
        } else if req.actual >= req.length {
            return Ok(Outcome::Done);
        } else {
            (req.length - req.actual).min(self.config.max_transfer)
        };
        let start = req.actual;
        req.data.truncate(start);
        req.data.resize(start + chunk, 0);

        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut sa_len = sys::SOCKADDR_IN_LEN;
        let ret = unsafe {
            libc::recvfrom(
                fd,
                req.data[start..].as_mut_ptr() as *mut libc::c_void,
                chunk,
                0,
                &mut sa as *mut _ as *mut libc::sockaddr,
                &mut sa_len,
            )
        };
        if ret < 0 {
            let code = sys::errno();
            req.data.truncate(start);
            if sys::is_would_block(code) {
                return Ok(Outcome::Pending);
            }
            return Err(Error::from_os(code));
        }

        let n = ret as usize;
        req.data.truncate(start + n);
        if net.is_udp() {
            if sa.sin_family as libc::c_int == libc::AF_INET {
                net.set_remote(sys::from_sockaddr_in(&sa));
            }
        } else if n == 0 {
            // Orderly shutdown by the peer. The socket stays open until the
            // caller closes it.
            net.state.remove(SocketState::CONNECT);
            log::debug!("fd {fd} closed by peer");
            cx.signal(EventKind::Close);
            return Ok(Outcome::Done);
        }

        req.actual += n;
        metrics::BYTES_RECEIVED.add(n as u64);
        log::trace!("fd {fd} received {n} bytes");
        cx.signal(EventKind::Read);
        Ok(Outcome::Done)
    }
}

impl Device for NetDevice {
    fn name(&self) -> &'static str {
        "TCP/IP Network"
    }

    fn commands(&self) -> CommandSet {
        CommandSet::INIT
            | CommandSet::QUIT
            | CommandSet::OPEN
            | CommandSet::CLOSE
            | CommandSet::READ
            | CommandSet::WRITE
            | CommandSet::CONNECT
            | CommandSet::MODIFY
            | CommandSet::CREATE
            | CommandSet::LOOKUP
    }

    fn request_ext(&self) -> RequestExt {
        RequestExt::Net(NetState::default())
    }

    fn open(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let net = state(&mut req.ext)?;
        if net.state.contains(SocketState::OPEN) && req.handle >= 0 {
            return Ok(Outcome::Done);
        }
        net.state = SocketState::empty();

        let (ty, proto) = match net.transport {
            Transport::Tcp => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
            Transport::Udp => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
        };
        let fd = sys::cvt(unsafe { libc::socket(libc::AF_INET, ty, proto) })?;
        if let Err(e) = sys::configure_socket(fd) {
            let _ = sys::close(fd);
            return Err(e);
        }

        net.state.insert(SocketState::OPEN);
        if net.local_port != 0 {
            net.listen = true;
        }
        req.handle = fd;
        req.flags.insert(RequestFlags::OPEN);
        metrics::SOCKETS_OPENED.increment();
        log::debug!("opened {:?} socket fd {fd}", net.transport);
        Ok(Outcome::Done)
    }

    fn close(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let net = state(&mut req.ext)?;

        for token in net.accepted.drain(..) {
            if let Some(conn) = cx.free_request(token)
                && conn.handle >= 0
            {
                let _ = sys::close(conn.handle);
                metrics::SOCKETS_CLOSED.increment();
            }
        }

        if net.state.contains(SocketState::OPEN) {
            net.state = SocketState::empty();
            net.host = None;
            net.resolved.clear();
            let fd = req.handle;
            req.handle = -1;
            req.flags.remove(RequestFlags::OPEN);
            metrics::SOCKETS_CLOSED.increment();
            log::debug!("closed socket fd {fd}");
            sys::close(fd)?;
        }
        Ok(Outcome::Done)
    }

    fn read(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.transfer(req, cx)
    }

    fn write(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        self.transfer(req, cx)
    }

    fn lookup(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let net = state(&mut req.ext)?;
        let host = net
            .host
            .clone()
            .ok_or_else(|| Error::Lookup("no host name given".into()))?;

        let addrs = (host.as_str(), 0)
            .to_socket_addrs()
            .map_err(|e| Error::Lookup(format!("{host}: {e}")))?;
        net.resolved = addrs
            .filter_map(|addr| match addr {
                std::net::SocketAddr::V4(v4) => Some(*v4.ip()),
                std::net::SocketAddr::V6(_) => None,
            })
            .collect();
        let Some(first) = net.resolved.first() else {
            return Err(Error::Lookup(format!("{host}: no IPv4 address")));
        };
        net.remote_ip = *first;
        log::debug!("resolved {host} to {first}");

        req.flags.remove(RequestFlags::DONE);
        cx.signal(EventKind::Lookup);
        Ok(Outcome::Done)
    }

    fn connect(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let fd = req.handle;
        let net = state(&mut req.ext)?;
        if net.state.contains(SocketState::CONNECT) {
            return Ok(Outcome::Done);
        }

        if net.is_udp() {
            net.state.remove(SocketState::ATTEMPT);
            net.state.insert(SocketState::CONNECT);
            cx.signal(EventKind::Connect);
            if net.listen {
                return self.listen(req);
            }
            net.capture_local(fd);
            return Ok(Outcome::Done);
        }

        if net.listen {
            return self.listen(req);
        }

        let sa = sys::sockaddr_in(net.remote());
        let ret = unsafe {
            libc::connect(
                fd,
                &sa as *const _ as *const libc::sockaddr,
                sys::SOCKADDR_IN_LEN,
            )
        };
        let code = if ret == 0 { 0 } else { sys::errno() };
        if code != 0 && code != libc::EISCONN {
            if sys::is_in_progress(code) {
                net.state.insert(SocketState::ATTEMPT);
                return Ok(Outcome::Pending);
            }
            net.state.remove(SocketState::ATTEMPT);
            return Err(Error::from_os(code));
        }

        net.state.remove(SocketState::ATTEMPT);
        net.state.insert(SocketState::CONNECT);
        net.capture_local(fd);
        self.set_nodelay(fd);
        log::debug!("fd {fd} connected to {}", net.remote());
        cx.signal(EventKind::Connect);
        Ok(Outcome::Done)
    }

    /// Accept. Reached by polling a listener.
    fn create(&mut self, req: &mut Request, cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let listener = req.handle;
        let net = state(&mut req.ext)?;

        // A UDP "listener" has nothing to accept but stays pending so it keeps
        // receiving.
        if net.is_udp() {
            cx.signal(EventKind::Accept);
            return Ok(Outcome::Pending);
        }

        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut sa_len = sys::SOCKADDR_IN_LEN;
        let fd = unsafe {
            libc::accept(
                listener,
                &mut sa as *mut _ as *mut libc::sockaddr,
                &mut sa_len,
            )
        };
        if fd < 0 {
            let code = sys::errno();
            if sys::is_would_block(code) || code == libc::EINTR {
                return Ok(Outcome::Pending);
            }
            return Err(Error::from_os(code));
        }
        if let Err(e) = sys::configure_socket(fd) {
            let _ = sys::close(fd);
            return Err(e);
        }
        self.set_nodelay(fd);

        let mut conn_state = NetState {
            state: SocketState::OPEN | SocketState::CONNECT,
            ..NetState::tcp()
        };
        conn_state.set_remote(sys::from_sockaddr_in(&sa));
        conn_state.capture_local(fd);
        log::debug!(
            "fd {listener} accepted fd {fd} from {}",
            conn_state.remote()
        );

        let mut conn = Request::with_ext(cx.device(), RequestExt::Net(conn_state));
        conn.handle = fd;
        conn.flags.insert(RequestFlags::OPEN);
        let token = cx.alloc_request(conn);

        net.state.insert(SocketState::ACCEPT);
        net.accepted.push(token);
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::SOCKETS_OPENED.increment();

        // The listener keeps waiting for more connections, but this pass
        // made progress.
        req.flags.insert(RequestFlags::ACTIVE);
        cx.signal(EventKind::Accept);
        Ok(Outcome::Pending)
    }

    fn modify(&mut self, req: &mut Request, _cx: &mut DeviceCtx<'_>) -> Result<Outcome, Error> {
        let fd = req.handle;
        let net = state(&mut req.ext)?;
        if !net.is_udp() {
            return Err(Error::Protocol("modify is only supported on UDP sockets".into()));
        }

        match net.modify {
            None => Err(Error::Protocol("no modify operation given".into())),
            Some(NetModify::Unknown(code)) => Err(Error::Protocol(format!(
                "unknown modify operation {code}"
            ))),
            Some(NetModify::Multicast {
                group,
                member,
                drop,
            }) => {
                let mreq = libc::ip_mreq {
                    imr_multiaddr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(group.octets()),
                    },
                    imr_interface: libc::in_addr {
                        s_addr: u32::from_ne_bytes(member.octets()),
                    },
                };
                let opt = if drop {
                    libc::IP_DROP_MEMBERSHIP
                } else {
                    libc::IP_ADD_MEMBERSHIP
                };
                sys::cvt(unsafe {
                    libc::setsockopt(
                        fd,
                        libc::IPPROTO_IP,
                        opt,
                        &mreq as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
                    )
                })?;
                Ok(Outcome::Done)
            }
            Some(NetModify::Ttl(ttl)) => {
                let ttl = libc::c_int::try_from(ttl)
                    .map_err(|_| Error::Protocol(format!("TTL {ttl} out of range")))?;
                sys::setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl)?;
                Ok(Outcome::Done)
            }
        }
    }
}
