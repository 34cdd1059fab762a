//! Thin wrappers over the libc calls the devices share.
//!
//! Every wrapper checks the return value and maps failure to
//! [`Error::Os`]. The "would block" and "in progress" errno sets are listed
//! per platform so a device never has to guess which codes are transient.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

use crate::error::Error;

/// Errnos meaning "no data yet, try again" on a non-blocking descriptor.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const WOULD_BLOCK: &[i32] = &[libc::EAGAIN];
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const WOULD_BLOCK: &[i32] = &[libc::EAGAIN, libc::EWOULDBLOCK];

/// Errnos meaning a non-blocking connect is still in flight.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const IN_PROGRESS: &[i32] = &[libc::EINPROGRESS, libc::EALREADY, libc::EAGAIN];
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const IN_PROGRESS: &[i32] = &[
    libc::EINPROGRESS,
    libc::EALREADY,
    libc::EAGAIN,
    libc::EWOULDBLOCK,
];

pub(crate) fn is_would_block(code: i32) -> bool {
    WOULD_BLOCK.contains(&code)
}

pub(crate) fn is_in_progress(code: i32) -> bool {
    IN_PROGRESS.contains(&code)
}

/// The calling thread's current errno.
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Map a `-1` return to the current errno.
pub(crate) fn cvt(ret: libc::c_int) -> Result<libc::c_int, Error> {
    if ret < 0 {
        Err(Error::last_os())
    } else {
        Ok(ret)
    }
}

pub(crate) fn cvt_size(ret: libc::ssize_t) -> Result<usize, Error> {
    if ret < 0 {
        Err(Error::last_os())
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn close(fd: RawFd) -> Result<(), Error> {
    cvt(unsafe { libc::close(fd) }).map(drop)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(drop)
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), Error> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFD, 0) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) }).map(drop)
}

pub(crate) fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> Result<(), Error> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    cvt(ret).map(drop)
}

/// Prepare a fresh socket: non-blocking, close-on-exec, and no SIGPIPE
/// where the platform has a socket option for it. Linux relies on
/// `MSG_NOSIGNAL` at send time instead.
pub(crate) fn configure_socket(fd: RawFd) -> Result<(), Error> {
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    setsockopt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
    set_cloexec(fd)?;
    set_nonblocking(fd)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) const SEND_FLAGS: libc::c_int = 0;

/// Build a `sockaddr_in` for an IPv4 endpoint.
pub(crate) fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        sa.sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    sa
}

pub(crate) fn from_sockaddr_in(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
    SocketAddrV4::new(ip, u16::from_be(sa.sin_port))
}

pub(crate) const SOCKADDR_IN_LEN: libc::socklen_t =
    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// Local address of a bound or connected socket. `None` if the socket is not
/// IPv4 or the call fails.
pub(crate) fn local_addr(fd: RawFd) -> Option<SocketAddrV4> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = SOCKADDR_IN_LEN;
    let ret = unsafe { libc::getsockname(fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 || sa.sin_family as libc::c_int != libc::AF_INET {
        return None;
    }
    Some(from_sockaddr_in(&sa))
}

/// Reap every exited child without blocking. Returns how many were reaped.
pub(crate) fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return reaped;
        }
        reaped += 1;
    }
}

/// Wait for `fd` to become readable, up to `timeout_ms`. Returns whether it
/// did; an interrupted wait counts as not ready.
pub(crate) fn poll_readable(fd: RawFd, timeout_ms: i32) -> Result<bool, Error> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    if ret < 0 {
        let code = errno();
        if code == libc::EINTR {
            return Ok(false);
        }
        return Err(Error::from_os(code));
    }
    Ok(ret > 0 && pfd.revents & libc::POLLIN != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errnos() {
        assert!(is_would_block(libc::EAGAIN));
        assert!(is_in_progress(libc::EINPROGRESS));
        assert!(is_in_progress(libc::EALREADY));
        assert!(!is_in_progress(libc::ECONNREFUSED));
        assert!(!is_would_block(libc::EBADF));
    }

    #[test]
    fn sockaddr_conversion() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 8080);
        let sa = sockaddr_in(addr);
        assert_eq!(sa.sin_family as libc::c_int, libc::AF_INET);
        assert_eq!(from_sockaddr_in(&sa), addr);
    }

    #[test]
    fn cvt_maps_failure() {
        assert_eq!(cvt(3).unwrap(), 3);
        let err = close(-1).unwrap_err();
        assert_eq!(err.os_code(), Some(libc::EBADF));
    }

    #[test]
    fn local_addr_of_bound_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let expected = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("unexpected {other}"),
        };
        use std::os::fd::AsRawFd;
        assert_eq!(local_addr(listener.as_raw_fd()), Some(expected));
    }
}
