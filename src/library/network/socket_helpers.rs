use bytes::BytesMut;
use libc::{O_NONBLOCK, fcntl, socklen_t};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener},
    os::fd::RawFd,
};
use tracing::trace;

const READ_CHUNK: usize = 4096;

pub fn build_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let listener = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    listener.set_reuse_address(true)?;
    listener.bind(&SockAddr::from(addr))?;
    listener.listen(backlog)?;
    listener.set_nonblocking(true)?;
    Ok(listener.into())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { fcntl(fd, libc::F_SETFL, flags | O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Non-blocking, no Nagle. Failing to disable Nagle is not fatal.
pub fn prepare_incoming_socket(client_fd: RawFd) -> io::Result<()> {
    let flag: i32 = 1;
    let rc = unsafe {
        libc::setsockopt(
            client_fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &flag as *const _ as *const libc::c_void,
            size_of::<i32>() as socklen_t,
        )
    };
    if rc < 0 {
        trace!("TCP_NODELAY refused on FD:{client_fd}");
    }
    set_nonblocking(client_fd)
}

/// Reads until the descriptor would block or `buf` holds `limit` bytes.
/// `Ok(0)` means end of stream. Only a buffer that is already full on entry
/// is an error; draining it is up to the caller.
pub fn read_available(fd: RawFd, buf: &mut BytesMut, limit: usize) -> io::Result<usize> {
    if buf.len() >= limit {
        return Err(io::Error::other("RecvQ exceeded"));
    }
    let mut total = 0;
    while buf.len() < limit {
        let room = limit - buf.len();
        buf.reserve(READ_CHUNK.min(room));
        let spare = buf.spare_capacity_mut();
        let want = spare.len().min(room);
        let rc = unsafe { libc::read(fd, spare.as_mut_ptr() as *mut libc::c_void, want) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock if total > 0 => Ok(total),
                io::ErrorKind::WouldBlock => Err(err),
                io::ErrorKind::Interrupted => continue,
                _ => Err(err),
            };
        }
        if rc == 0 {
            return Ok(total);
        }
        unsafe { buf.set_len(buf.len() + rc as usize) };
        total += rc as usize;
    }
    Ok(total)
}

/// Writes as much of `buf` as the descriptor takes and drops what was sent.
pub fn write_pending(fd: RawFd, buf: &mut BytesMut) -> io::Result<usize> {
    let mut total = 0;
    while !buf.is_empty() {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
        let _ = buf.split_to(rc as usize);
        total += rc as usize;
    }
    Ok(total)
}
