use crate::library::{
    error::Result,
    io::{FdHandle, FdHooks, Interest, Reactor, TimerHandle},
    network::socket_helpers::{read_available, write_pending},
    utils::nano_clock::Timestamp,
};
use bytes::{Bytes, BytesMut};
use memchr::memchr;
use std::{io, net::SocketAddr, rc::Rc, time::Duration};
use tracing::{debug, trace, warn};

/// Reactor flavour used by the network side: connections carry a `Conn`,
/// timers carry the connection they watch.
pub type IrcIo = Reactor<Conn, FdHandle>;

/// Whoever makes sense of the lines. Lives outside this module.
pub trait LineHandler {
    fn on_line(&self, io: &mut IrcIo, fd: FdHandle, line: &[u8]);
    fn on_close(&self, _io: &mut IrcIo, _fd: FdHandle, _reason: &str) {}
}

/// Per-connection state, stored as the descriptor payload.
#[derive(Debug)]
pub struct Conn {
    peer: Option<SocketAddr>,
    recvq: BytesMut,
    sendq: BytesMut,
    last_seen: Timestamp,
    ping_sent: bool,
    ping: Option<TimerHandle>,
    closing: Option<String>,
    lines_in: u64,
    pub nick: Option<String>,
}

impl Conn {
    pub fn new(peer: Option<SocketAddr>, now: Timestamp) -> Self {
        Self {
            peer,
            recvq: BytesMut::with_capacity(512),
            sendq: BytesMut::new(),
            last_seen: now,
            ping_sent: false,
            ping: None,
            closing: None,
            lines_in: 0,
            nick: None,
        }
    }
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
    pub fn last_seen(&self) -> Timestamp {
        self.last_seen
    }
    pub fn lines_in(&self) -> u64 {
        self.lines_in
    }
    pub fn sendq_len(&self) -> usize {
        self.sendq.len()
    }
    pub fn is_closing(&self) -> bool {
        self.closing.is_some()
    }
    pub fn closing_reason(&self) -> Option<&str> {
        self.closing.as_deref()
    }
    /// First reason wins.
    pub fn close(&mut self, reason: &str) {
        if self.closing.is_none() {
            debug!("Closing {:?}: {reason}", self.peer);
            self.closing = Some(reason.to_string());
        }
    }
    fn queue(&mut self, line: &[u8]) {
        self.sendq.extend_from_slice(line);
        self.sendq.extend_from_slice(b"\r\n");
    }
    /// Splits off every complete line, CR and LF stripped, empty ones dropped.
    fn take_lines(&mut self) -> Vec<Bytes> {
        let mut lines = Vec::new();
        while let Some(pos) = memchr(b'\n', &self.recvq) {
            let mut line = self.recvq.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }
            if !line.is_empty() {
                self.lines_in += 1;
                lines.push(line.freeze());
            }
        }
        lines
    }
}

/// Queues `line` plus CRLF and asks for write readiness.
pub fn send_line(io: &mut IrcIo, fd: FdHandle, line: impl AsRef<[u8]>) -> bool {
    let Some(conn) = io.payload_mut(fd) else {
        return false;
    };
    if conn.is_closing() {
        return false;
    }
    conn.queue(line.as_ref());
    io.set_interest(fd, Interest::BOTH)
}

/// Marks the connection for teardown at the end of this iteration.
pub fn close_link(io: &mut IrcIo, fd: FdHandle, reason: &str) {
    if let Some(conn) = io.payload_mut(fd) {
        conn.close(reason);
    }
}

/// Arms the idle check for `fd`. It fires every half period: a connection
/// silent for half the timeout gets a PING, one silent for the whole
/// timeout is closed.
pub fn arm_ping(io: &mut IrcIo, fd: FdHandle, timeout: Duration) -> Result<TimerHandle> {
    let timer = io.add_timer_in(timeout / 2, move |io, me| ping_check(io, me, timeout), fd)?;
    if let Some(conn) = io.payload_mut(fd) {
        conn.ping = Some(timer);
    }
    Ok(timer)
}

fn ping_check(io: &mut IrcIo, me: TimerHandle, timeout: Duration) {
    let Some(fd) = io.cancel_timer(me) else {
        return;
    };
    let now = io.now();
    let Some(conn) = io.payload_mut(fd) else {
        return;
    };
    conn.ping = None;
    if conn.is_closing() {
        return;
    }
    let idle = conn.last_seen.until(now);
    if idle >= timeout {
        conn.close("Ping timeout");
        return;
    }
    if idle >= timeout / 2 && !conn.ping_sent {
        conn.ping_sent = true;
        send_line(io, fd, "PING :micro");
    }
    if let Err(err) = arm_ping(io, fd, timeout) {
        warn!("Cannot re-arm ping check for {:?}: {err}", fd);
        close_link(io, fd, "Server busy");
    }
}

/// Hooks for a registered client connection.
pub struct ConnHooks {
    handler: Rc<dyn LineHandler>,
    recvq_max: usize,
}

impl ConnHooks {
    pub fn new(handler: Rc<dyn LineHandler>, recvq_max: usize) -> Self {
        Self { handler, recvq_max }
    }
}

impl FdHooks<Conn, FdHandle> for ConnHooks {
    fn on_readable(&mut self, io: &mut IrcIo, fd: FdHandle) {
        let Some(raw) = io.raw_fd(fd) else {
            return;
        };
        let now = io.now();
        let Some(conn) = io.payload_mut(fd) else {
            return;
        };
        if conn.is_closing() {
            return;
        }
        match read_available(raw, &mut conn.recvq, self.recvq_max) {
            Ok(0) => conn.close("Remote host closed the connection"),
            Ok(n) => {
                trace!("Read {n} bytes from {:?}", conn.peer);
                conn.last_seen = now;
                conn.ping_sent = false;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => conn.close(&format!("Read error: {err}")),
        }
        let lines = conn.take_lines();
        // whatever is left has no line end yet
        let overflow = conn.recvq.len() >= self.recvq_max;
        for line in lines {
            if io.payload(fd).is_none_or(Conn::is_closing) {
                break;
            }
            self.handler.on_line(io, fd, &line);
        }
        if overflow {
            close_link(io, fd, "RecvQ exceeded");
        }
    }

    fn on_writable(&mut self, io: &mut IrcIo, fd: FdHandle) {
        let Some(raw) = io.raw_fd(fd) else {
            return;
        };
        let Some(conn) = io.payload_mut(fd) else {
            return;
        };
        match write_pending(raw, &mut conn.sendq) {
            Ok(n) => trace!("Wrote {n} bytes to {:?}", conn.peer),
            Err(err) => {
                conn.sendq.clear();
                conn.close(&format!("Write error: {err}"));
            }
        }
        if conn.sendq.is_empty() {
            io.set_interest(fd, Interest::READABLE);
        }
    }

    fn on_post(&mut self, io: &mut IrcIo, fd: FdHandle) -> bool {
        let raw = io.raw_fd(fd);
        let Some(conn) = io.payload_mut(fd) else {
            return false;
        };
        let Some(reason) = conn.closing.clone() else {
            return true;
        };
        // one last try at flushing whatever the handler queued
        if let Some(raw) = raw {
            let _ = write_pending(raw, &mut conn.sendq);
        }
        if let Some(timer) = conn.ping.take() {
            io.cancel_timer(timer);
        }
        self.handler.on_close(io, fd, &reason);
        false
    }
}
