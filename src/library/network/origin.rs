use crate::library::{
    io::{FdHandle, FdHooks},
    network::{
        link::{ConnHooks, Conn, IrcIo, LineHandler, arm_ping, close_link},
        socket_helpers::prepare_incoming_socket,
    },
};
use socket2::{SockAddr, SockRef, Socket};
use std::{
    io,
    os::fd::{AsRawFd, OwnedFd},
    rc::Rc,
    time::Duration,
};
use tracing::{info, warn};

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_RECVQ_MAX: usize = 8192;

#[derive(Debug, Clone, Copy)]
pub struct LinkSettings {
    pub ping_timeout: Duration,
    pub recvq_max: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            ping_timeout: DEFAULT_PING_TIMEOUT,
            recvq_max: DEFAULT_RECVQ_MAX,
        }
    }
}

/// Hooks for a listening socket. Every accepted connection is registered
/// with `ConnHooks`, a fresh `Conn` and a ping check.
pub struct Origin {
    handler: Rc<dyn LineHandler>,
    settings: LinkSettings,
}

impl Origin {
    pub fn new(handler: Rc<dyn LineHandler>, settings: LinkSettings) -> Self {
        Self {
            handler,
            settings,
        }
    }

    fn admit(&self, io: &mut IrcIo, socket: Socket, addr: SockAddr) {
        let peer = addr.as_socket();
        if let Err(err) = prepare_incoming_socket(socket.as_raw_fd()) {
            warn!("Dropping {:?}: {err}", peer);
            return;
        }
        // on a full registry add_fd closes the socket for us
        let fd = match io.add_fd(OwnedFd::from(socket)) {
            Ok(fd) => fd,
            Err(err) => {
                warn!("Refusing {:?}: {err}", peer);
                return;
            }
        };
        let now = io.now();
        let _ = io.set_payload(fd, Conn::new(peer, now));
        io.set_hooks(fd, ConnHooks::new(self.handler.clone(), self.settings.recvq_max));
        if let Err(err) = arm_ping(io, fd, self.settings.ping_timeout) {
            warn!("No ping check for {:?}: {err}", peer);
            close_link(io, fd, "Server busy");
            return;
        }
        info!("Accepted {:?} as {:?}", peer, fd);
    }
}

impl FdHooks<Conn, FdHandle> for Origin {
    fn on_readable(&mut self, io: &mut IrcIo, fd: FdHandle) {
        loop {
            let accepted = match io.borrow_fd(fd) {
                Some(listener) => SockRef::from(&listener).accept(),
                None => return,
            };
            match accepted {
                Ok((socket, addr)) => self.admit(io, socket, addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept() failed: {err}");
                    break;
                }
            }
        }
    }
}
