use crate::library::io::slots::SlotKey;
use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, c_int, nfds_t, pollfd};
use std::{io, os::fd::RawFd, time::Duration};
use tracing::trace;

/// What a descriptor wants to be woken up for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(0b01);
    pub const WRITABLE: Self = Self(0b10);
    pub const BOTH: Self = Self(0b11);

    #[inline(always)]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
    #[inline(always)]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
    #[inline(always)]
    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }
    #[inline(always)]
    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
    #[inline(always)]
    fn events(self) -> i16 {
        let mut events = 0;
        if self.is_readable() {
            events |= POLLIN | POLLPRI;
        }
        if self.is_writable() {
            events |= POLLOUT;
        }
        events
    }
}

/// One entry of the ready set.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Readiness {
    pub(crate) key: SlotKey,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Thin wrapper over poll(2). The pollfd array is rebuilt every iteration
/// from the registry and reused between iterations to avoid reallocating.
pub(crate) struct Poller {
    pollfds: Vec<pollfd>,
    keys: Vec<(SlotKey, Interest)>,
}

impl Poller {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            pollfds: Vec::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
        }
    }

    #[inline(always)]
    pub(crate) fn clear(&mut self) {
        self.pollfds.clear();
        self.keys.clear();
    }

    #[inline(always)]
    pub(crate) fn watch(&mut self, key: SlotKey, fd: RawFd, interest: Interest) {
        if interest.is_empty() {
            return;
        }
        self.pollfds.push(pollfd {
            fd,
            events: interest.events(),
            revents: 0,
        });
        self.keys.push((key, interest));
    }

    /// Waits at most `timeout` and appends whatever became ready to `ready`.
    /// EINTR counts as "nothing ready"; any other failure is returned.
    pub(crate) fn wait(&mut self, timeout: Duration, ready: &mut Vec<Readiness>) -> io::Result<usize> {
        let timeout_ms = poll_timeout_ms(timeout);
        trace!("poll: {} fds, timeout {}ms", self.pollfds.len(), timeout_ms);
        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("poll interrupted");
                return Ok(0);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(0);
        }
        for (pfd, (key, interest)) in self.pollfds.iter().zip(self.keys.iter()) {
            let revents = pfd.revents;
            if revents == 0 {
                continue;
            }
            let failed = revents & (POLLHUP | POLLERR | POLLNVAL) != 0;
            let readable =
                revents & (POLLIN | POLLPRI) != 0 || (failed && interest.is_readable());
            let writable =
                revents & POLLOUT != 0 || (failed && !interest.is_readable());
            ready.push(Readiness {
                key: *key,
                readable,
                writable,
            });
        }
        Ok(rc as usize)
    }
}

/// Rounds up to whole milliseconds so the loop never wakes just short of a
/// deadline and spins.
#[inline(always)]
fn poll_timeout_ms(timeout: Duration) -> c_int {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(c_int::MAX as u128) as c_int
}
