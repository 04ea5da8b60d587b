pub mod poller;
pub(crate) mod slots;

use crate::library::{
    error::{Error, Result},
    io::{
        poller::{Poller, Readiness},
        slots::{SlotKey, Slots},
    },
    utils::nano_clock::{Clock, ClockSource, SystemClock, Timestamp},
};
use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    time::Duration,
};
use tracing::{debug, error, info, trace};

pub use poller::Interest;

const DEFAULT_CAPACITY_HINT: usize = 64;
const DEFAULT_IDLE_CEILING: Duration = Duration::from_secs(1);
const DEFAULT_MAX_FDS: usize = 4096;
const DEFAULT_MAX_TIMERS: usize = 65_536;

/// Handle to a registered descriptor. Goes stale once the entry is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdHandle(SlotKey);

/// Handle to an armed timer. Goes stale once the timer fired or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(SlotKey);

/// Behaviour attached to a descriptor. All three hooks default to no-ops.
///
/// Hooks get the reactor itself, so they can register descriptors and timers,
/// reach their payload through `io.payload_mut(fd)` or stop the loop. An entry
/// whose `on_post` returns false is closed at the end of the iteration, after
/// every other hook of that iteration has run.
pub trait FdHooks<P, T> {
    fn on_readable(&mut self, _io: &mut Reactor<P, T>, _fd: FdHandle) {}
    fn on_writable(&mut self, _io: &mut Reactor<P, T>, _fd: FdHandle) {}
    fn on_post(&mut self, _io: &mut Reactor<P, T>, _fd: FdHandle) -> bool {
        true
    }
}

/// The hooks every descriptor starts with.
pub struct NoHooks;

impl<P, T> FdHooks<P, T> for NoHooks {}

/// Timer callbacks. A timer fires once; to recur, the callback registers a
/// new one (taking its payload back with `cancel_timer` first if needed).
pub type TimerCallback<P, T> = Box<dyn FnMut(&mut Reactor<P, T>, TimerHandle)>;

struct FdEntry<P, T> {
    fd: OwnedFd,
    interest: Interest,
    payload: Option<P>,
    hooks: Option<Box<dyn FdHooks<P, T>>>,
}

struct TimerEntry<P, T> {
    deadline: Timestamp,
    callback: Option<TimerCallback<P, T>>,
    payload: T,
}

#[derive(Debug, Clone, Copy)]
enum Ready {
    Read,
    Write,
}

#[derive(Debug, Clone)]
pub struct IoConfig {
    capacity_hint: usize,
    idle_ceiling: Duration,
    max_fds: usize,
    max_timers: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl IoConfig {
    pub fn new() -> IoConfig {
        IoConfig {
            capacity_hint: DEFAULT_CAPACITY_HINT,
            idle_ceiling: DEFAULT_IDLE_CEILING,
            max_fds: DEFAULT_MAX_FDS,
            max_timers: DEFAULT_MAX_TIMERS,
        }
    }
    #[inline(always)]
    pub fn get_capacity_hint(&self) -> usize {
        self.capacity_hint
    }
    #[inline(always)]
    pub fn set_capacity_hint(&mut self, capacity_hint: usize) -> &mut Self {
        self.capacity_hint = capacity_hint;
        self
    }
    #[inline(always)]
    pub fn get_idle_ceiling(&self) -> Duration {
        self.idle_ceiling
    }
    #[inline(always)]
    pub fn set_idle_ceiling(&mut self, idle_ceiling: Duration) -> &mut Self {
        self.idle_ceiling = idle_ceiling;
        self
    }
    #[inline(always)]
    pub fn get_max_fds(&self) -> usize {
        self.max_fds
    }
    #[inline(always)]
    pub fn set_max_fds(&mut self, max_fds: usize) -> &mut Self {
        self.max_fds = max_fds;
        self
    }
    #[inline(always)]
    pub fn get_max_timers(&self) -> usize {
        self.max_timers
    }
    #[inline(always)]
    pub fn set_max_timers(&mut self, max_timers: usize) -> &mut Self {
        self.max_timers = max_timers;
        self
    }
    #[inline(always)]
    pub fn build(&mut self) -> Self {
        self.clone()
    }
}

/// Single-threaded readiness + timer loop.
///
/// One iteration: refresh the cached clock, wait for readiness (bounded by the
/// nearest timer and the idle ceiling), run readable/writable hooks, run due
/// timers, run every post hook, then destroy the entries whose post hook
/// returned false. `P` is the descriptor payload, `T` the timer payload; the
/// reactor never looks inside either.
pub struct Reactor<P, T = ()> {
    running: bool,
    fds: Slots<FdEntry<P, T>>,
    timers: Slots<TimerEntry<P, T>>,
    clock: Clock,
    poller: Poller,
    ready: Vec<Readiness>,
    config: IoConfig,
    iterations: u64,
}

impl<P, T> Reactor<P, T> {
    /// A reactor on the system clock with default limits.
    pub fn new(capacity_hint: usize) -> Self {
        let config = IoConfig::new().set_capacity_hint(capacity_hint).build();
        Self::with_config(config, Box::new(SystemClock))
    }

    pub fn with_config(config: IoConfig, source: Box<dyn ClockSource>) -> Self {
        let capacity = config.capacity_hint;
        Reactor {
            running: true,
            fds: Slots::with_capacity(capacity),
            timers: Slots::with_capacity(capacity),
            clock: Clock::new(source),
            poller: Poller::with_capacity(capacity),
            ready: Vec::with_capacity(capacity),
            config,
            iterations: 0,
        }
    }

    #[inline(always)]
    pub fn config(&self) -> &IoConfig {
        &self.config
    }
    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running
    }
    /// Asks the loop to exit once the current iteration is done.
    #[inline(always)]
    pub fn stop(&mut self) {
        debug!("IO loop stop requested");
        self.running = false;
    }
    /// Cached monotonic time of the current iteration.
    #[inline(always)]
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
    /// Cached wall clock (unix seconds) of the current iteration.
    #[inline(always)]
    pub fn unix_time(&self) -> i64 {
        self.clock.unix()
    }
    #[inline(always)]
    pub fn iterations(&self) -> u64 {
        self.iterations
    }
    #[inline(always)]
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }
    #[inline(always)]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

// Descriptor registry
impl<P, T> Reactor<P, T> {
    /// Takes ownership of `fd`. The new entry has no payload, no-op hooks and
    /// read interest. If the registry is full the descriptor is closed and
    /// `Error::Exhausted` returned.
    pub fn add_fd(&mut self, fd: impl Into<OwnedFd>) -> Result<FdHandle> {
        let fd: OwnedFd = fd.into();
        if self.fds.len() >= self.config.max_fds {
            error!("Descriptor limit reached, dropping FD:{}", fd.as_raw_fd());
            return Err(Error::Exhausted {
                registry: "descriptor",
                limit: self.config.max_fds,
            });
        }
        let raw = fd.as_raw_fd();
        let key = self.fds.insert(FdEntry {
            fd,
            interest: Interest::READABLE,
            payload: None,
            hooks: Some(Box::new(NoHooks)),
        });
        debug!("Registered FD:{raw} as {:?}", key);
        Ok(FdHandle(key))
    }

    /// Registers a raw descriptor, taking ownership of it.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else; the reactor closes it
    /// when the entry is destroyed.
    pub unsafe fn add_raw_fd(&mut self, fd: RawFd) -> Result<FdHandle> {
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        self.add_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    #[inline(always)]
    pub fn contains_fd(&self, fd: FdHandle) -> bool {
        self.fds.get(fd.0).is_some()
    }

    pub fn raw_fd(&self, fd: FdHandle) -> Option<RawFd> {
        self.fds.get(fd.0).map(|entry| entry.fd.as_raw_fd())
    }

    pub fn borrow_fd(&self, fd: FdHandle) -> Option<BorrowedFd<'_>> {
        self.fds.get(fd.0).map(|entry| entry.fd.as_fd())
    }

    /// Replaces the hooks. Returns false for a stale handle.
    pub fn set_hooks(&mut self, fd: FdHandle, hooks: impl FdHooks<P, T> + 'static) -> bool {
        match self.fds.get_mut(fd.0) {
            Some(entry) => {
                entry.hooks = Some(Box::new(hooks));
                true
            }
            None => false,
        }
    }

    pub fn interest(&self, fd: FdHandle) -> Option<Interest> {
        self.fds.get(fd.0).map(|entry| entry.interest)
    }

    pub fn set_interest(&mut self, fd: FdHandle, interest: Interest) -> bool {
        match self.fds.get_mut(fd.0) {
            Some(entry) => {
                entry.interest = interest;
                true
            }
            None => false,
        }
    }

    pub fn payload(&self, fd: FdHandle) -> Option<&P> {
        self.fds.get(fd.0)?.payload.as_ref()
    }

    pub fn payload_mut(&mut self, fd: FdHandle) -> Option<&mut P> {
        self.fds.get_mut(fd.0)?.payload.as_mut()
    }

    /// Attaches a payload, handing back the one it replaces. A stale handle
    /// gets the new payload back as `Err`.
    pub fn set_payload(&mut self, fd: FdHandle, payload: P) -> std::result::Result<Option<P>, P> {
        match self.fds.get_mut(fd.0) {
            Some(entry) => Ok(entry.payload.replace(payload)),
            None => Err(payload),
        }
    }

    pub fn take_payload(&mut self, fd: FdHandle) -> Option<P> {
        self.fds.get_mut(fd.0)?.payload.take()
    }

    /// Runs one hook with the entry's hooks moved out, so the hook is free to
    /// use the whole reactor. Hooks replaced from inside are left alone.
    fn dispatch<R>(
        &mut self,
        fd: FdHandle,
        call: impl FnOnce(&mut dyn FdHooks<P, T>, &mut Self) -> R,
    ) -> Option<R> {
        let mut hooks = self.fds.get_mut(fd.0)?.hooks.take()?;
        let out = call(hooks.as_mut(), self);
        if let Some(entry) = self.fds.get_mut(fd.0) {
            if entry.hooks.is_none() {
                entry.hooks = Some(hooks);
            }
        }
        Some(out)
    }

    fn dispatch_ready(&mut self, fd: FdHandle, what: Ready) {
        trace!("FD {:?} ready: {:?}", fd, what);
        self.dispatch(fd, |hooks, io| match what {
            Ready::Read => hooks.on_readable(io, fd),
            Ready::Write => hooks.on_writable(io, fd),
        });
    }

    fn destroy_fd(&mut self, fd: FdHandle) {
        if let Some(entry) = self.fds.remove(fd.0) {
            debug!("Closing FD:{} ({:?})", entry.fd.as_raw_fd(), fd);
            // OwnedFd closes on drop; the payload goes with the entry.
            drop(entry);
        }
    }
}

// Timer queue
impl<P, T> Reactor<P, T> {
    /// Arms `callback` to run once the cached clock passes now + delay.
    pub fn add_timer<F>(&mut self, sec: u64, usec: u64, callback: F, payload: T) -> Result<TimerHandle>
    where
        F: FnMut(&mut Reactor<P, T>, TimerHandle) + 'static,
    {
        let delay = Duration::from_secs(sec) + Duration::from_micros(usec);
        self.add_timer_in(delay, callback, payload)
    }

    pub fn add_timer_in<F>(&mut self, delay: Duration, callback: F, payload: T) -> Result<TimerHandle>
    where
        F: FnMut(&mut Reactor<P, T>, TimerHandle) + 'static,
    {
        if self.timers.len() >= self.config.max_timers {
            error!("Timer limit reached");
            return Err(Error::Exhausted {
                registry: "timer",
                limit: self.config.max_timers,
            });
        }
        let deadline = self.clock.now() + delay;
        let key = self.timers.insert(TimerEntry {
            deadline,
            callback: Some(Box::new(callback)),
            payload,
        });
        trace!("Timer {:?} armed for {:?}", key, deadline.secs_micros());
        Ok(TimerHandle(key))
    }

    /// Disarms a timer and returns its payload. Safe from inside any callback,
    /// including the timer's own; a cancelled timer never fires. Stale handles
    /// return `None`.
    pub fn cancel_timer(&mut self, timer: TimerHandle) -> Option<T> {
        let entry = self.timers.remove(timer.0)?;
        trace!("Timer {:?} cancelled", timer);
        Some(entry.payload)
    }

    #[inline(always)]
    pub fn contains_timer(&self, timer: TimerHandle) -> bool {
        self.timers.get(timer.0).is_some()
    }

    pub fn deadline(&self, timer: TimerHandle) -> Option<Timestamp> {
        self.timers.get(timer.0).map(|entry| entry.deadline)
    }

    pub fn timer_payload(&self, timer: TimerHandle) -> Option<&T> {
        self.timers.get(timer.0).map(|entry| &entry.payload)
    }

    pub fn timer_payload_mut(&mut self, timer: TimerHandle) -> Option<&mut T> {
        self.timers.get_mut(timer.0).map(|entry| &mut entry.payload)
    }

    /// Time until the nearest deadline, capped by the idle ceiling. Linear
    /// scan: the queue is unordered and expected to stay small.
    fn next_wait(&self) -> Duration {
        let now = self.clock.now();
        self.timers
            .iter()
            .map(|(_, timer)| now.until(timer.deadline))
            .min()
            .map_or(self.config.idle_ceiling, |wait| wait.min(self.config.idle_ceiling))
    }

    fn run_timers(&mut self) {
        let now = self.clock.now();
        // Only what is due right now; timers armed from these callbacks wait
        // for the next iteration.
        let due = self.timers.keys_where(|timer| timer.deadline <= now);
        for key in due {
            let timer = TimerHandle(key);
            let Some(mut callback) = self.timers.get_mut(key).and_then(|entry| entry.callback.take())
            else {
                // cancelled by an earlier callback of this batch
                continue;
            };
            trace!("Timer {:?} fired", timer);
            callback(self, timer);
            self.timers.remove(key);
        }
    }
}

// Loop
impl<P, T> Reactor<P, T> {
    /// One full iteration. A hard failure of the wait call is returned before
    /// any hook runs.
    pub fn run_once(&mut self) -> Result<()> {
        self.clock.refresh();
        self.iterations += 1;

        self.poller.clear();
        for (key, entry) in self.fds.iter() {
            self.poller.watch(key, entry.fd.as_raw_fd(), entry.interest);
        }
        let wait = self.next_wait();
        self.ready.clear();
        self.poller.wait(wait, &mut self.ready).map_err(Error::Poll)?;

        let ready = std::mem::take(&mut self.ready);
        for event in ready.iter() {
            let fd = FdHandle(event.key);
            if event.readable {
                self.dispatch_ready(fd, Ready::Read);
            }
            if event.writable {
                self.dispatch_ready(fd, Ready::Write);
            }
        }
        self.ready = ready;

        self.run_timers();

        let mut doomed: Vec<FdHandle> = Vec::new();
        for key in self.fds.keys_where(|_| true) {
            let fd = FdHandle(key);
            let keep = self.dispatch(fd, |hooks, io| hooks.on_post(io, fd)).unwrap_or(true);
            if !keep {
                doomed.push(fd);
            }
        }
        for fd in doomed {
            self.destroy_fd(fd);
        }
        Ok(())
    }

    /// Iterates until `stop` is called. A poll failure stops the loop,
    /// releases both registries and is handed back to the caller.
    pub fn run_until_stopped(&mut self) -> Result<()> {
        info!("Entering IO loop");
        while self.running {
            if let Err(err) = self.run_once() {
                error!("IO loop died: {err}");
                self.shutdown();
                return Err(err);
            }
        }
        info!("IO loop stopped after {} iterations", self.iterations);
        Ok(())
    }

    /// Stops the loop and drops every descriptor (closing it) and timer.
    pub fn shutdown(&mut self) {
        self.running = false;
        let fds = self.fds.drain();
        let timers = self.timers.drain();
        debug!("Released {} descriptors and {} timers", fds.len(), timers.len());
    }
}
