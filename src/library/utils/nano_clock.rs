use core::ptr;
use libc::{CLOCK_MONOTONIC, clock_gettime, timespec};
use std::{cell::Cell, ops::Add, rc::Rc, time::Duration};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A point on the monotonic clock, in nanoseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline(always)]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }
    #[inline(always)]
    pub const fn as_nanos(self) -> i64 {
        self.0
    }
    /// Time left until `later`, zero if `later` already passed.
    #[inline(always)]
    pub fn until(self, later: Timestamp) -> Duration {
        let diff = later.0.saturating_sub(self.0);
        if diff <= 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(diff as u64)
    }
    /// Seconds and microseconds, the way the deadlines are usually printed.
    pub fn secs_micros(self) -> (i64, i64) {
        (self.0 / NANOS_PER_SEC, (self.0 % NANOS_PER_SEC) / 1_000)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline(always)]
    fn add(self, rhs: Duration) -> Timestamp {
        let nanos = i64::try_from(rhs.as_nanos()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(nanos))
    }
}

/// Where the reactor gets the time from once per iteration.
pub trait ClockSource {
    /// Monotonic reading, used for every deadline.
    fn monotonic(&mut self) -> Timestamp;
    /// Wall clock in unix seconds, for collaborators that need calendar time.
    fn unix(&mut self) -> i64;
}

#[inline(always)]
pub fn timestamp() -> i64 {
    unsafe { libc::time(ptr::null_mut()) as i64 }
}

#[inline(always)]
pub fn nano_timestamp() -> i64 {
    let mut ts: timespec = unsafe { std::mem::zeroed() };
    unsafe { clock_gettime(CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * NANOS_PER_SEC + ts.tv_nsec as i64
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    #[inline(always)]
    fn monotonic(&mut self) -> Timestamp {
        Timestamp(nano_timestamp())
    }
    #[inline(always)]
    fn unix(&mut self) -> i64 {
        timestamp()
    }
}

/// Hand-driven clock. Clones share the same reading, so a test can keep one
/// and give the other to the reactor.
#[derive(Debug, Default, Clone)]
pub struct ManualClock {
    nanos: Rc<Cell<i64>>,
    /// Wall clock in nanoseconds, so sub-second steps add up.
    unix_nanos: Rc<Cell<i64>>,
}

impl ManualClock {
    pub fn new(start: Timestamp, unix: i64) -> Self {
        Self {
            nanos: Rc::new(Cell::new(start.0)),
            unix_nanos: Rc::new(Cell::new(unix.saturating_mul(NANOS_PER_SEC))),
        }
    }
    pub fn advance(&self, by: Duration) {
        self.nanos.set((Timestamp(self.nanos.get()) + by).0);
        self.unix_nanos.set((Timestamp(self.unix_nanos.get()) + by).0);
    }
}

impl ClockSource for ManualClock {
    fn monotonic(&mut self) -> Timestamp {
        Timestamp(self.nanos.get())
    }
    fn unix(&mut self) -> i64 {
        self.unix_nanos.get().div_euclid(NANOS_PER_SEC)
    }
}

/// The cached "now". Refreshed by the reactor at the top of each iteration
/// and read by everything else in between.
pub struct Clock {
    source: Box<dyn ClockSource>,
    now: Timestamp,
    unix: i64,
}

impl Clock {
    pub fn new(mut source: Box<dyn ClockSource>) -> Self {
        let now = source.monotonic();
        let unix = source.unix();
        Self { source, now, unix }
    }
    #[inline(always)]
    pub fn refresh(&mut self) {
        self.now = self.source.monotonic();
        self.unix = self.source.unix();
    }
    #[inline(always)]
    pub fn now(&self) -> Timestamp {
        self.now
    }
    #[inline(always)]
    pub fn unix(&self) -> i64 {
        self.unix
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(Box::new(SystemClock))
    }
}
