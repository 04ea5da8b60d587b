use bytes::BytesMut;
use micro::library::{
    error::Error,
    io::{FdHandle, FdHooks, Interest, IoConfig, Reactor},
    network::socket_helpers::read_available,
    utils::nano_clock::{ManualClock, Timestamp},
};
use std::{
    cell::{Cell, RefCell},
    io::{Read, Write},
    os::{fd::IntoRawFd, unix::net::UnixStream},
    rc::Rc,
    time::{Duration, Instant},
};

type Io = Reactor<(), ()>;
type Log = Rc<RefCell<Vec<&'static str>>>;

fn manual_io() -> (ManualClock, Io) {
    let clock = ManualClock::new(Timestamp::from_nanos(5_000_000_000), 1_700_000_000);
    let io = Reactor::with_config(
        IoConfig::new().set_idle_ceiling(Duration::from_millis(5)).build(),
        Box::new(clock.clone()),
    );
    (clock, io)
}

fn pair() -> (UnixStream, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    (ours, theirs)
}

fn drain(io: &Io, fd: FdHandle) -> usize {
    let raw = io.raw_fd(fd).unwrap();
    let mut buf = BytesMut::new();
    read_available(raw, &mut buf, 4096).unwrap_or(0)
}

struct Tracer {
    log: Log,
    keep: bool,
}

impl FdHooks<(), ()> for Tracer {
    fn on_readable(&mut self, io: &mut Io, fd: FdHandle) {
        drain(io, fd);
        self.log.borrow_mut().push("read");
    }
    fn on_writable(&mut self, _io: &mut Io, _fd: FdHandle) {
        self.log.borrow_mut().push("write");
    }
    fn on_post(&mut self, _io: &mut Io, _fd: FdHandle) -> bool {
        self.log.borrow_mut().push("post");
        self.keep
    }
}

struct Witness {
    other: FdHandle,
    saw_other: Rc<Cell<Option<bool>>>,
}

impl FdHooks<(), ()> for Witness {
    fn on_post(&mut self, io: &mut Io, _fd: FdHandle) -> bool {
        self.saw_other.set(Some(io.contains_fd(self.other)));
        true
    }
}

#[test]
fn dispatch_order_is_readiness_timers_post() {
    let (_clock, mut io) = manual_io();
    let log: Log = Rc::default();
    let (ours, mut theirs) = pair();
    let fd = io.add_fd(ours).unwrap();
    io.set_hooks(fd, Tracer { log: log.clone(), keep: true });
    let l = log.clone();
    io.add_timer(0, 0, move |_, _| l.borrow_mut().push("timer"), ()).unwrap();
    theirs.write_all(b"data").unwrap();

    io.run_once().unwrap();
    assert_eq!(*log.borrow(), vec!["read", "timer", "post"]);
}

#[test]
fn post_false_tears_down_at_end_of_iteration() {
    let (_clock, mut io) = manual_io();
    let log: Log = Rc::default();
    let (a_ours, mut a_theirs) = pair();
    let (b_ours, _b_theirs) = pair();
    let a = io.add_fd(a_ours).unwrap();
    let b = io.add_fd(b_ours).unwrap();
    io.set_hooks(a, Tracer { log: log.clone(), keep: false });
    let saw_other = Rc::new(Cell::new(None));
    io.set_hooks(b, Witness { other: a, saw_other: saw_other.clone() });

    io.run_once().unwrap();
    // b's post hook ran after a's returned false, a was still there
    assert_eq!(saw_other.get(), Some(true));
    assert!(!io.contains_fd(a));
    assert!(io.contains_fd(b));
    assert_eq!(io.fd_count(), 1);
    assert!(!io.set_interest(a, Interest::BOTH));

    let mut buf = [0u8; 8];
    assert_eq!(a_theirs.read(&mut buf).unwrap(), 0);

    io.run_once().unwrap();
    assert_eq!(saw_other.get(), Some(false));
    assert_eq!(*log.borrow(), vec!["post"]);
}

#[test]
fn idle_wait_is_bounded_by_next_timer() {
    let mut io: Io = Reactor::new(4);
    let fired = Rc::new(Cell::new(false));
    let f = fired.clone();
    io.add_timer(0, 100_000, move |_, _| f.set(true), ()).unwrap();

    let start = Instant::now();
    io.run_once().unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(80), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(1), "returned after {waited:?}");
    assert!(!fired.get());

    for _ in 0..3 {
        if fired.get() {
            break;
        }
        io.run_once().unwrap();
    }
    assert!(fired.get());
    assert_eq!(io.timer_count(), 0);
}

#[test]
fn idle_ceiling_bounds_an_empty_loop() {
    let mut io: Io = Reactor::with_config(
        IoConfig::new().set_idle_ceiling(Duration::from_millis(30)).build(),
        Box::new(micro::library::utils::nano_clock::SystemClock),
    );
    let start = Instant::now();
    io.run_once().unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(20), "returned after {waited:?}");
    assert!(waited < Duration::from_secs(1), "returned after {waited:?}");
}

#[test]
fn hangup_is_delivered_as_readable() {
    let (_clock, mut io) = manual_io();
    let log: Log = Rc::default();
    let (ours, theirs) = pair();
    let fd = io.add_fd(ours).unwrap();
    io.set_hooks(fd, Tracer { log: log.clone(), keep: true });
    drop(theirs);

    io.run_once().unwrap();
    assert_eq!(*log.borrow(), vec!["read", "post"]);
}

#[test]
fn interest_selects_the_hooks_called() {
    let (_clock, mut io) = manual_io();
    let log: Log = Rc::default();
    let (ours, mut theirs) = pair();
    let fd = io.add_fd(ours).unwrap();
    io.set_hooks(fd, Tracer { log: log.clone(), keep: true });
    theirs.write_all(b"pending").unwrap();

    io.set_interest(fd, Interest::NONE);
    io.run_once().unwrap();
    assert_eq!(*log.borrow(), vec!["post"]);

    log.borrow_mut().clear();
    io.set_interest(fd, Interest::WRITABLE);
    io.run_once().unwrap();
    assert_eq!(*log.borrow(), vec!["write", "post"]);

    log.borrow_mut().clear();
    io.set_interest(fd, Interest::BOTH);
    assert_eq!(io.interest(fd), Some(Interest::BOTH));
    io.run_once().unwrap();
    assert_eq!(*log.borrow(), vec!["read", "write", "post"]);
}

#[test]
fn raw_descriptors_are_validated() {
    let (_clock, mut io) = manual_io();
    assert!(matches!(unsafe { io.add_raw_fd(-1) }, Err(Error::Io(_))));
    assert_eq!(io.fd_count(), 0);

    let (ours, _theirs) = pair();
    let fd = unsafe { io.add_raw_fd(ours.into_raw_fd()) }.unwrap();
    assert!(io.contains_fd(fd));
    assert_eq!(io.interest(fd), Some(Interest::READABLE));
}

#[test]
fn descriptor_limit_is_enforced() {
    let mut io: Io = Reactor::with_config(
        IoConfig::new().set_max_fds(1).build(),
        Box::new(ManualClock::default()),
    );
    let (first, _keep) = pair();
    io.add_fd(first).unwrap();
    let (second, mut second_peer) = pair();
    match io.add_fd(second) {
        Err(Error::Exhausted { registry, limit }) => {
            assert_eq!(registry, "descriptor");
            assert_eq!(limit, 1);
        }
        other => panic!("unexpected {other:?}"),
    }
    // the refused descriptor was closed
    let mut buf = [0u8; 1];
    assert_eq!(second_peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn payloads_follow_their_descriptor() {
    let clock = ManualClock::default();
    let mut io: Reactor<String, ()> =
        Reactor::with_config(IoConfig::new().build(), Box::new(clock));
    let (ours, _theirs) = pair();
    let fd = io.add_fd(ours).unwrap();
    assert_eq!(io.payload(fd), None);
    assert_eq!(io.set_payload(fd, "alice".to_string()), Ok(None));
    io.payload_mut(fd).unwrap().push_str("!");
    assert_eq!(io.payload(fd).map(String::as_str), Some("alice!"));
    assert_eq!(io.take_payload(fd).as_deref(), Some("alice!"));
    assert_eq!(io.payload(fd), None);
}

#[test]
fn shutdown_closes_everything() {
    let (_clock, mut io) = manual_io();
    let (ours, mut theirs) = pair();
    io.add_fd(ours).unwrap();
    io.add_timer(30, 0, |_, _| {}, ()).unwrap();
    io.shutdown();
    assert!(!io.is_running());
    assert_eq!(io.fd_count(), 0);
    assert_eq!(io.timer_count(), 0);
    let mut buf = [0u8; 1];
    assert_eq!(theirs.read(&mut buf).unwrap(), 0);
}

#[test]
fn dropping_the_reactor_closes_descriptors() {
    let (_clock, mut io) = manual_io();
    let (ours, mut theirs) = pair();
    io.add_fd(ours).unwrap();
    drop(io);
    let mut buf = [0u8; 1];
    assert_eq!(theirs.read(&mut buf).unwrap(), 0);
}

struct Stopper;

impl FdHooks<(), ()> for Stopper {
    fn on_readable(&mut self, io: &mut Io, fd: FdHandle) {
        drain(io, fd);
        io.stop();
    }
}

#[test]
fn hook_can_stop_the_loop() {
    let (_clock, mut io) = manual_io();
    let (ours, mut theirs) = pair();
    let fd = io.add_fd(ours).unwrap();
    io.set_hooks(fd, Stopper);
    theirs.write_all(b"bye").unwrap();
    io.run_until_stopped().unwrap();
    assert_eq!(io.iterations(), 1);
    assert!(io.contains_fd(fd));
}
