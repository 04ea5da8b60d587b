use micro::library::{
    io::{FdHandle, IoConfig, Reactor},
    network::{
        link::{Conn, ConnHooks, IrcIo, LineHandler, arm_ping, close_link, send_line},
        origin::{LinkSettings, Origin},
        socket_helpers::build_listener,
    },
    utils::nano_clock::{ManualClock, SystemClock, Timestamp},
};
use std::{
    cell::RefCell,
    io::{BufRead, BufReader, Read, Write},
    net::TcpStream,
    os::unix::net::UnixStream,
    rc::Rc,
    time::Duration,
};

#[derive(Default)]
struct Recorder {
    lines: RefCell<Vec<String>>,
    closed: RefCell<Vec<String>>,
}

impl LineHandler for Recorder {
    fn on_line(&self, io: &mut IrcIo, fd: FdHandle, line: &[u8]) {
        let line = String::from_utf8_lossy(line).into_owned();
        if line == "QUIT" {
            send_line(io, fd, "ERROR :bye");
            close_link(io, fd, "Quit");
        } else {
            send_line(io, fd, format!("ECHO {line}"));
        }
        self.lines.borrow_mut().push(line);
    }

    fn on_close(&self, _io: &mut IrcIo, _fd: FdHandle, reason: &str) {
        self.closed.borrow_mut().push(reason.to_string());
    }
}

fn manual_io() -> (ManualClock, IrcIo) {
    let clock = ManualClock::new(Timestamp::from_nanos(1_000_000_000), 1_700_000_000);
    let io = Reactor::with_config(
        IoConfig::new().set_idle_ceiling(Duration::from_millis(5)).build(),
        Box::new(clock.clone()),
    );
    (clock, io)
}

fn connect(io: &mut IrcIo, handler: &Rc<Recorder>, recvq_max: usize) -> (FdHandle, UnixStream) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    theirs.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let fd = io.add_fd(ours).unwrap();
    let now = io.now();
    io.set_payload(fd, Conn::new(None, now)).unwrap();
    io.set_hooks(fd, ConnHooks::new(handler.clone(), recvq_max));
    (fd, theirs)
}

fn read_to_end(mut peer: UnixStream) -> String {
    let mut out = String::new();
    peer.read_to_string(&mut out).unwrap();
    out
}

#[test]
fn lines_reach_the_handler_and_replies_flush() {
    let (_clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 8192);

    peer.write_all(b"NICK alice\r\nUSER a 0 * :A\nPART").unwrap();
    io.run_once().unwrap();
    assert_eq!(*handler.lines.borrow(), vec!["NICK alice", "USER a 0 * :A"]);
    assert_eq!(io.payload(fd).map(Conn::sendq_len), Some(37));

    io.run_once().unwrap();
    assert_eq!(io.payload(fd).map(Conn::sendq_len), Some(0));
    let mut reader = BufReader::new(peer.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "ECHO NICK alice\r\n");
    line.clear();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "ECHO USER a 0 * :A\r\n");

    // the partial line completes later
    peer.write_all(b"IAL\r\n").unwrap();
    io.run_once().unwrap();
    assert_eq!(handler.lines.borrow().last().map(String::as_str), Some("PARTIAL"));
}

#[test]
fn quit_flushes_then_closes() {
    let (_clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 8192);

    peer.write_all(b"HELLO\r\nQUIT\r\nIGNORED\r\n").unwrap();
    io.run_once().unwrap();

    assert!(!io.contains_fd(fd));
    assert_eq!(*handler.lines.borrow(), vec!["HELLO", "QUIT"]);
    assert_eq!(*handler.closed.borrow(), vec!["Quit"]);
    assert_eq!(read_to_end(peer), "ECHO HELLO\r\nERROR :bye\r\n");
}

#[test]
fn peer_hangup_closes_the_link() {
    let (_clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, peer) = connect(&mut io, &handler, 8192);
    drop(peer);

    io.run_once().unwrap();
    assert!(!io.contains_fd(fd));
    assert_eq!(*handler.closed.borrow(), vec!["Remote host closed the connection"]);
}

#[test]
fn unterminated_line_over_recvq_closes_the_link() {
    let (_clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 16);
    peer.write_all(&[b'x'; 64]).unwrap();

    io.run_once().unwrap();
    assert!(!io.contains_fd(fd));
    assert!(handler.lines.borrow().is_empty());
    assert_eq!(*handler.closed.borrow(), vec!["RecvQ exceeded"]);
}

#[test]
fn complete_lines_filling_recvq_are_served() {
    let (_clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 16);
    peer.write_all(b"abcdef\r\nabcdef\r\n").unwrap();

    io.run_once().unwrap();
    assert!(io.contains_fd(fd));
    assert_eq!(*handler.lines.borrow(), vec!["abcdef", "abcdef"]);
    assert!(handler.closed.borrow().is_empty());
}

#[test]
fn burst_larger_than_recvq_is_read_in_slices() {
    let (_clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 16);
    peer.write_all(&b"ab\r\n".repeat(6)).unwrap();

    io.run_once().unwrap();
    assert_eq!(handler.lines.borrow().len(), 4);
    io.run_once().unwrap();
    assert!(io.contains_fd(fd));
    assert_eq!(*handler.lines.borrow(), vec!["ab"; 6]);
    assert!(handler.closed.borrow().is_empty());
}

#[test]
fn silent_link_is_pinged_then_dropped() {
    let (clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 8192);
    arm_ping(&mut io, fd, Duration::from_secs(10)).unwrap();
    assert_eq!(io.timer_count(), 1);

    clock.advance(Duration::from_secs(5));
    io.run_once().unwrap();
    assert!(io.contains_fd(fd));
    assert_eq!(io.timer_count(), 1);
    io.run_once().unwrap();
    let mut ping = [0u8; 13];
    peer.read_exact(&mut ping).unwrap();
    assert_eq!(&ping, b"PING :micro\r\n");

    clock.advance(Duration::from_secs(5));
    io.run_once().unwrap();
    assert!(!io.contains_fd(fd));
    assert_eq!(io.timer_count(), 0);
    assert_eq!(*handler.closed.borrow(), vec!["Ping timeout"]);
    assert_eq!(read_to_end(peer), "");
}

#[test]
fn chatty_link_survives_the_ping_check() {
    let (clock, mut io) = manual_io();
    let handler = Rc::new(Recorder::default());
    let (fd, mut peer) = connect(&mut io, &handler, 8192);
    arm_ping(&mut io, fd, Duration::from_secs(10)).unwrap();

    for _ in 0..4 {
        clock.advance(Duration::from_secs(4));
        peer.write_all(b"PONG :micro\r\n").unwrap();
        io.run_once().unwrap();
        assert!(io.contains_fd(fd));
    }
    assert!(handler.closed.borrow().is_empty());
    assert_eq!(io.timer_count(), 1);
}

#[test]
fn origin_accepts_and_serves_tcp_clients() {
    let listener = build_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = listener.local_addr().unwrap();
    let mut io: IrcIo = Reactor::with_config(
        IoConfig::new().set_idle_ceiling(Duration::from_millis(20)).build(),
        Box::new(SystemClock),
    );
    let handler = Rc::new(Recorder::default());
    let origin = io.add_fd(listener).unwrap();
    io.set_hooks(origin, Origin::new(handler.clone(), LinkSettings::default()));

    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.write_all(b"PING :x\r\n").unwrap();

    for _ in 0..10 {
        io.run_once().unwrap();
        if io.fd_count() == 2 && io.timer_count() == 1 && !handler.lines.borrow().is_empty() {
            break;
        }
    }
    assert_eq!(io.fd_count(), 2);
    assert_eq!(io.timer_count(), 1);
    for _ in 0..3 {
        io.run_once().unwrap();
    }

    let mut reader = BufReader::new(client.try_clone().unwrap());
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert_eq!(line, "ECHO PING :x\r\n");

    drop(reader);
    drop(client);
    for _ in 0..10 {
        io.run_once().unwrap();
        if io.fd_count() == 1 {
            break;
        }
    }
    assert_eq!(io.fd_count(), 1);
    assert_eq!(io.timer_count(), 0);
    assert_eq!(*handler.closed.borrow(), vec!["Remote host closed the connection"]);
}
