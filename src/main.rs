use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use micro::library::{
    casemap::Casemap,
    error::Result,
    io::{FdHandle, IoConfig, Reactor, TimerHandle},
    network::{
        link::{IrcIo, LineHandler, close_link, send_line},
        origin::{LinkSettings, Origin},
        socket_helpers::build_listener,
    },
    trie::Trie,
    utils::nano_clock::SystemClock,
};
use std::{
    cell::RefCell,
    cmp::Ordering,
    net::{IpAddr, SocketAddr},
    process::ExitCode,
    rc::Rc,
    time::Duration,
};
use tracing::{Level, error, info, warn};
use tracing_subscriber::fmt;

const SERVER_NAME: &str = "micro";
const LISTEN_BACKLOG: i32 = 128;
const NICK_LEN: usize = 30;
const STATS_PERIOD: Duration = Duration::from_secs(60);

/// Minimal IRC server built on a single-threaded poll loop
#[derive(Parser, Debug)]
#[command(name = "micro")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 6667)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Seconds of silence before a client is dropped
    #[arg(long, default_value_t = 120)]
    ping_timeout: u64,

    /// Maximum number of connected clients
    #[arg(long, default_value_t = 1024)]
    max_clients: usize,

    /// Longest the loop sleeps with nothing to do, in milliseconds
    #[arg(long, default_value_t = 1000)]
    idle_ceiling_ms: u64,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn bootstrap_logs(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .with_target(false)
        .compact()
        .with_ansi(true)
        .init();
}

/// Nickname registry shared by every connection.
struct Registry {
    casemap: Casemap,
    nicks: RefCell<Trie<FdHandle>>,
}

fn valid_nick(nick: &str) -> bool {
    let Some(first) = nick.bytes().next() else {
        return false;
    };
    nick.len() <= NICK_LEN
        && !first.is_ascii_digit()
        && first != b'-'
        && !nick.bytes().any(|c| c <= b' ' || b",*?!@:#&".contains(&c))
}

impl Registry {
    fn new(casemap: Casemap) -> Self {
        Self {
            casemap,
            nicks: RefCell::new(Trie::new(Some(casemap.canonizer()))),
        }
    }

    fn claim(&self, io: &mut IrcIo, fd: FdHandle, me: &str, wanted: &str) {
        if wanted.is_empty() {
            send_line(io, fd, format!(":{SERVER_NAME} 431 {me} :No nickname given"));
            return;
        }
        if !valid_nick(wanted) {
            send_line(io, fd, format!(":{SERVER_NAME} 432 {me} {wanted} :Erroneous nickname"));
            return;
        }
        let old = io.payload(fd).and_then(|conn| conn.nick.clone());
        match old.as_deref() {
            Some(old) if old == wanted => return,
            // same key under the casemap, only the spelling changes
            Some(old) if self.casemap.compare(old.as_bytes(), wanted.as_bytes()) == Ordering::Equal => {}
            _ => {
                if !self.register(fd, old.as_deref(), wanted) {
                    send_line(
                        io,
                        fd,
                        format!(":{SERVER_NAME} 433 {me} {wanted} :Nickname is already in use"),
                    );
                    return;
                }
            }
        }
        if let Some(conn) = io.payload_mut(fd) {
            conn.nick = Some(wanted.to_string());
        }
        send_line(io, fd, format!(":{me} NICK :{wanted}"));
        if old.is_none() {
            send_line(io, fd, format!(":{SERVER_NAME} 001 {wanted} :Welcome to {SERVER_NAME}, {wanted}"));
            send_line(
                io,
                fd,
                format!(
                    ":{SERVER_NAME} 005 {wanted} CASEMAPPING={} NICKLEN={NICK_LEN} :are supported by this server",
                    self.casemap.as_str()
                ),
            );
        }
    }

    /// Moves `fd` from `old` to `wanted` in the nick index. False when the
    /// nick belongs to someone else.
    fn register(&self, fd: FdHandle, old: Option<&str>, wanted: &str) -> bool {
        let mut nicks = self.nicks.borrow_mut();
        if matches!(nicks.lookup(wanted), Ok(Some(owner)) if *owner != fd) {
            return false;
        }
        if let Some(old) = old {
            let _ = nicks.delete(old);
        }
        if let Err(err) = nicks.insert(wanted, fd) {
            warn!("Cannot register {wanted}: {err}");
            return false;
        }
        true
    }
}

impl LineHandler for Registry {
    fn on_line(&self, io: &mut IrcIo, fd: FdHandle, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let (command, rest) = line.split_once(' ').unwrap_or((&*line, ""));
        let command = command.to_ascii_uppercase();
        let rest = rest.trim_start();
        let trailing = rest.strip_prefix(':').unwrap_or(rest);
        let me = io
            .payload(fd)
            .and_then(|conn| conn.nick.clone())
            .unwrap_or_else(|| "*".to_string());

        match command.as_str() {
            "NICK" => {
                let wanted = trailing.split(' ').next().unwrap_or_default();
                self.claim(io, fd, &me, wanted);
            }
            "PING" => {
                send_line(io, fd, format!(":{SERVER_NAME} PONG {SERVER_NAME} :{trailing}"));
            }
            "PONG" => {}
            "QUIT" => {
                send_line(io, fd, format!("ERROR :Closing Link: {me} (Quit: {trailing})"));
                close_link(io, fd, "Quit");
            }
            _ => {
                send_line(io, fd, format!(":{SERVER_NAME} 421 {me} {command} :Unknown command"));
            }
        }
    }

    fn on_close(&self, io: &mut IrcIo, fd: FdHandle, reason: &str) {
        let Some(conn) = io.payload(fd) else {
            return;
        };
        if let Some(nick) = conn.nick.as_deref() {
            let mut nicks = self.nicks.borrow_mut();
            if matches!(nicks.lookup(nick), Ok(Some(owner)) if *owner == fd) {
                let _ = nicks.delete(nick);
            }
        }
        info!("Closed {:?} ({}): {reason}", conn.peer(), conn.nick.as_deref().unwrap_or("*"));
    }
}

fn arm_stats(io: &mut IrcIo, registry: Rc<Registry>, origin: FdHandle) -> Result<TimerHandle> {
    io.add_timer_in(STATS_PERIOD, move |io, me| log_stats(io, me, &registry), origin)
}

fn log_stats(io: &mut IrcIo, me: TimerHandle, registry: &Rc<Registry>) {
    info!(
        "Server: CONNS: {} NICKS: {} TIMERS: {} ITERATIONS: {}",
        io.fd_count().saturating_sub(1),
        registry.nicks.borrow().len(),
        io.timer_count(),
        io.iterations()
    );
    let Some(origin) = io.cancel_timer(me) else {
        return;
    };
    if let Err(err) = arm_stats(io, registry.clone(), origin) {
        warn!("Stats timer not re-armed: {err}");
    }
}

fn serve(args: &Args) -> Result<()> {
    let addr = SocketAddr::new(args.bind, args.port);
    let listener = build_listener(addr, LISTEN_BACKLOG)?;
    info!("Listening on {addr}");

    let config = IoConfig::new()
        .set_max_fds(args.max_clients + 1)
        .set_idle_ceiling(Duration::from_millis(args.idle_ceiling_ms))
        .build();
    let mut io: IrcIo = Reactor::with_config(config, Box::new(SystemClock));

    let registry = Rc::new(Registry::new(Casemap::Rfc1459));
    let settings = LinkSettings {
        ping_timeout: Duration::from_secs(args.ping_timeout),
        ..LinkSettings::default()
    };
    let origin = io.add_fd(listener)?;
    io.set_hooks(origin, Origin::new(registry.clone(), settings));
    arm_stats(&mut io, registry, origin)?;

    io.run_until_stopped()
}

fn main() -> ExitCode {
    let args = Args::parse();
    bootstrap_logs(args.verbose);
    // a peer vanishing mid-write must show up as EPIPE, not kill us
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
