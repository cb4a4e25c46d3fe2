// LININOIO ETHERD — DAEMON ENTRY POINT
// Wires the protocol engine to the raw socket, the uevent listener, the
// r2proc control device and the backend bridge, then runs the single
// poll loop everything dispatches from.

use std::fs;
use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use log::{debug, error, info, warn};

use lininoio::engine::poll::PollSet;
use lininoio::handlers;
use lininoio::hotplug::UeventSocket;
use lininoio::net::ether::{EngineEvent, EtherEngine, EtherSocket, RX_BUF_SIZE};
use lininoio::protocol::handler::ProtoRegistry;
use lininoio::rproc::ctrl::{core_resources, RprocBridge};
use lininoio::rproc::firmware::FIRMWARE_DIR;
use lininoio::virtio::backend::{CoreLink, VirtioBridge};
use lininoio::logger;

// Startup failure codes, stable for init scripts.
const E_EVENTS: i32 = 129;
const E_INIT: i32 = 130;
const E_UDEV: i32 = 131;
const E_SOCKET: i32 = 132;

#[derive(Parser)]
#[command(name = "etherd", about = "lininoio ethernet bridge daemon")]
struct Cli {
    /// Log at debug level
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Stay in the foreground
    #[arg(short = 'D', long = "dont-daemonize")]
    no_daemon: bool,

    /// Pid file path
    #[arg(short = 'p', long = "pid-file", default_value = "/var/run/etherd.pid")]
    pid_file: PathBuf,

    /// Log to stderr instead of syslog
    #[arg(short = 'E', long = "log-to-stderr")]
    log_stderr: bool,

    /// Node inactivity timeout in milliseconds
    #[arg(long = "alive-timeout", default_value_t = 2000)]
    alive_timeout_ms: u64,

    /// Network interface to bind
    interface: String,
}

fn fatal(code: i32, msg: &str) -> ! {
    error!("{msg}");
    eprintln!("etherd: {msg}");
    process::exit(code);
}

fn daemonize(pid_file: &PathBuf) -> io::Result<()> {
    unsafe {
        match libc::fork() {
            n if n < 0 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }
        match libc::fork() {
            n if n < 0 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::chdir(b"/\0".as_ptr() as *const libc::c_char) < 0 {
            return Err(io::Error::last_os_error());
        }
        let null = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }
    fs::write(pid_file, format!("{}\n", process::id()))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tag {
    Ether,
    Hotplug,
    CoreEvent(RawFd),
    Backend(RawFd),
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.log_stderr || cli.no_daemon, cli.verbose);

    if !cli.no_daemon {
        if let Err(e) = daemonize(&cli.pid_file) {
            fatal(E_INIT, &format!("cannot daemonize: {e}"));
        }
    }

    let discovery = handlers::builtin_discovery();
    let registry = ProtoRegistry::new(Box::new(discovery));
    let alive = std::time::Duration::from_millis(cli.alive_timeout_ms);
    let mut engine = EtherEngine::new(registry, alive);

    let mut socket = match EtherSocket::open(&cli.interface) {
        Ok(s) => s,
        Err(e) => fatal(E_SOCKET, &format!("cannot open {}: {e}", cli.interface)),
    };
    let uevents = match UeventSocket::open() {
        Ok(s) => s,
        Err(e) => fatal(E_UDEV, &format!("cannot open uevent socket: {e}")),
    };

    let mut rproc = RprocBridge::new(PathBuf::from(FIRMWARE_DIR));
    let mut virtio = VirtioBridge::new();

    let mut poll: PollSet<Tag> = PollSet::new();
    poll.add(socket.as_raw_fd(), Tag::Ether);
    poll.add(uevents.fd(), Tag::Hotplug);

    info!("listening on {}", cli.interface);

    let mut rx = [0u8; RX_BUF_SIZE];
    let mut ready = Vec::new();
    loop {
        let now = Instant::now();
        let timeout = engine.next_deadline().map(|d| d.saturating_duration_since(now));
        ready.clear();
        if let Err(e) = poll.wait(timeout, &mut ready) {
            fatal(E_EVENTS, &format!("poll: {e}"));
        }

        let now = Instant::now();
        for i in 0..ready.len() {
            match ready[i] {
                Tag::Ether => match socket.recv_from(&mut rx) {
                    Ok((n, from)) => engine.handle_frame(now, from, &rx[..n], &mut socket),
                    Err(e) => warn!("socket receive: {e}"),
                },
                Tag::Hotplug => match uevents.next_backend_add() {
                    Ok(Some(ev)) => match virtio.add_device(&ev) {
                        Ok(Some(fd)) => poll.add(fd, Tag::Backend(fd)),
                        Ok(None) => {}
                        Err(e) => error!("backend {}: {e}", ev.devpath),
                    },
                    Ok(None) => {}
                    Err(e) => warn!("uevent receive: {e}"),
                },
                Tag::CoreEvent(fd) => rproc.drain_event(fd),
                Tag::Backend(fd) => virtio.readable(fd, &mut engine),
            }
        }

        engine.run_timers(now);

        for event in engine.take_events() {
            match event {
                EngineEvent::CoreReady {
                    node,
                    core_id,
                    core_name,
                } => {
                    let Some(n) = engine.arena().get(node) else {
                        continue;
                    };
                    let blobs = core_resources(n, core_id);
                    let refs: Vec<&[u8]> = blobs.iter().map(|b| b.as_slice()).collect();
                    match rproc.setup_core(&core_name, &refs) {
                        Ok((start, stop)) => {
                            poll.add(start, Tag::CoreEvent(start));
                            poll.add(stop, Tag::CoreEvent(stop));
                            virtio.expect_core(CoreLink {
                                node,
                                core_id,
                                core_name,
                            });
                        }
                        Err(e) => {
                            // the association stands; this core just has
                            // no processor behind it
                            error!("core {core_name} setup: {e}");
                        }
                    }
                }
                EngineEvent::NodeDead { node, core_names } => {
                    debug!("tearing down {} cores", core_names.len());
                    for fd in rproc.teardown_node(&core_names) {
                        poll.remove(fd);
                    }
                    for fd in virtio.remove_node(node) {
                        poll.remove(fd);
                    }
                }
            }
        }
    }
}
