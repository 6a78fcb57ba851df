//! `simq-server [manager] [<path>]`: boots the broker rooted at `<path>`
//! (default `.`), or — when the literal first argument is `manager` —
//! runs the admin REPL against the same on-disk layout instead.
//!
//! The broker itself is `count_threads` worker threads, each owning an
//! independent `mio::Poll` loop over its own `SO_REUSEPORT` listener on
//! the configured port; the kernel spreads accepted connections across
//! them, so there's no shared accept lock. A single applier thread drains
//! the `Changes` journal into `Store`/`Access`/`QueueManager`.

mod access;
mod admin;
mod changes;
mod config;
mod controller;
mod error;
mod fsm;
mod initialization;
mod logger;
mod message_buffer;
mod net;
mod paged_file;
mod protocol;
mod queue_manager;
mod session;
mod store;
mod util;

use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{info, warn};
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::access::Access;
use crate::changes::Changes;
use crate::config::AppConfig;
use crate::controller::{Outcome, ServerController};
use crate::initialization::{boot, replay_pending, run_applier_loop};
use crate::queue_manager::QueueManager;
use crate::store::Store;
use crate::util::BarrierFlag;

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// `simq-server [manager] [<path>]`. The literal first positional
/// argument `manager` switches to the admin REPL; everything else is
/// read as the storage root, defaulting to `.`. Modeled as two plain
/// optional positionals (rather than a clap subcommand) since `manager`
/// is a bare literal token, not a `--flag`.
#[derive(Parser, Debug)]
#[command(name = "simq-server", about = "Single-node message broker")]
struct Cli {
    /// Either the literal `manager`, or the storage root path.
    mode_or_path: Option<String>,
    /// Storage root, used only when the first argument was `manager`.
    path: Option<String>,
}

fn main() -> anyhow::Result<()> {
    logger::init();

    let cli = Cli::parse();
    let (manager, path) = match cli.mode_or_path.as_deref() {
        Some("manager") => (true, cli.path),
        other => (false, other.map(str::to_string)),
    };
    let root = PathBuf::from(path.unwrap_or_else(|| ".".to_string()));

    let result = if manager {
        admin::run(&root)
    } else {
        run_broker(&root)
    };

    if let Err(e) = &result {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run_broker(root: &Path) -> anyhow::Result<()> {
    let cfg = AppConfig::load(root)?;
    let store = Arc::new(Store::open(root)?);
    let (changes, pending) = Changes::open(&store.changes_dir())?;
    let changes = Arc::new(changes);

    // Crash recovery: anything still in the journal from a previous run
    // that never made it into a durable Store write gets replayed first,
    // so `boot` below reconstructs from fully-caught-up state.
    if !pending.is_empty() {
        info!("replaying {} pending change(s) from journal", pending.len());
        replay_pending(&store, &pending);
    }

    let access = Arc::new(Access::new());
    let queues = Arc::new(QueueManager::new(root));
    boot(&store, &access, &queues);

    let shutdown = Arc::new(BarrierFlag::default());
    {
        let s = shutdown.clone();
        ctrlc::set_handler(move || s.raise())?;
    }

    let controller = Arc::new(ServerController::new(
        access.clone(),
        queues.clone(),
        store.clone(),
        changes.clone(),
        cfg.idle_timeout(),
    ));

    let applier = {
        let store = store.clone();
        let queues = queues.clone();
        let access = access.clone();
        let changes = changes.clone();
        let shutdown = shutdown.clone();
        let tick = cfg.applier_tick();
        thread::Builder::new()
            .name("simq-applier".into())
            .spawn(move || run_applier_loop(&store, &queues, &access, &changes, tick, &shutdown))?
    };

    let port = store.get_port();
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let count_threads = store.get_count_threads().max(1);
    info!("simq-server listening on {addr} with {count_threads} worker thread(s)");

    let mut workers = Vec::with_capacity(count_threads as usize);
    for idx in 0..count_threads {
        let controller = controller.clone();
        let shutdown = shutdown.clone();
        let cfg = cfg.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("simq-worker-{idx}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(addr, cfg, controller, shutdown) {
                        warn!("worker {idx} exited: {e}");
                    }
                })?,
        );
    }

    for w in workers {
        let _ = w.join();
    }
    let _ = applier.join();
    Ok(())
}

/// Per-connection bookkeeping the worker loop needs on top of what
/// `Session` tracks inside the controller: just the owned stream, kept
/// alive and registered until the controller reports `Outcome::Close`.
struct Conn {
    stream: MioTcpStream,
}

fn worker_loop(
    addr: SocketAddr,
    cfg: AppConfig,
    controller: Arc<ServerController>,
    shutdown: Arc<BarrierFlag>,
) -> anyhow::Result<()> {
    let std_listener = net::build_reuseport_listener(addr, cfg.listen_backlog)?;
    let mut listener = MioTcpListener::from_std(std_listener);

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

    let mut events = Events::with_capacity(1024);
    let mut conns: std::collections::HashMap<RawFd, Conn> = std::collections::HashMap::new();
    let tick = cfg.epoll_tick();
    let mut last_sweep = std::time::Instant::now();

    while !shutdown.is_raised() {
        if let Err(e) = poll.poll(&mut events, Some(tick)) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                accept_all(&listener, &mut poll, &mut conns, &controller);
                continue;
            }
            let fd = event.token().0 as RawFd;
            let close = progress_fd(fd, &controller);
            if close {
                if let Some(mut conn) = conns.remove(&fd) {
                    let _ = poll.registry().deregister(&mut conn.stream);
                }
                controller.disconnect(fd);
            }
        }

        if last_sweep.elapsed() >= tick {
            for fd in controller.sweep_idle() {
                if let Some(mut conn) = conns.remove(&fd) {
                    let _ = poll.registry().deregister(&mut conn.stream);
                }
                controller.disconnect(fd);
            }
            last_sweep = std::time::Instant::now();
        }
    }

    for (_, mut conn) in conns.drain() {
        let _ = poll.registry().deregister(&mut conn.stream);
    }
    Ok(())
}

fn accept_all(
    listener: &MioTcpListener,
    poll: &mut Poll,
    conns: &mut std::collections::HashMap<RawFd, Conn>,
    controller: &Arc<ServerController>,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, peer)) => {
                let fd = stream.as_raw_fd();
                if let Err(e) = poll.registry().register(
                    &mut stream,
                    Token(fd as usize),
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    warn!("failed to register accepted connection: {e}");
                    continue;
                }
                controller.connect(fd, peer.ip().to_string());
                conns.insert(fd, Conn { stream });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Runs the session's FSM to its next suspension point. Returns whether
/// the caller must close and deregister the fd.
fn progress_fd(fd: RawFd, controller: &Arc<ServerController>) -> bool {
    matches!(controller.progress(fd), Outcome::Close)
}
