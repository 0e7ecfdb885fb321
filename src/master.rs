//! Master process: bind, fork, supervise, reload
//!
//! The master owns the listening sockets and never touches a client byte.
//! Workers inherit the listeners across `fork`; a crashed worker is reaped
//! by `waitpid(WNOHANG)` and respawned into the same slot. SIGHUP reloads:
//! the new configuration is parsed first, and only when it parses do the
//! workers get terminated and the listeners rebound — a broken config file
//! never takes the old process tree down.

use std::collections::HashSet;
use std::fs;
use std::net::TcpListener as StdTcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::socket;
use crate::worker::Worker;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signo: i32) {
    match signo {
        x if x == Signal::SIGHUP as i32 => RELOAD.store(true, Ordering::SeqCst),
        x if x == Signal::SIGTERM as i32 || x == Signal::SIGINT as i32 => {
            SHUTDOWN.store(true, Ordering::SeqCst)
        }
        _ => {}
    }
}

/// One bound listener and what kind of traffic it accepts.
#[derive(Debug)]
pub struct BoundListener {
    /// The bound, non-blocking socket
    pub listener: StdTcpListener,
    /// Port it is bound to
    pub port: u16,
    /// Whether connections on it terminate TLS
    pub tls: bool,
}

/// Binds one listener per unique plaintext port, plus one per unique TLS
/// port for servers with TLS enabled.
pub fn bind_all(cfg: &Config) -> Result<Vec<BoundListener>> {
    let mut bound = Vec::new();
    let mut seen: HashSet<u16> = HashSet::new();

    for server in &cfg.servers {
        if seen.insert(server.listen_port) {
            let listener = socket::create_listener(&cfg.listen_addr, server.listen_port, cfg.backlog)?;
            info!(addr = %cfg.listen_addr, port = server.listen_port, "listening");
            bound.push(BoundListener {
                listener,
                port: server.listen_port,
                tls: false,
            });
        }
        if server.tls.enabled && seen.insert(server.tls.listen_port) {
            let listener =
                socket::create_listener(&cfg.listen_addr, server.tls.listen_port, cfg.backlog)?;
            info!(addr = %cfg.listen_addr, port = server.tls.listen_port, "listening (tls)");
            bound.push(BoundListener {
                listener,
                port: server.tls.listen_port,
                tls: true,
            });
        }
    }

    Ok(bound)
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // Safety: the handler only stores to atomics, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGHUP, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

fn spawn_worker(cfg: &Arc<Config>, listeners: &[BoundListener], id: usize) -> Result<Pid> {
    // Safety: the master is single-threaded, so the child resumes in a
    // consistent address space.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            info!(worker = id, pid = child.as_raw(), "spawned worker");
            Ok(child)
        }
        ForkResult::Child => {
            let inherited: Vec<_> = listeners
                .iter()
                .filter_map(|b| b.listener.try_clone().ok().map(|l| (l, b.tls)))
                .collect();

            let code = match Worker::new(cfg.clone(), inherited, id).and_then(|mut w| w.run()) {
                Ok(()) => 0,
                Err(e) => {
                    error!(worker = id, "worker failed: {e}");
                    1
                }
            };
            std::process::exit(code);
        }
    }
}

fn kill_workers(pids: &[Option<Pid>], signal: Signal) {
    for pid in pids.iter().flatten() {
        let _ = kill(*pid, signal);
    }
}

fn wait_workers(pids: &mut [Option<Pid>]) {
    for slot in pids.iter_mut() {
        if let Some(pid) = slot.take() {
            let _ = waitpid(pid, None);
        }
    }
}

/// Runs the supervision loop until a TERM/INT arrives. `config_path` is
/// re-read on SIGHUP.
pub fn run(cfg: Config, config_path: &Path) -> Result<()> {
    install_signal_handlers()?;

    let mut cfg = Arc::new(cfg);
    let mut listeners = bind_all(&cfg)?;
    let mut pids: Vec<Option<Pid>> = vec![None; cfg.worker_processes];

    for id in 0..pids.len() {
        pids[id] = Some(spawn_worker(&cfg, &listeners, id)?);
    }
    info!(
        pid = std::process::id(),
        workers = pids.len(),
        "master running"
    );

    while !SHUTDOWN.load(Ordering::SeqCst) {
        reap_and_respawn(&cfg, &listeners, &mut pids);

        if RELOAD.swap(false, Ordering::SeqCst) {
            info!("SIGHUP received, reloading configuration");
            match Config::load(config_path) {
                Ok(new_cfg) => {
                    kill_workers(&pids, Signal::SIGTERM);
                    wait_workers(&mut pids);
                    drop(std::mem::take(&mut listeners));

                    cfg = Arc::new(new_cfg);
                    listeners = match bind_all(&cfg) {
                        Ok(bound) => bound,
                        Err(e) => {
                            error!("reload rebind failed: {e}");
                            Vec::new()
                        }
                    };

                    pids = vec![None; cfg.worker_processes];
                    for id in 0..pids.len() {
                        match spawn_worker(&cfg, &listeners, id) {
                            Ok(pid) => pids[id] = Some(pid),
                            Err(e) => error!(worker = id, "respawn failed: {e}"),
                        }
                    }
                    info!(workers = pids.len(), "reload complete");
                }
                Err(e) => {
                    error!("reload failed, keeping current configuration: {e}");
                }
            }
        }

        std::thread::sleep(Duration::from_secs(1));
    }

    info!("master shutting down");
    kill_workers(&pids, Signal::SIGTERM);
    wait_workers(&mut pids);
    if let Some(pid_file) = &cfg.process.pid_file {
        remove_pid_file(pid_file);
    }
    Ok(())
}

fn reap_and_respawn(cfg: &Arc<Config>, listeners: &[BoundListener], pids: &mut [Option<Pid>]) {
    loop {
        let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => status,
            Err(_) => return, // no children
        };
        let dead = match status {
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => pid,
            _ => return, // still alive
        };

        for (id, slot) in pids.iter_mut().enumerate() {
            if *slot == Some(dead) {
                warn!(worker = id, pid = dead.as_raw(), "worker died, respawning");
                *slot = None;
                if !SHUTDOWN.load(Ordering::SeqCst) {
                    match spawn_worker(cfg, listeners, id) {
                        Ok(pid) => *slot = Some(pid),
                        Err(e) => error!(worker = id, "respawn failed: {e}"),
                    }
                }
                break;
            }
        }
    }
}

/// Detaches from the terminal: double fork, new session, stdio to
/// /dev/null, optional pid file.
pub fn daemonize(pid_file: Option<&Path>) -> Result<()> {
    use std::os::fd::AsRawFd;

    // Safety: called before any threads exist.
    if let ForkResult::Parent { .. } = unsafe { fork() }? {
        std::process::exit(0);
    }
    setsid()?;
    if let ForkResult::Parent { .. } = unsafe { fork() }? {
        std::process::exit(0);
    }

    let devnull = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .map_err(Error::Io)?;
    let fd = devnull.as_raw_fd();
    unsafe {
        nix::libc::dup2(fd, 0);
        nix::libc::dup2(fd, 1);
        nix::libc::dup2(fd, 2);
    }

    if let Some(path) = pid_file {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        fs::write(path, format!("{}\n", std::process::id())).map_err(Error::Io)?;
    }
    Ok(())
}

/// Removes the pid file written by [`daemonize`].
pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

#[cfg(test)]
mod test {
    use super::bind_all;
    use crate::config::Config;

    #[test]
    fn bind_all_dedupes_ports_across_servers() {
        let cfg = Config::parse(
            "[server]\nlisten_addr = 127.0.0.1\nlisten_port = 0\n[server]\nlisten_port = 0\n",
        )
        .unwrap();
        // both servers use port 0; the kernel assigns two distinct ports,
        // but the configured port value dedupes to a single listener
        let bound = bind_all(&cfg).unwrap();
        assert_eq!(1, bound.len());
        assert!(!bound[0].tls);
    }
}
