//! Process management: detaching, pid file, termination signals, and the
//! shutdown guard that tears down per-connection tasks when an engine
//! future is dropped.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::info;

/// Wakes every task selecting on the inner `Notify` when the owning
/// engine future is dropped.
pub struct ShutdownGuard(Arc<Notify>);

impl ShutdownGuard {
    pub fn new(notify: Arc<Notify>) -> Self {
        ShutdownGuard(notify)
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.0.notify_waiters();
    }
}

/// Detach from the controlling terminal: fork twice, start a new session,
/// point stdio at /dev/null. Must run before the async runtime is built.
pub fn daemonize() -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()).context("fork"),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            return Err(std::io::Error::last_os_error()).context("setsid");
        }
        match libc::fork() {
            -1 => return Err(std::io::Error::last_os_error()).context("fork"),
            0 => {}
            _ => libc::_exit(0),
        }
        let fd = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
            if fd > 2 {
                libc::close(fd);
            }
        }
    }
    Ok(())
}

pub fn write_pid_file(path: &Path) -> Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("write pid file {}", path.display()))
}

pub fn remove_pid_file(path: &Path) {
    let _ = fs::remove_file(path);
}

/// Resolves when INT, TERM, or QUIT arrives.
pub async fn wait_for_shutdown() -> Result<()> {
    let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut quit = signal(SignalKind::quit()).context("install SIGQUIT handler")?;
    tokio::select! {
        _ = int.recv() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
        _ = quit.recv() => info!("received SIGQUIT"),
    }
    Ok(())
}
