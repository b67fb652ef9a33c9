//! Signal disposition shared by every process in the topology:
//! `SIGPIPE`/`SIGHUP` are ignored everywhere (a worker writing to a
//! peer that has already hung up must see `EPIPE` on the write, not
//! die), and `SIGTERM`/`SIGINT` request graceful shutdown wherever a
//! caller installs a listener for them.

use nix::sys::signal::{self, SigHandler, Signal};
use tokio::signal::unix::{signal as tokio_signal, SignalKind};

/// Install the ignore dispositions. Must run before `fork()`: a
/// disposition set to `SIG_IGN` is inherited by children, a disposition
/// left at the default is not guaranteed to be.
pub fn ignore_sigpipe_and_sighup() {
    unsafe {
        let _ = signal::signal(Signal::SIGPIPE, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGHUP, SigHandler::SigIgn);
    }
}

/// Install no-op dispositions for `SIGTERM`/`SIGINT`. Workers and the
/// logger do not shut themselves down on these signals — the master is
/// the only process that decides to shut down, and it tells a worker or
/// the logger to stop via the control channel (`fdpass::send_shutdown`).
/// Without this, a `SIGTERM`/`SIGINT` delivered to the whole foreground
/// process group (e.g. Ctrl-C) would kill a worker mid-connection
/// instead of letting the master drain it in order. Call this in each
/// child right after `fork()`, before it starts doing any work.
pub fn ignore_sigterm_and_sigint() {
    unsafe {
        let _ = signal::signal(Signal::SIGTERM, SigHandler::SigIgn);
        let _ = signal::signal(Signal::SIGINT, SigHandler::SigIgn);
    }
}

/// Wait for either `SIGTERM` or `SIGINT`. Intended to be raced against
/// a process's main loop with `tokio::select!`; returns once, on
/// whichever arrives first.
pub async fn wait_for_shutdown() {
    let mut term = match tokio_signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut int = match tokio_signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}
