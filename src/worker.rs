//! A worker process: owns no listening socket of its own, only the
//! control channel it was handed at fork time. It blocks on that
//! channel for dispatched connections, and runs each one to
//! completion as an independent task on its own single-threaded
//! runtime.
//!
//! The original server kept its live connections in a red-black tree
//! keyed by file descriptor so a `poll(2)` readiness event could find
//! its `Context` in O(log n). A `tokio::spawn`ed task per connection
//! needs no such index — the runtime itself demultiplexes readiness —
//! so the map here exists only to bound how many connections one
//! worker will run concurrently, not to dispatch events.

use std::net::TcpStream as StdTcpStream;
use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

use crate::context::Context;
use crate::error::ServerError;
use crate::fdpass::{self, Received, DISPATCH, SHUTDOWN};
use crate::settings::Settings;

/// Entry point run by a forked worker process, after it has set up
/// its own logging and closed every fd it does not need. Blocks until
/// the master closes the control channel or sends `SHUTDOWN`.
pub fn run(control: UnixDatagram, settings: Arc<Settings>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to start worker runtime");

    runtime.block_on(dispatch_loop(control, settings));
}

async fn dispatch_loop(control: UnixDatagram, settings: Arc<Settings>) {
    // Bounds how many connections run concurrently in one worker; a
    // saturated worker simply stops accepting new dispatches until one
    // finishes, leaving the fd unread on the control channel for the
    // master to notice via a full send buffer.
    let limiter = Arc::new(Semaphore::new(settings.backlog_size.max(1) as usize));
    let control = Arc::new(control);
    let active = Arc::new(AtomicU64::new(0));

    loop {
        let control = control.clone();
        let received = match tokio::task::spawn_blocking(move || fdpass::recv_fd(&control)).await {
            Ok(Ok(r)) => r,
            Ok(Err(_)) | Err(_) => break,
        };

        match received {
            Received { tag: SHUTDOWN, .. } => break,
            Received {
                tag: DISPATCH,
                fd: Some(fd),
            } => {
                let permit = match limiter.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        // SAFETY: fd was just handed to us via SCM_RIGHTS and
                        // is not owned anywhere else yet.
                        unsafe { drop(StdTcpStream::from_raw_fd(fd)) };
                        continue;
                    }
                };
                let settings = settings.clone();
                let active = active.clone();
                active.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(async move {
                    // SAFETY: fd was handed to us via SCM_RIGHTS for this
                    // connection alone.
                    let std_stream = unsafe { StdTcpStream::from_raw_fd(fd) };
                    if let Err(e) = std_stream.set_nonblocking(true) {
                        tracing::warn!(error = %e, "failed to set socket nonblocking");
                        active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                        return;
                    }
                    let stream = match TcpStream::from_std(std_stream) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to adopt dispatched socket");
                            active.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                            return;
                        }
                    };
                    run_connection(stream, settings).await;
                    active.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
            Received { tag: DISPATCH, fd: None } => {
                tracing::warn!("dispatch message carried no descriptor");
            }
            Received { tag, .. } => {
                tracing::warn!(tag, "unrecognized control message");
            }
        }
    }
}

/// Drive one connection's `Context` to completion: a command-at-a-time
/// dispatcher, cooperatively suspended on whichever of socket-read,
/// socket-write, or the transaction's in-flight write resolves first.
pub async fn run_connection(mut stream: TcpStream, settings: Arc<Settings>) {
    let peer_addr = match stream.peer_addr() {
        Ok(a) => a,
        Err(_) => return,
    };
    let local_addr = match stream.local_addr() {
        Ok(a) => a,
        Err(_) => return,
    };

    let mut ctx = Context::new(settings.clone(), peer_addr, local_addr);
    let uuid = ctx.uuid.clone();
    tracing::info!(uuid = %uuid, peer = %peer_addr, "connection accepted");
    ctx.begin();

    let timeout = Duration::from_millis(settings.timeout_ms.max(0) as u64);

    loop {
        if let Err(e) = flush_outbound(&mut stream, &mut ctx).await {
            tracing::info!(uuid = %uuid, error = %e, "write failed, closing connection");
            break;
        }

        if ctx.is_done() {
            break;
        }

        if ctx.is_waiting() {
            ctx.poll_pending().await;
            tokio::task::yield_now().await;
            continue;
        }

        let remaining = timeout.saturating_sub(ctx.idle_for());
        let read_result = tokio::time::timeout(remaining, read_more(&mut stream, &mut ctx)).await;
        match read_result {
            Ok(Ok(_)) => {
                ctx.process_buffered().await;
            }
            Ok(Err(ServerError::Eof)) => {
                tracing::info!(uuid = %uuid, "peer closed connection");
                break;
            }
            Ok(Err(e)) => {
                tracing::info!(uuid = %uuid, error = %e, "read failed, closing connection");
                break;
            }
            Err(_) => {
                tracing::info!(uuid = %uuid, peer = %peer_addr, "connection timed out");
                ctx.note_timeout();
            }
        }
    }

    let _ = flush_outbound(&mut stream, &mut ctx).await;
    tracing::info!(
        uuid = %uuid,
        duration_ms = ctx.session_duration().as_millis() as u64,
        "connection closed"
    );
}

async fn read_more(stream: &mut TcpStream, ctx: &mut Context) -> Result<usize, ServerError> {
    let n = stream.read(ctx.read_target()).await?;
    if n == 0 {
        return Err(ServerError::Eof);
    }
    ctx.commit_read(n);
    Ok(n)
}

async fn flush_outbound(stream: &mut TcpStream, ctx: &mut Context) -> Result<(), ServerError> {
    while let Some(reply) = ctx.pop_outbound() {
        stream.write_all(&reply).await?;
    }
    Ok(())
}
