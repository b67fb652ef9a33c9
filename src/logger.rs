//! The logger process: every other process in the topology formats its
//! own log lines with `tracing`, but none of them touches the log file
//! directly. Each line is sent as one `UnixDatagram` payload to the
//! logger's socket; the logger is the only process that ever opens
//! the file, which keeps every writer's output interleaved correctly
//! without file-level locking.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;

const MAX_LINE: usize = 8192;

/// A `tracing` writer that ships each write as one datagram to the
/// logger process instead of touching the filesystem itself. Cloned
/// per-thread by `tracing_subscriber`'s `MakeWriter` contract, so the
/// underlying socket is reference-counted.
#[derive(Clone)]
pub struct RemoteWriter {
    socket: std::sync::Arc<UnixDatagram>,
}

impl RemoteWriter {
    pub fn connect(control_path: &Path) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(control_path)?;
        Ok(RemoteWriter {
            socket: std::sync::Arc::new(socket),
        })
    }
}

impl io::Write for RemoteWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(MAX_LINE);
        self.socket.send(&buf[..n])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for RemoteWriter {
    type Writer = RemoteWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install a `tracing` subscriber in a non-logger process that ships
/// every formatted line to `control_path`.
pub fn install_remote_subscriber(control_path: &Path) -> io::Result<()> {
    let writer = RemoteWriter::connect(control_path)?;
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    Ok(())
}

/// Run the logger process itself: bind `control_path`, and relay every
/// datagram received on it into `log_path`, appending, until the
/// control socket is closed out from under it.
///
/// Returns the `tracing-appender` guard; dropping it flushes and joins
/// the background writer thread, so callers must hold it for the
/// lifetime of the loop (it is moved into the blocking loop itself).
pub fn run(control_path: &Path, log_path: &Path) -> io::Result<()> {
    let _ = std::fs::remove_file(control_path);
    let socket = UnixDatagram::bind(control_path)?;

    let dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = log_path
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_else(|| std::ffi::OsString::from("smtpd.log"));
    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    relay_loop(socket, non_blocking, guard)
}

fn relay_loop(
    socket: UnixDatagram,
    mut writer: tracing_appender::non_blocking::NonBlocking,
    _guard: WorkerGuard,
) -> io::Result<()> {
    use io::Write;
    let mut buf = [0u8; MAX_LINE];
    loop {
        let n = match socket.recv(&mut buf) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let _ = writer.write_all(&buf[..n]);
        if !buf[..n].ends_with(b"\n") {
            let _ = writer.write_all(b"\n");
        }
    }
}
