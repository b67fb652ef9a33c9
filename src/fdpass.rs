//! Passing an accepted connection's file descriptor across a process
//! boundary over `SCM_RIGHTS`. This is the control-channel primitive
//! the master uses to hand each accepted socket to a worker without
//! ever sharing the listening socket itself with more than one
//! process family.
//!
//! One payload byte rides along with every descriptor so a worker can
//! tell a dispatched connection (`DISPATCH`) apart from the master
//! asking it to shut down (`SHUTDOWN`, sent with no attached fd).

use std::io;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixDatagram;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

pub const DISPATCH: u8 = 1;
pub const SHUTDOWN: u8 = 0;

/// Send `fd` to the peer end of `control`, tagged `DISPATCH`.
pub fn send_fd(control: &UnixDatagram, fd: RawFd) -> io::Result<()> {
    send_tagged(control, DISPATCH, Some(fd))
}

/// Tell the peer to shut down: a tagged message with no descriptor.
pub fn send_shutdown(control: &UnixDatagram) -> io::Result<()> {
    send_tagged(control, SHUTDOWN, None)
}

fn send_tagged(control: &UnixDatagram, tag: u8, fd: Option<RawFd>) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let payload = [tag];
    let iov = [io::IoSlice::new(&payload)];
    let fds = fd.map(|f| [f]);
    let cmsgs = match &fds {
        Some(fds) => vec![ControlMessage::ScmRights(fds)],
        None => Vec::new(),
    };
    sendmsg::<()>(control.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map(|_| ())
        .map_err(io::Error::from)
}

/// One message read off a control channel: the tag byte plus an
/// attached descriptor, if any.
pub struct Received {
    pub tag: u8,
    pub fd: Option<RawFd>,
}

/// Blocking receive of one tagged message, with at most one attached
/// descriptor. Callers run this inside `spawn_blocking`: the control
/// channel carries one message per dispatched connection, far too
/// infrequent to justify a nonblocking `SCM_RIGHTS` decode path.
pub fn recv_fd(control: &UnixDatagram) -> io::Result<Received> {
    use std::os::unix::io::AsRawFd;
    let mut payload = [0u8; 1];
    let mut iov = [io::IoSliceMut::new(&mut payload)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        control.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    let fd = msg.cmsgs().find_map(|cmsg| match cmsg {
        ControlMessageOwned::ScmRights(fds) => fds.first().copied(),
        _ => None,
    });

    Ok(Received {
        tag: payload[0],
        fd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn round_trips_a_descriptor() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let tmp = tempfile::tempfile().unwrap();
        send_fd(&a, tmp.as_raw_fd()).unwrap();

        let received = recv_fd(&b).unwrap();
        assert_eq!(received.tag, DISPATCH);
        assert!(received.fd.is_some());
    }

    #[test]
    fn shutdown_message_carries_no_descriptor() {
        let (a, b) = UnixDatagram::pair().unwrap();
        send_shutdown(&a).unwrap();
        let received = recv_fd(&b).unwrap();
        assert_eq!(received.tag, SHUTDOWN);
        assert!(received.fd.is_none());
    }
}
