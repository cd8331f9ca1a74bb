//! Ancillary-descriptor transport.
//!
//! After a negotiation solves, the actual pipe descriptors travel over
//! the participants' standard-stream sockets as `SCM_RIGHTS` control
//! messages with a single-byte payload, one descriptor per message.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::trace;
use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use crate::codec::ProtocolError;

/// Send `fd` over the Unix-domain stream socket `socket`.
pub fn write_fd(socket: RawFd, fd: RawFd) -> Result<()> {
    let iov = [IoSlice::new(b" ")];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(socket, &iov, &cmsg, MsgFlags::empty(), None)
        .wrap_err_with(|| format!("sendmsg on fd {socket}"))?;
    trace!("sent fd {fd} over socket {socket}");
    Ok(())
}

/// Receive one descriptor from the Unix-domain stream socket `socket`
/// and take ownership of it.
///
/// Retries once after a one-second back-off when the socket is not yet
/// ready; truncated control data is fatal.
pub fn read_fd(socket: RawFd) -> Result<RawFd> {
    let mut retried = false;
    loop {
        let mut data = [0u8; 2];
        let mut iov = [IoSliceMut::new(&mut data)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
        match recvmsg::<()>(socket, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty()) {
            Err(Errno::EAGAIN) if !retried => {
                retried = true;
                thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(e).wrap_err_with(|| format!("recvmsg on fd {socket}")),
            Ok(msg) => {
                if msg.flags.contains(MsgFlags::MSG_TRUNC)
                    || msg.flags.contains(MsgFlags::MSG_CTRUNC)
                {
                    bail!(ProtocolError::new(format!(
                        "control message truncated on fd {socket}"
                    )));
                }
                for cmsg in msg.cmsgs()? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        if let Some(fd) = fds.first() {
                            trace!("received fd {fd} from socket {socket}");
                            return Ok(*fd);
                        }
                    }
                }
                bail!(ProtocolError::new(format!(
                    "no descriptor in control message on fd {socket}"
                )));
            }
        }
    }
}
