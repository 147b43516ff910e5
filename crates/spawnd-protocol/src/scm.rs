//! Datagram transfer with `SCM_RIGHTS` descriptor passing.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use spawnd_common::constants::{MAX_FDS, MAX_RECEIVE_FDS};

/// One received datagram.
#[derive(Debug)]
pub struct Received {
    /// Number of payload bytes written to the buffer.
    pub len: usize,
    /// Descriptors that came with it.
    pub fds: Vec<OwnedFd>,
}

/// A control message buffer for `count` descriptors, aligned for `cmsghdr`.
fn cmsg_buffer(count: usize) -> (Vec<u64>, usize) {
    // SAFETY: CMSG_SPACE is pure arithmetic.
    #[allow(clippy::cast_possible_truncation)]
    let space = unsafe { libc::CMSG_SPACE((count * size_of::<RawFd>()) as u32) } as usize;
    (vec![0u64; space.div_ceil(size_of::<u64>())], space)
}

/// Sends one datagram with up to [`MAX_FDS`] descriptors attached.
///
/// # Errors
///
/// Returns the `sendmsg()` error; `WouldBlock` on a full non-blocking socket.
pub fn send(socket: BorrowedFd<'_>, data: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "too many file descriptors",
        ));
    }

    let iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = (&raw const iov).cast_mut();
    msg.msg_iovlen = 1;

    let (mut cmsg_buf, space) = cmsg_buffer(fds.len());
    if !fds.is_empty() {
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space;

        // SAFETY: the control buffer holds CMSG_SPACE(fds.len() ints), so
        // the first header and its data fit.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::other("CMSG_FIRSTHDR returned null"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            #[allow(clippy::cast_possible_truncation)]
            {
                (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * size_of::<RawFd>()) as u32) as usize;
            }
            let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
            for (i, fd) in fds.iter().enumerate() {
                data_ptr.add(i).write_unaligned(fd.as_raw_fd());
            }
        }
    }

    // SAFETY: msg points to live buffers for the duration of the call.
    let ret = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receives one datagram into `buffer`.
///
/// Returns `None` when the peer has closed the connection. Received
/// descriptors are close-on-exec.
///
/// # Errors
///
/// Returns the `recvmsg()` error, or `InvalidData` if the datagram or its
/// descriptors were truncated.
pub fn receive(socket: BorrowedFd<'_>, buffer: &mut [u8]) -> io::Result<Option<Received>> {
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };
    let (mut cmsg_buf, space) = cmsg_buffer(MAX_RECEIVE_FDS);

    // SAFETY: msghdr is plain data; all-zero is a valid empty header.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = space;

    // SAFETY: msg points to live buffers for the duration of the call.
    let ret = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let fds = collect_fds(&msg);
    if ret == 0 && fds.is_empty() {
        return Ok(None);
    }
    if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "received datagram was truncated",
        ));
    }

    #[allow(clippy::cast_sign_loss)]
    Ok(Some(Received {
        len: ret as usize,
        fds,
    }))
}

fn collect_fds(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    // SAFETY: walking the control buffer the kernel just filled, using the
    // CMSG_* accessors. Each SCM_RIGHTS descriptor is a fresh fd we own.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let header = libc::CMSG_LEN(0) as usize;
                let count = ((*cmsg).cmsg_len as usize).saturating_sub(header) / size_of::<RawFd>();
                let data_ptr = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(data_ptr.add(i).read_unaligned()));
                }
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    fds
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use spawnd_core::sys;

    use super::*;

    #[test]
    fn datagram_with_fds_arrives_intact() {
        let (a, b) = sys::seqpacket_pair(false).unwrap();
        let (r, w) = sys::pipe().unwrap();
        send(a.as_fd(), b"hello", &[r.as_fd(), w.as_fd()]).unwrap();
        drop((r, w));

        let mut buffer = [0u8; 64];
        let received = receive(b.as_fd(), &mut buffer).unwrap().unwrap();
        assert_eq!(&buffer[..received.len], b"hello");
        assert_eq!(received.fds.len(), 2);

        sys::write_all(received.fds[1].as_raw_fd(), b"x").unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(sys::read(received.fds[0].as_raw_fd(), &mut byte).unwrap(), 1);
    }

    #[test]
    fn datagram_boundaries_are_kept() {
        let (a, b) = sys::seqpacket_pair(false).unwrap();
        send(a.as_fd(), b"one", &[]).unwrap();
        send(a.as_fd(), b"two!", &[]).unwrap();
        let mut buffer = [0u8; 64];
        assert_eq!(receive(b.as_fd(), &mut buffer).unwrap().unwrap().len, 3);
        assert_eq!(receive(b.as_fd(), &mut buffer).unwrap().unwrap().len, 4);
    }

    #[test]
    fn closed_peer_yields_none() {
        let (a, b) = sys::seqpacket_pair(false).unwrap();
        drop(a);
        let mut buffer = [0u8; 16];
        assert!(receive(b.as_fd(), &mut buffer).unwrap().is_none());
    }

    #[test]
    fn oversized_datagram_is_rejected() {
        let (a, b) = sys::seqpacket_pair(false).unwrap();
        send(a.as_fd(), &[1u8; 32], &[]).unwrap();
        let mut buffer = [0u8; 8];
        assert!(receive(b.as_fd(), &mut buffer).is_err());
    }
}
