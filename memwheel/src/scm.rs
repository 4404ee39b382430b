// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Ancillary descriptor passing (`SCM_RIGHTS`) over a connected
//! `AF_UNIX` socket, used by [`crate::bootstrap`] to hand the shared
//! memory and eventfd descriptors from the producer's process to the
//! consumer's.

use std::io;
use std::os::fd::RawFd;

/// Kernel-imposed practical ceiling well below the actual SCM_RIGHTS
/// limit (which is around 253 on Linux); callers of this module never
/// need more than a handful of descriptors per message.
pub const SCM_MAX_FDS: usize = 16;

/// Send `fds` as ancillary data alongside `payload` on `sockfd`.
///
/// # Errors
/// Returns an error if `fds.len()` exceeds [`SCM_MAX_FDS`] or if
/// `sendmsg(2)` fails.
pub fn send_handles_with_payload(sockfd: RawFd, fds: &[RawFd], payload: &[u8]) -> io::Result<usize> {
    if fds.len() > SCM_MAX_FDS {
        // Matches original_source/scm.c's `errno = E2BIG` on the same check.
        return Err(io::Error::from_raw_os_error(libc::E2BIG));
    }

    let cmsg_space = unsafe { libc::CMSG_SPACE((fds.len() * std::mem::size_of::<RawFd>()) as u32) };
    let mut control = vec![0u8; cmsg_space as usize];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe {
        libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) as _
    };

    // SAFETY: control is sized for CMSG_SPACE of fds.len() descriptors,
    // so CMSG_FIRSTHDR returns a pointer within `control`'s allocation.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    debug_assert!(!cmsg.is_null());
    // SAFETY: cmsg points at the first (and only) control header we just
    // sized `control` to hold.
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * std::mem::size_of::<RawFd>()) as u32) as _;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr(),
            libc::CMSG_DATA(cmsg) as *mut RawFd,
            fds.len(),
        );
    }

    // SAFETY: sockfd is a valid, caller-owned socket descriptor; msg is
    // fully initialized above and control/iov outlive this call.
    let ret = unsafe { libc::sendmsg(sockfd, &msg, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Send `fds` with a single placeholder payload byte.
///
/// # Errors
/// See [`send_handles_with_payload`].
pub fn send_handles(sockfd: RawFd, fds: &[RawFd]) -> io::Result<usize> {
    send_handles_with_payload(sockfd, fds, &[b'?'])
}

/// Send a single descriptor.
///
/// # Errors
/// See [`send_handles_with_payload`].
pub fn send_handle(sockfd: RawFd, fd: RawFd) -> io::Result<usize> {
    send_handles(sockfd, &[fd])
}

/// Receive up to `out.len()` descriptors alongside `payload`, retrying on
/// `EINTR`. Returns the number of payload bytes read and shrinks nothing —
/// callers learn how many descriptors actually arrived from the returned
/// `Vec`'s length.
///
/// If the kernel delivered more descriptors than `out` has room for, the
/// excess are closed here rather than leaked. If the control message is
/// missing or not an `SCM_RIGHTS` message on `SOL_SOCKET`, zero descriptors
/// are reported but the payload read still succeeds.
///
/// # Errors
/// Returns an error if `recvmsg(2)` fails for a reason other than `EINTR`.
pub fn recv_handles_with_payload(
    sockfd: RawFd,
    max_fds: usize,
    payload: &mut [u8],
) -> io::Result<(usize, Vec<RawFd>)> {
    let cmsg_space = unsafe { libc::CMSG_SPACE((SCM_MAX_FDS * std::mem::size_of::<RawFd>()) as u32) };
    let mut control = vec![0u8; cmsg_space as usize];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = control.len() as _;

    let ret = loop {
        // SAFETY: sockfd is a valid, caller-owned socket descriptor; msg
        // is fully initialized above.
        let ret = unsafe { libc::recvmsg(sockfd, &mut msg, 0) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break ret;
    };

    // SAFETY: msg was populated by the successful recvmsg above.
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Ok((ret as usize, Vec::new()));
    }
    // SAFETY: cmsg is non-null, as checked above, and points within
    // `control`'s allocation.
    let (level, kind) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
    if level != libc::SOL_SOCKET || kind != libc::SCM_RIGHTS {
        return Ok((ret as usize, Vec::new()));
    }

    // SAFETY: cmsg_len was set by the kernel to describe the actual
    // control data received, which fits within `control`.
    let data_len = unsafe { (*cmsg).cmsg_len } as usize - unsafe { libc::CMSG_LEN(0) } as usize;
    let n_received = data_len / std::mem::size_of::<RawFd>();

    // SAFETY: CMSG_DATA(cmsg) points at n_received consecutive RawFds
    // written by the kernel.
    let received: &[RawFd] =
        unsafe { std::slice::from_raw_parts(libc::CMSG_DATA(cmsg) as *const RawFd, n_received) };

    let take = received.len().min(max_fds);
    let mut out = Vec::with_capacity(take);
    out.extend_from_slice(&received[..take]);

    if received.len() > take {
        log::warn!(
            "[memwheel] received {} descriptor(s), closing {} beyond the requested max of {}",
            received.len(),
            received.len() - take,
            max_fds
        );
    }
    for &extra_fd in &received[take..] {
        // SAFETY: extra_fd is a descriptor the kernel just duplicated into
        // our process via SCM_RIGHTS; closing it here prevents a leak
        // since the caller asked for at most `max_fds`.
        unsafe {
            libc::close(extra_fd);
        }
    }

    Ok((ret as usize, out))
}

/// Receive up to `max_fds` descriptors with no payload of interest.
///
/// # Errors
/// See [`recv_handles_with_payload`].
pub fn recv_handles(sockfd: RawFd, max_fds: usize) -> io::Result<Vec<RawFd>> {
    let mut discard = [0u8; 0];
    let (_, fds) = recv_handles_with_payload(sockfd, max_fds, &mut discard)?;
    Ok(fds)
}

/// Receive exactly one descriptor.
///
/// # Errors
/// Returns an error if `recvmsg(2)` fails, or if zero descriptors arrived.
pub fn recv_handle(sockfd: RawFd) -> io::Result<RawFd> {
    let fds = recv_handles(sockfd, 1)?;
    fds.first().copied().ok_or_else(|| io::Error::from(io::ErrorKind::InvalidData))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn socketpair() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(ret, 0, "socketpair failed: {}", io::Error::last_os_error());
        use std::os::fd::FromRawFd;
        unsafe {
            (
                std::os::fd::OwnedFd::from_raw_fd(fds[0]),
                std::os::fd::OwnedFd::from_raw_fd(fds[1]),
            )
        }
    }

    #[test]
    fn single_handle_roundtrip() {
        let (a, b) = socketpair();
        let memfd = crate::segment::MemfdSegment::create(64).expect("create segment");

        send_handle(a.as_raw_fd(), memfd.as_raw_fd()).expect("send");
        let received = recv_handle(b.as_raw_fd()).expect("recv");

        assert!(received >= 0);
        unsafe {
            libc::close(received);
        }
    }

    #[test]
    fn multiple_handles_roundtrip_in_order() {
        let (a, b) = socketpair();
        let s1 = crate::segment::MemfdSegment::create(64).expect("create 1");
        let s2 = crate::segment::MemfdSegment::create(64).expect("create 2");

        send_handles(a.as_raw_fd(), &[s1.as_raw_fd(), s2.as_raw_fd()]).expect("send");
        let received = recv_handles(b.as_raw_fd(), 2).expect("recv");

        assert_eq!(received.len(), 2);
        for fd in received {
            unsafe {
                libc::close(fd);
            }
        }
    }

    #[test]
    fn excess_handles_are_closed_not_leaked() {
        let (a, b) = socketpair();
        let s1 = crate::segment::MemfdSegment::create(64).expect("create 1");
        let s2 = crate::segment::MemfdSegment::create(64).expect("create 2");

        send_handles(a.as_raw_fd(), &[s1.as_raw_fd(), s2.as_raw_fd()]).expect("send");
        let received = recv_handles(b.as_raw_fd(), 1).expect("recv");
        assert_eq!(received.len(), 1, "only the requested max should come back");
        unsafe {
            libc::close(received[0]);
        }
    }

    #[test]
    fn payload_is_delivered_alongside_handles() {
        let (a, b) = socketpair();
        let memfd = crate::segment::MemfdSegment::create(64).expect("create segment");

        send_handles_with_payload(a.as_raw_fd(), &[memfd.as_raw_fd()], b"hello!!!")
            .expect("send");
        let mut buf = [0u8; 8];
        let (n, fds) = recv_handles_with_payload(b.as_raw_fd(), 1, &mut buf).expect("recv");
        assert_eq!(n, 8);
        assert_eq!(&buf, b"hello!!!");
        assert_eq!(fds.len(), 1);
        unsafe {
            libc::close(fds[0]);
        }
    }

    #[test]
    fn too_many_handles_is_rejected() {
        let (a, _b) = socketpair();
        let fds = vec![0 as RawFd; SCM_MAX_FDS + 1];
        let err = send_handles(a.as_raw_fd(), &fds).expect_err("should be rejected");
        assert_eq!(err.raw_os_error(), Some(libc::E2BIG));
    }
}
