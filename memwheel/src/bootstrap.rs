// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The handshake: hands a freshly created wheel's descriptors from a
//! producer process to a consumer process over a connected
//! `SOCK_SEQPACKET` socket (typically one half of a `socketpair(2)` shared
//! across a `fork(2)`, though any connected `AF_UNIX` socket works).
//!
//! There is no negotiation of the buffer size over the wire: both ends
//! must already agree on `total_size` out of band (a shared constant, a
//! prior config exchange, whatever the application already has). The
//! handshake only ever moves descriptors, never describes the memory
//! behind them.

use crate::error::{InitError, Result};
use crate::eventfd::EventfdWheel;
use crate::scm;
use crate::spin::SpinWheel;
use std::io;
use std::os::fd::RawFd;

/// Map a `scm::send_handle(s)` failure to an `InitError`, distinguishing
/// the descriptor-cap violation (`E2BIG`) from any other handshake
/// datagram failure so callers can tell the two apart.
fn map_send_error(e: io::Error, requested: usize) -> InitError {
    if e.raw_os_error() == Some(libc::E2BIG) {
        InitError::TooManyHandles {
            requested,
            max: scm::SCM_MAX_FDS,
        }
    } else {
        InitError::Handshake(e)
    }
}

/// Producer side: create a spin wheel and send its segment descriptor to
/// the peer on the other end of `sock_fd`.
pub fn create_spin(sock_fd: RawFd, total_size: usize) -> Result<SpinWheel> {
    let wheel = SpinWheel::create(total_size)?;
    scm::send_handle(sock_fd, wheel.as_raw_fd()).map_err(|e| map_send_error(e, 1))?;
    log::debug!("[memwheel] spin wheel handshake sent ({total_size} bytes)");
    Ok(wheel)
}

/// Consumer side: receive a segment descriptor from `sock_fd` and attach
/// to it as a spin wheel. `total_size` must match what the producer passed
/// to [`create_spin`].
pub fn attach_spin(sock_fd: RawFd, total_size: usize) -> Result<SpinWheel> {
    let fd = scm::recv_handle(sock_fd).map_err(InitError::Handshake)?;
    SpinWheel::attach(fd, total_size)
}

/// Producer side: create an eventfd-backed wheel and send its three
/// descriptors (segment, readable eventfd, writable eventfd, in that
/// order) to the peer on the other end of `sock_fd`.
pub fn create_eventfd(sock_fd: RawFd, total_size: usize) -> Result<EventfdWheel> {
    let wheel = EventfdWheel::create(total_size)?;
    scm::send_handles(
        sock_fd,
        &[wheel.as_raw_fd(), wheel.readable_fd(), wheel.writable_fd()],
    )
    .map_err(|e| map_send_error(e, 3))?;
    log::debug!("[memwheel] eventfd wheel handshake sent ({total_size} bytes)");
    Ok(wheel)
}

/// Consumer side: receive the three descriptors [`create_eventfd`] sent
/// and attach to them. `total_size` must match what the producer used.
pub fn attach_eventfd(sock_fd: RawFd, total_size: usize) -> Result<EventfdWheel> {
    let fds = scm::recv_handles(sock_fd, 3).map_err(InitError::Handshake)?;
    if fds.len() != 3 {
        return Err(InitError::HandshakeHandleCount {
            expected: 3,
            got: fds.len(),
        });
    }
    EventfdWheel::attach(fds[0], total_size, fds[1], fds[2])
}
