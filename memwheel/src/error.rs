// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types.
//!
//! Two kinds only, per the protocol design: initialization failures
//! (reported up to the caller, who owns cleanup of any partially-acquired
//! handles) and the non-fatal "try again" outcome of a full or empty wheel,
//! which is not an error at all and is represented as `Option::None` rather
//! than a variant here. Event-descriptor write/read failures inside
//! [`crate::eventfd`] are surfaced separately via a last-error cell, not
//! through this type, since the wheel's own atomics remain the source of
//! truth regardless of whether the wakeup syscall succeeded.

use std::fmt;
use std::io;

/// Failures that can occur while creating or attaching to a wheel.
#[derive(Debug)]
pub enum InitError {
    /// The requested buffer size violates a layout constraint (not a
    /// multiple of `ALIGN`, too small, or too large to address).
    InvalidBufferSize(&'static str),

    /// `memfd_create` or `ftruncate` failed.
    SegmentCreate(io::Error),

    /// `mmap` failed.
    Mmap(io::Error),

    /// `eventfd(2)` creation failed.
    EventfdCreate(io::Error),

    /// Sending or receiving the handshake datagram failed.
    Handshake(io::Error),

    /// The handshake received an unexpected number of descriptors.
    HandshakeHandleCount { expected: usize, got: usize },

    /// Too many descriptors requested in a single `scm` call.
    TooManyHandles { requested: usize, max: usize },
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidBufferSize(reason) => write!(f, "invalid wheel buffer size: {reason}"),
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::Mmap(e) => write!(f, "memory mapping failed: {e}"),
            Self::EventfdCreate(e) => write!(f, "eventfd creation failed: {e}"),
            Self::Handshake(e) => write!(f, "handshake datagram failed: {e}"),
            Self::HandshakeHandleCount { expected, got } => write!(
                f,
                "handshake expected {expected} descriptor(s), received {got}"
            ),
            Self::TooManyHandles { requested, max } => {
                write!(f, "requested {requested} descriptors, max is {max}")
            }
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::Mmap(e) | Self::EventfdCreate(e) | Self::Handshake(e) => {
                Some(e)
            }
            _ => None,
        }
    }
}

impl From<io::Error> for InitError {
    fn from(e: io::Error) -> Self {
        Self::Handshake(e)
    }
}

/// Result type for wheel initialization operations.
pub type Result<T> = std::result::Result<T, InitError>;
