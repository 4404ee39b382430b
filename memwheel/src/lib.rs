// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-producer/single-consumer variable-length message wheel over
//! POSIX shared memory.
//!
//! # Architecture
//!
//! ```text
//! +------------------+              +------------------+
//! |   Process A      |   memfd +    |   Process B      |
//! |     Producer      |   eventfds   |     Consumer      |
//! |        |         |  (SCM_RIGHTS)|        |         |
//! |        v         |              |        v         |
//! |   SpinWheel   ---+--------------+--->  SpinWheel   |
//! +------------------+  atomics only +------------------+
//! ```
//!
//! The wheel itself (module [`spin`]) is a cache-line-aligned circular byte
//! buffer living in a shared memory mapping. A producer and a consumer in
//! different processes coordinate purely through atomic operations on a
//! small header — no locks, no syscalls on the fast path. An optional layer
//! (module [`eventfd`]) adds a pair of counting `eventfd(2)` descriptors so
//! callers can block or poll instead of busy-waiting.
//!
//! The initial handshake that gets the shared mapping and the two eventfds
//! from the producer's process to the consumer's uses ancillary-message
//! descriptor passing (module [`scm`]) over a connected `SOCK_SEQPACKET`
//! socket, orchestrated by module [`bootstrap`].
//!
//! # Example
//!
//! ```no_run
//! use memwheel::bootstrap;
//!
//! // Producer side, after `socketpair()` + `fork()`:
//! # fn producer(sock_fd: std::os::unix::io::RawFd) -> memwheel::Result<()> {
//! let mut wheel = bootstrap::create_spin(sock_fd, 128 * 1024)?;
//! let offset = loop {
//!     if let Some(o) = wheel.allocate(16) {
//!         break o;
//!     }
//! };
//! wheel.slice_mut(offset)[..5].copy_from_slice(b"hello");
//! wheel.publish(offset);
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod error;
pub mod eventfd;
pub mod layout;
pub mod scm;
pub mod segment;
pub mod spin;

pub use error::{InitError, Result};
pub use eventfd::EventfdWheel;
pub use layout::{Offset, ALIGN, INVALID_OFFSET};
pub use spin::SpinWheel;
