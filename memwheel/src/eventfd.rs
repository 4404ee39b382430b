// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wakeup layer: a pair of `eventfd(2)` counting semaphores layered on top
//! of [`crate::spin::SpinWheel`] so callers can block or poll for a
//! transition instead of spinning.
//!
//! Both eventfds are created in `EFD_SEMAPHORE` mode. Plain (non-semaphore)
//! mode collapses any number of pending `write`s into a single readable
//! edge, which loses information when both ends are racing to post at
//! once: a producer could post "readable" twice while the consumer is
//! mid-read and only observe one edge, leaving a message invisible until
//! the next unrelated wakeup. Semaphore mode turns each eventfd into an
//! actual counter, so posting twice is always observable as two reads.
//!
//! `is_readable` / `is_writable` are single-bit edge-detectors guarding
//! against redundant posts: a producer only signals the readable eventfd
//! on the 0->1 transition (wheel was empty, now isn't), and a consumer
//! only signals writable on the analogous transition after reclaiming
//! space. Without them, every successful `allocate`/`publish` would post
//! unconditionally and the eventfd counters would grow unbounded relative
//! to how many times a waiter actually needs to wake up.
//!
//! `writable_fd` starts pre-loaded near its ceiling rather than at a
//! single token like `readable_fd`. `is_writable` only ever moves by one
//! per edge, so a single starting token can be drained by the producer's
//! own first `wait_writable()` call, leaving nothing to wake a second one
//! once `allocate` starts edge-suppressing repeat failures. A near-`u64`
//! ceiling means a `poll(2)` on it can drift by at most one per edge and
//! in practice never actually empties — `wait_writable` still checks
//! `is_writable` first, so this only changes how reliably the fallback
//! `poll(2)` avoids starving, not whether the flag is trusted.

use crate::error::{InitError, Result};
use crate::layout::{self, EventfdHeader, Offset};
use crate::segment::MemfdSegment;
use std::cell::Cell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::Ordering;

thread_local! {
    /// The most recent eventfd syscall failure, if any. The wheel's own
    /// atomics remain authoritative regardless of whether a wakeup write
    /// or read succeeded, so these failures are reported out-of-band
    /// rather than aborting the caller's allocate/publish/peek/return.
    static LAST_EVENTFD_ERROR: Cell<Option<io::ErrorKind>> = const { Cell::new(None) };
}

fn record_eventfd_error(e: &io::Error) {
    LAST_EVENTFD_ERROR.with(|cell| cell.set(Some(e.kind())));
}

/// The most recent `eventfd` read/write failure recorded on this thread,
/// if any. Cleared implicitly by nothing; callers that care should check
/// after each operation that touches an eventfd.
#[must_use]
pub fn last_eventfd_error() -> Option<io::ErrorKind> {
    LAST_EVENTFD_ERROR.with(Cell::get)
}

fn create_eventfd() -> Result<OwnedFd> {
    // SAFETY: eventfd(2) with a valid initial value and flags always either
    // returns a fresh owned descriptor or -1 with errno set.
    let fd = unsafe {
        libc::eventfd(
            0,
            libc::EFD_NONBLOCK | libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE,
        )
    };
    if fd < 0 {
        return Err(InitError::EventfdCreate(io::Error::last_os_error()));
    }
    // SAFETY: fd was just created above and is uniquely owned here.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// The highest value an `EFD_SEMAPHORE` eventfd's internal counter may hold
/// (the kernel rejects a `write` that would push the counter past this).
const EVENTFD_COUNTER_MAX: u64 = u64::MAX - 1;

fn post_n(fd: RawFd, v: u64) {
    // SAFETY: fd is a valid eventfd descriptor; v is a valid 8-byte buffer
    // for the write(2) ABI eventfd expects.
    let ret = unsafe { libc::write(fd, std::ptr::addr_of!(v).cast(), std::mem::size_of::<u64>()) };
    if ret < 0 {
        record_eventfd_error(&io::Error::last_os_error());
    }
}

fn post(fd: RawFd) {
    post_n(fd, 1);
}

/// Drain one token from `fd`. Returns `true` if a token was consumed,
/// `false` if the eventfd was already at zero (`EAGAIN`, since it's
/// non-blocking).
fn try_consume(fd: RawFd) -> bool {
    let mut buf: u64 = 0;
    // SAFETY: fd is a valid eventfd descriptor; buf is a valid 8-byte
    // buffer for the read(2) ABI eventfd expects.
    let ret = unsafe {
        libc::read(
            fd,
            std::ptr::addr_of_mut!(buf).cast(),
            std::mem::size_of::<u64>(),
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            record_eventfd_error(&err);
        }
        return false;
    }
    true
}

/// An SPSC wheel with eventfd-backed readiness signaling layered on top of
/// the plain atomic protocol.
pub struct EventfdWheel {
    segment: MemfdSegment,
    readable_fd: OwnedFd,
    writable_fd: OwnedFd,
}

impl EventfdWheel {
    /// Create a new wheel plus its pair of eventfds.
    pub fn create(total_size: usize) -> Result<Self> {
        let aligned_size = layout::validate_buf_size(total_size)
            .map_err(InitError::InvalidBufferSize)?;
        let segment = MemfdSegment::create(total_size)?;
        // SAFETY: segment was just created and zero-initialized with
        // total_size >= size_of::<EventfdHeader>() bytes at offset 0.
        unsafe {
            EventfdHeader::init_at(segment.as_ptr() as *mut EventfdHeader, aligned_size);
        }
        let readable_fd = create_eventfd()?;
        let writable_fd = create_eventfd()?;
        // `is_writable` only ever gets a single +1/-1 nudge per edge
        // (allocate-exhausted posts, return-regained drains), so whichever
        // value writable_fd starts at just drifts by at most one between
        // transitions. Starting it at 1 like readable_fd would mean a
        // waiter's poll(2) only has that one token to live on: its own
        // first `wait_writable()` call drains it, and every allocate
        // failure after the first is edge-suppressed (no re-post, since
        // `is_writable` is already 0), so a second poll would block forever
        // with nothing left to wake it. Pre-loading a huge count instead
        // (mirroring `~0 - 1 - is_writable` upstream) keeps the fd
        // permanently non-empty; `wait_writable` still gates on the
        // `is_writable` flag first; the fd just guarantees a poll(2) on it
        // can never starve, turning a possible missed wakeup into a
        // harmless spurious one.
        post_n(writable_fd.as_raw_fd(), EVENTFD_COUNTER_MAX - 1);
        Ok(Self {
            segment,
            readable_fd,
            writable_fd,
        })
    }

    /// Attach to a wheel created by a producer, given the shared memory
    /// segment's descriptor and the two eventfd descriptors received
    /// alongside it.
    pub fn attach(fd: RawFd, total_size: usize, readable_fd: RawFd, writable_fd: RawFd) -> Result<Self> {
        layout::validate_buf_size(total_size).map_err(InitError::InvalidBufferSize)?;
        let segment = MemfdSegment::from_fd(fd, total_size)?;
        // SAFETY: both descriptors were received over SCM_RIGHTS and are
        // uniquely owned by the caller, who is transferring that ownership
        // to us.
        let readable_fd = unsafe { OwnedFd::from_raw_fd(readable_fd) };
        let writable_fd = unsafe { OwnedFd::from_raw_fd(writable_fd) };
        Ok(Self {
            segment,
            readable_fd,
            writable_fd,
        })
    }

    #[inline]
    fn header(&self) -> &EventfdHeader {
        // SAFETY: the segment is at least size_of::<EventfdHeader>() bytes
        // and was initialized by `create` (or belongs to a peer that did).
        unsafe { &*(self.segment.as_ptr() as *const EventfdHeader) }
    }

    /// The shared memory segment's descriptor, for passing to a peer.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.segment.as_raw_fd()
    }

    /// The readable-side eventfd descriptor, for passing to a peer or
    /// polling directly.
    #[must_use]
    pub fn readable_fd(&self) -> RawFd {
        self.readable_fd.as_raw_fd()
    }

    /// The writable-side eventfd descriptor, for passing to a peer or
    /// polling directly.
    #[must_use]
    pub fn writable_fd(&self) -> RawFd {
        self.writable_fd.as_raw_fd()
    }

    #[inline]
    fn spin(&self) -> &crate::layout::WheelHeader {
        &self.header().wheel
    }

    /// Byte-level access mirroring [`crate::spin::SpinWheel`], operating
    /// directly on the shared header rather than delegating to a nested
    /// `SpinWheel`, since both views must agree on the exact same memory.
    fn buf_ptr(&self) -> *mut u8 {
        // SAFETY: the segment is at least ALIGN bytes.
        unsafe { self.segment.as_ptr().add(layout::ALIGN) }
    }

    fn slice_ptr(&self, offset: Offset) -> *mut crate::layout::SliceHeader {
        // SAFETY: offsets passed here always came from `allocate` or the
        // wheel's own published pair.
        unsafe {
            self.buf_ptr().add(offset as usize * layout::ALIGN) as *mut crate::layout::SliceHeader
        }
    }

    fn slice_header_at(&self, offset: Offset) -> &crate::layout::SliceHeader {
        // SAFETY: see `slice_ptr`.
        unsafe { &*self.slice_ptr(offset) }
    }

    fn payload_ptr(&self, offset: Offset) -> *mut u8 {
        // SAFETY: see `slice_ptr`; the header occupies exactly
        // size_of::<SliceHeader>() bytes at its start.
        unsafe { (self.slice_ptr(offset) as *mut u8).add(std::mem::size_of::<crate::layout::SliceHeader>()) }
    }

    /// Reserve a slice, same semantics as [`crate::spin::SpinWheel::allocate`].
    /// On failure (wheel full), clears the writable edge and, on the 1->0
    /// transition, posts a token to `writable_fd` so a waiter polling it
    /// observes the fd go non-empty and re-checks `is_writable` itself (the
    /// fd is a wakeup bell, not an authoritative readiness bit).
    pub fn allocate(&mut self, size: usize) -> Option<Offset> {
        let aligned_size = self.spin().aligned_size;
        let header_size = std::mem::size_of::<crate::layout::SliceHeader>();
        let size_in_wheel = header_size.checked_add(size)?;
        let size_in_wheel = layout::align_up(size_in_wheel);
        let need = (size_in_wheel / layout::ALIGN) as u32;

        let mut pair = self.spin().head_last.load(Ordering::SeqCst);
        let offset = match self.compute_offset(need, pair, aligned_size) {
            Some(o) => o,
            None => {
                if self.header().is_writable.swap(0, Ordering::AcqRel) == 1 {
                    post(self.writable_fd.as_raw_fd());
                }
                return None;
            }
        };

        let (_, old_last) = layout::unpack_pair(pair);
        if offset == 0 && pair != layout::INVALID_PAIR {
            self.slice_header_at(old_last)
                .wheel_units
                .store(aligned_size - old_last, Ordering::Release);
        }

        // SAFETY: offset names a free, bounds-checked region; single
        // producer means nothing else writes it concurrently.
        unsafe {
            crate::layout::SliceHeader::init_at(self.slice_ptr(offset), size, need);
        }

        loop {
            if pair == layout::INVALID_PAIR {
                self.spin()
                    .head_last
                    .store(layout::pack_pair(offset, offset), Ordering::SeqCst);
                break;
            }
            let (head, _) = layout::unpack_pair(pair);
            let new_pair = layout::pack_pair(head, offset);
            match self.spin().head_last.compare_exchange(
                pair,
                new_pair,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => pair = actual,
            }
        }

        Some(offset)
    }

    fn compute_offset(&self, need: u32, pair: u64, aligned_size: u32) -> Option<Offset> {
        if pair == layout::INVALID_PAIR {
            return if need <= aligned_size { Some(0) } else { None };
        }
        let (head, last) = layout::unpack_pair(pair);
        let last_units = self.slice_header_at(last).wheel_units();
        let last_end = last + last_units;
        if last < head {
            if need <= head - last_end {
                Some(last_end)
            } else {
                None
            }
        } else if need <= aligned_size - last_end {
            Some(last_end)
        } else if need <= head {
            Some(0)
        } else {
            None
        }
    }

    /// The payload region for a previously allocated slice.
    pub fn slice_mut(&mut self, offset: Offset) -> &mut [u8] {
        let user_size = self.slice_header_at(offset).user_size;
        // SAFETY: sized to the region `allocate` reserved.
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(offset), user_size) }
    }

    /// Publish a slice and, on the empty-to-nonempty edge, signal the
    /// readable eventfd so a blocked consumer wakes up.
    pub fn publish(&self, offset: Offset) {
        self.slice_header_at(offset)
            .set_state(crate::layout::SliceState::Readable, Ordering::Release);
        if self.header().is_readable.swap(1, Ordering::AcqRel) == 0 {
            post(self.readable_fd.as_raw_fd());
        }
    }

    /// Same semantics as [`crate::spin::SpinWheel::peek`]. On failure,
    /// clears the readable edge and, on the 1->0 transition, drains a
    /// token from `readable_fd` so the next publish is observed as a fresh
    /// edge rather than piling up an already-consumed wakeup.
    pub fn peek(&self) -> Option<(Offset, &[u8])> {
        let pair = self.spin().head_last.load(Ordering::SeqCst);
        let (head, _) = layout::unpack_pair(pair);
        if head == layout::INVALID_OFFSET {
            self.clear_readable_edge();
            return None;
        }
        let slice = self.slice_header_at(head);
        if slice.state() != crate::layout::SliceState::Readable {
            self.clear_readable_edge();
            return None;
        }
        let payload = unsafe { std::slice::from_raw_parts(self.payload_ptr(head), slice.user_size) };
        Some((head, payload))
    }

    fn clear_readable_edge(&self) {
        if self.header().is_readable.swap(0, Ordering::AcqRel) == 1 {
            try_consume(self.readable_fd.as_raw_fd());
        }
    }

    /// Same semantics as [`crate::spin::SpinWheel::return_slice`], plus
    /// signaling the writable eventfd on the full-to-nonfull edge.
    pub fn return_slice(&self, offset: Offset) -> usize {
        let slice = self.slice_header_at(offset);
        if slice
            .state
            .swap(crate::layout::SliceState::Returned as u8, Ordering::AcqRel)
            == crate::layout::SliceState::Returned as u8
        {
            return 0;
        }

        let mut returns = 0usize;
        loop {
            let pair = self.spin().head_last.load(Ordering::SeqCst);
            if pair == layout::INVALID_PAIR {
                break;
            }
            let (head, last) = layout::unpack_pair(pair);
            let head_slice = self.slice_header_at(head);
            if head_slice.state() != crate::layout::SliceState::Returned {
                break;
            }
            let new_pair = if head == last {
                layout::INVALID_PAIR
            } else {
                let aligned_size = self.spin().aligned_size;
                let next_head = (head + head_slice.wheel_units()) % aligned_size;
                layout::pack_pair(next_head, last)
            };
            if self
                .spin()
                .head_last
                .compare_exchange(pair, new_pair, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                returns += 1;
            }
        }

        // The readable edge is only ever re-armed by `peek` observing a
        // failed read (see `clear_readable_edge`), matching the original's
        // `whl_return_slice`, which never touches `is_readable`. Unlike the
        // readable/allocate edges, this exchange runs unconditionally (not
        // gated on `returns > 0`) to match `whl_efd_return_slice`, which
        // always re-arms `is_writable` after delegating to the plain
        // `whl_return_slice`, even on a call that froze nothing.
        if self.header().is_writable.swap(1, Ordering::AcqRel) == 0 {
            try_consume(self.writable_fd.as_raw_fd());
        }
        returns
    }

    /// Block (via the readable eventfd, `poll(2)`) until a message is
    /// available, then return it, same as repeatedly calling `peek` but
    /// without spinning. Returns `false` if the wait itself failed (see
    /// [`last_eventfd_error`]); the caller should then fall back to
    /// `peek` directly.
    pub fn wait_readable(&self) -> bool {
        self.header().is_readable.load(Ordering::Acquire) == 1 || self.poll_and_consume(self.readable_fd.as_raw_fd())
    }

    /// Block until the wheel has room for another allocation.
    pub fn wait_writable(&self) -> bool {
        self.header().is_writable.load(Ordering::Acquire) == 1 || self.poll_and_consume(self.writable_fd.as_raw_fd())
    }

    fn poll_and_consume(&self, fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is a single, validly initialized pollfd; -1 timeout
        // blocks indefinitely, which is the documented behavior of this
        // method.
        let ret = unsafe { libc::poll(std::ptr::addr_of_mut!(pfd), 1, -1) };
        if ret < 0 {
            record_eventfd_error(&io::Error::last_os_error());
            return false;
        }
        try_consume(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_signals_readable_edge_once() {
        let mut w = EventfdWheel::create(256).expect("create");
        let off = w.allocate(16).expect("allocate");
        assert!(!try_consume(w.readable_fd()));
        w.publish(off);
        assert!(try_consume(w.readable_fd()));
        // Edge already consumed; a second drain attempt finds nothing.
        assert!(!try_consume(w.readable_fd()));
    }

    #[test]
    fn create_preloads_writable_fd_so_a_poll_never_starves() {
        let w = EventfdWheel::create(256).expect("create");
        // A waiter that polls writable_fd before any traffic at all must
        // still see it ready, since the wheel starts writable.
        assert!(try_consume(w.writable_fd()));
        // The preload is a near-ceiling count, not a single token: another
        // drain still succeeds immediately with no producer activity at
        // all, which is exactly what lets repeated allocate-failure/return
        // cycles keep posting a live wakeup without ever running the
        // counter down to zero (see the deadlock this guards against in
        // `allocate_failure_then_return_cycle_never_exhausts_writable_fd`).
        assert!(try_consume(w.writable_fd()));
    }

    #[test]
    fn allocate_failure_posts_writable_wakeup() {
        let mut w = EventfdWheel::create(256).expect("create"); // aligned_size = 3
        let mut offsets = Vec::new();
        for _ in 0..3 {
            let off = w.allocate(16).expect("allocate");
            w.publish(off);
            offsets.push(off);
        }
        assert!(w.allocate(16).is_none());
        // Losing writability posts a wakeup token so an external poller
        // blocked on `writable_fd` gets a chance to re-check `is_writable`.
        // The fd was already near-saturated, so this only proves a token
        // is still there to drain, not that this specific call added one.
        assert!(try_consume(w.writable_fd()), "allocate failure should leave a drainable token");
    }

    #[test]
    fn return_reopens_capacity_regardless_of_fd_count() {
        let mut w = EventfdWheel::create(256).expect("create");

        let mut offsets = Vec::new();
        for _ in 0..3 {
            let off = w.allocate(16).expect("allocate");
            w.publish(off);
            offsets.push(off);
        }
        assert!(w.allocate(16).is_none());

        assert_eq!(w.return_slice(offsets[0]), 1);
        // `is_writable`, not the fd's count, is the protocol's source of
        // truth: the freed slot is immediately usable again regardless of
        // how many tokens are still sitting in writable_fd.
        let off = w.allocate(16).expect("freed slot should be usable again");
        assert_eq!(off, offsets[0]);
    }

    #[test]
    fn allocate_failure_then_return_cycle_never_exhausts_writable_fd() {
        // A single pre-loaded token would eventually run out under repeated
        // fill/drain cycles, since the edge-detector only posts once per
        // 1->0 transition. A waiter whose own `wait_writable()` drained
        // that one token would then block forever on every later cycle.
        // Pre-loading a near-ceiling count instead means this can run for
        // as many cycles as the test cares to try and never starve a poller.
        let mut w = EventfdWheel::create(256).expect("create"); // aligned_size = 3
        for _ in 0..1_000 {
            let mut offsets = Vec::new();
            for _ in 0..3 {
                let off = w.allocate(16).expect("allocate");
                w.publish(off);
                offsets.push(off);
            }
            assert!(w.allocate(16).is_none());
            assert!(
                try_consume(w.writable_fd()),
                "a waiter polling writable_fd must never find it empty"
            );
            for off in offsets {
                w.return_slice(off);
            }
        }
    }

    #[test]
    fn peek_failure_drains_readable_edge() {
        let mut w = EventfdWheel::create(256).expect("create");
        let off = w.allocate(16).expect("allocate");
        w.publish(off);
        assert!(w.peek().is_some());
        assert_eq!(w.return_slice(off), 1);

        // Nothing new has been published since; the next peek fails and
        // should drain the readable token the earlier publish posted.
        assert!(w.peek().is_none());
        assert!(
            !try_consume(w.readable_fd()),
            "peek failure should have drained the readable token"
        );
    }

    #[test]
    fn peek_and_return_roundtrip_through_eventfd_wheel() {
        let mut w = EventfdWheel::create(256).expect("create");
        let off = w.allocate(8).expect("allocate");
        w.slice_mut(off).copy_from_slice(b"deadbeef");
        w.publish(off);

        let (peeked, payload) = w.peek().expect("peek");
        assert_eq!(peeked, off);
        assert_eq!(payload, b"deadbeef");
        assert_eq!(w.return_slice(off), 1);
    }
}
