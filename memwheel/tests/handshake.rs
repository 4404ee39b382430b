// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Full handshake across a forked child: a producer process hands its
//! wheel's descriptors to a consumer process over a `socketpair(2)`, then
//! the two exchange a large volume of random-sized messages and the
//! consumer verifies every one.

use std::os::fd::RawFd;

const MAGIC: &[u8] = "¯\\_(ツ)_/¯".as_bytes();
const SEND_SIZE_MAX: u64 = 16;
const WHEEL_SIZE: usize = 128 * 1024;
// The original driver this is modeled on runs a million iterations; this
// suite runs two orders of magnitude fewer so the test suite stays fast
// while still forcing many wraps of a 128 KiB wheel.
const NLOOPS: u32 = 100_000;

struct Xorshift128Plus {
    s: [u64; 2],
}

impl Xorshift128Plus {
    fn new() -> Self {
        Self { s: [420, 69] }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.s[0];
        let y = self.s[1];
        self.s[0] = y;
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y;
        self.s[1] = x.wrapping_add(y);
        x
    }
}

fn write_buf(buf: &mut [u8]) {
    buf.fill(0xf0);
    let n = MAGIC.len().min(buf.len());
    buf[..n].copy_from_slice(&MAGIC[..n]);
}

fn test_buf(buf: &[u8]) -> bool {
    let n = MAGIC.len().min(buf.len());
    buf[..n] == MAGIC[..n]
}

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let ret =
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
    assert_eq!(ret, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn run_consumer(sock: RawFd) -> ! {
    let mut wheel = memwheel::bootstrap::attach_eventfd(sock, WHEEL_SIZE)
        .expect("consumer attach");

    let mut remaining = NLOOPS;
    let mut failures = 0u32;
    let mut total_bytes: u64 = 0;

    while remaining > 0 {
        let offset = loop {
            if let Some((offset, _)) = wheel.peek() {
                break offset;
            }
            wheel.wait_readable();
        };
        {
            let (_, payload) = wheel.peek().expect("peek after wait");
            if !test_buf(payload) {
                failures += 1;
            }
            total_bytes += payload.len() as u64;
        }
        wheel.return_slice(offset);
        remaining -= 1;
    }

    eprintln!("rx done {:.3}mb, {failures} failures", total_bytes as f64 / 1024.0 / 1024.0);
    std::process::exit(if failures == 0 { 0 } else { 1 });
}

fn run_producer(sock: RawFd) {
    let mut wheel = memwheel::bootstrap::create_eventfd(sock, WHEEL_SIZE).expect("producer create");
    let mut rng = Xorshift128Plus::new();
    let mut remaining = NLOOPS;
    let mut total_bytes: u64 = 0;

    while remaining > 0 {
        let size = (rng.next_u64() % SEND_SIZE_MAX) as usize;
        let offset = loop {
            if let Some(offset) = wheel.allocate(size) {
                break offset;
            }
            wheel.wait_writable();
        };
        write_buf(wheel.slice_mut(offset));
        wheel.publish(offset);
        total_bytes += size as u64;
        remaining -= 1;
    }

    eprintln!("tx done {:.3}mb", total_bytes as f64 / 1024.0 / 1024.0);
}

#[test]
fn million_message_handshake_roundtrip() {
    let (parent_fd, child_fd) = socketpair();

    // SAFETY: fork(2) is safe to call here; the child only ever touches
    // async-signal-safe-adjacent operations (our own atomics-based wheel,
    // libc syscalls) before calling process::exit, never unwinding back
    // into the test harness.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        // SAFETY: child process, parent_fd is the peer's end we don't use.
        unsafe {
            libc::close(parent_fd);
        }
        run_consumer(child_fd);
    }

    // SAFETY: parent process, child_fd is the peer's end we don't use.
    unsafe {
        libc::close(child_fd);
    }
    run_producer(parent_fd);
    // SAFETY: parent_fd was opened by this process's socketpair() call.
    unsafe {
        libc::close(parent_fd);
    }

    let mut status: libc::c_int = 0;
    // SAFETY: pid was just returned by a successful fork above.
    let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(ret, pid);
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    assert_eq!(
        libc::WEXITSTATUS(status),
        0,
        "consumer reported message verification failures"
    );
}
