// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! memwheel-demo - exercise the memwheel SPSC shared memory wheel across
//! a producer and a consumer process.

use clap::{Parser, Subcommand, ValueEnum};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const MAGIC: &[u8] = "¯\\_(ツ)_/¯".as_bytes();

#[derive(Parser, Debug)]
#[command(name = "memwheel-demo")]
#[command(about = "Exercise the memwheel SPSC shared memory wheel")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WakeupMode {
    /// Busy-spin on the wheel's atomics with no syscalls.
    Spin,
    /// Block on the pair of eventfds.
    Eventfd,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Fork a producer and a consumer process connected by a freshly
    /// created socketpair, and run both to completion.
    Fork(RunArgs),

    /// Act as the producer, handing the wheel to the peer connected at
    /// `--fd` and then sending messages.
    Send {
        /// An already-connected `SOCK_SEQPACKET` file descriptor.
        #[arg(long)]
        fd: RawFd,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Act as the consumer, receiving the wheel from the peer connected
    /// at `--fd` and then reading messages.
    Recv {
        /// An already-connected `SOCK_SEQPACKET` file descriptor.
        #[arg(long)]
        fd: RawFd,
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct RunArgs {
    /// Which wakeup strategy to use.
    #[arg(long, value_enum, default_value = "eventfd")]
    wakeup: WakeupMode,

    /// Total shared memory region size in bytes (must be a multiple of 64,
    /// at least 128).
    #[arg(long, default_value_t = 128 * 1024)]
    wheel_size: usize,

    /// Number of messages to exchange.
    #[arg(long, default_value_t = 1_000_000)]
    count: u32,

    /// Maximum message payload size in bytes; each message's size is
    /// drawn uniformly from `[0, max_size)`.
    #[arg(long, default_value_t = 16)]
    max_size: usize,
}

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

fn install_sigint_handler() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        log::warn!("[memwheel-demo] received interrupt, stopping after current message");
        flag.store(true, Ordering::SeqCst);
    })
    .expect("failed to install SIGINT handler");
    stop
}

fn run_producer(sock_fd: RawFd, run: RunArgs, stop: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let mut rng = Xorshift128Plus::new();
    let mut total_bytes: u64 = 0;
    let started = Instant::now();

    match run.wakeup {
        WakeupMode::Spin => {
            let mut wheel = memwheel::bootstrap::create_spin(sock_fd, run.wheel_size)?;
            for _ in 0..run.count {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let size = (rng.next_u64() as usize) % run.max_size;
                let offset = loop {
                    if let Some(o) = wheel.allocate(size) {
                        break o;
                    }
                };
                write_buf(wheel.slice_mut(offset));
                wheel.publish(offset);
                total_bytes += size as u64;
            }
        }
        WakeupMode::Eventfd => {
            let mut wheel = memwheel::bootstrap::create_eventfd(sock_fd, run.wheel_size)?;
            for _ in 0..run.count {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let size = (rng.next_u64() as usize) % run.max_size;
                let offset = loop {
                    if let Some(o) = wheel.allocate(size) {
                        break o;
                    }
                    wheel.wait_writable();
                };
                write_buf(wheel.slice_mut(offset));
                wheel.publish(offset);
                total_bytes += size as u64;
            }
        }
    }

    let elapsed = started.elapsed();
    eprintln!(
        "tx done {:.3}mb in {:.3}s",
        total_bytes as f64 / 1024.0 / 1024.0,
        elapsed.as_secs_f64()
    );
    Ok(())
}

fn run_consumer(sock_fd: RawFd, run: RunArgs, stop: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let mut total_bytes: u64 = 0;
    let mut failures: u32 = 0;
    let started = Instant::now();

    match run.wakeup {
        WakeupMode::Spin => {
            let wheel = memwheel::bootstrap::attach_spin(sock_fd, run.wheel_size)?;
            for _ in 0..run.count {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let (offset, len) = loop {
                    if let Some((o, payload)) = wheel.peek() {
                        if !test_buf(payload) {
                            failures += 1;
                        }
                        break (o, payload.len());
                    }
                };
                wheel.return_slice(offset);
                total_bytes += len as u64;
            }
        }
        WakeupMode::Eventfd => {
            let wheel = memwheel::bootstrap::attach_eventfd(sock_fd, run.wheel_size)?;
            for _ in 0..run.count {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let (offset, len) = loop {
                    if let Some((o, payload)) = wheel.peek() {
                        if !test_buf(payload) {
                            failures += 1;
                        }
                        break (o, payload.len());
                    }
                    wheel.wait_readable();
                };
                wheel.return_slice(offset);
                total_bytes += len as u64;
            }
        }
    }

    let elapsed = started.elapsed();
    eprintln!(
        "rx done {:.3}mb in {:.3}s, {failures} failure(s)",
        total_bytes as f64 / 1024.0 / 1024.0,
        elapsed.as_secs_f64()
    );
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn run_fork(run: RunArgs, stop: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid 2-element buffer for socketpair(2) to fill.
    let ret =
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_SEQPACKET, 0, fds.as_mut_ptr()) };
    if ret < 0 {
        return Err(Box::new(std::io::Error::last_os_error()));
    }

    // SAFETY: fork(2) duplicates the process; both copies proceed to use
    // only their own half of `fds`, closing the other.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Box::new(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        // SAFETY: child process; fds[0] is the parent's half.
        unsafe {
            libc::close(fds[0]);
        }
        let code = match run_consumer(fds[1], run, stop) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("Error: {e}");
                1
            }
        };
        std::process::exit(code);
    }

    // SAFETY: parent process; fds[1] is the child's half.
    unsafe {
        libc::close(fds[1]);
    }
    let result = run_producer(fds[0], run, stop);
    // SAFETY: fds[0] was opened by this process's socketpair() call above.
    unsafe {
        libc::close(fds[0]);
    }

    let mut status: libc::c_int = 0;
    // SAFETY: pid was returned by the successful fork above.
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    result
}

fn run(args: Args, stop: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
    match args.mode {
        Mode::Fork(run_args) => run_fork(run_args, stop),
        Mode::Send { fd, run: run_args } => run_producer(fd, run_args, stop),
        Mode::Recv { fd, run: run_args } => run_consumer(fd, run_args, stop),
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let stop = install_sigint_handler();

    if let Err(e) = run(args, &stop) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
