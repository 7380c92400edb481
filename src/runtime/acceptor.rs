//! Acceptor thread and shared run context.
//!
//! One acceptor owns the listening socket and distributes accepted
//! connections to workers round-robin over per-worker channels, deciding
//! the assignment once at accept time — a connection never migrates. The
//! only other cross-thread state is [`RunContext`]: a started flag and
//! run-start timestamp set exactly once when the first connection arrives.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

/// Process-wide run state shared by the acceptor and all workers.
///
/// Constructed once before any thread launches; the timer is anchored to
/// the first accepted connection so the configured run duration measures
/// serving time, not idle listening.
pub struct RunContext {
    started: AtomicBool,
    start: OnceLock<Instant>,
    run_duration: Duration,
}

impl RunContext {
    pub fn new(run_duration: Duration) -> Self {
        Self {
            started: AtomicBool::new(false),
            start: OnceLock::new(),
            run_duration,
        }
    }

    /// Anchor the run timer. Only the first call has an effect.
    pub fn mark_started(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            let _ = self.start.set(Instant::now());
            info!("run timer started");
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start.get().map(|start| start.elapsed())
    }

    /// Seconds since the anchor, for snapshot timestamps.
    pub fn timestamp(&self) -> f64 {
        self.elapsed().map_or(0.0, |e| e.as_secs_f64())
    }

    pub fn deadline_passed(&self) -> bool {
        self.elapsed().is_some_and(|e| e >= self.run_duration)
    }
}

/// Create the listening socket: `SO_REUSEADDR`, non-blocking so the accept
/// loop can interleave deadline checks with a bounded sleep.
pub fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Run the accept loop until every worker's quota is assigned, the run
/// deadline passes, or the listener fails fatally.
///
/// Accepted streams are switched to non-blocking mode and handed to the
/// next worker round-robin as raw fds; workers own them from then on.
pub fn run_acceptor(
    listener: TcpListener,
    channels: Vec<Sender<(RawFd, SocketAddr)>>,
    connections_per_worker: usize,
    ctx: &RunContext,
    tcp_nodelay: bool,
) {
    let total = channels.len() * connections_per_worker;
    let mut assigned = 0usize;

    info!(total, "acceptor started");

    while assigned < total {
        match listener.accept() {
            Ok((stream, peer)) => {
                if tcp_nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                }
                if let Err(e) = stream.set_nonblocking(true) {
                    warn!(%peer, error = %e, "failed to set non-blocking; dropping");
                    continue;
                }

                ctx.mark_started();

                let fd = stream.into_raw_fd();
                let worker = assigned % channels.len();
                debug!(fd, %peer, worker, "connection assigned");

                if channels[worker].send((fd, peer)).is_err() {
                    warn!(fd, worker, "worker gone; dropping connection");
                    unsafe { libc::close(fd) };
                }
                assigned += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if ctx.deadline_passed() {
                    info!(assigned, "run deadline reached; acceptor stopping");
                    return;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "accept failed; acceptor stopping");
                return;
            }
        }
    }

    info!(assigned, "all connection quotas assigned; acceptor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_run_context_anchor_set_once() {
        let ctx = RunContext::new(Duration::from_secs(60));
        assert!(!ctx.started());
        assert!(ctx.elapsed().is_none());
        assert_eq!(ctx.timestamp(), 0.0);
        assert!(!ctx.deadline_passed());

        ctx.mark_started();
        assert!(ctx.started());
        let first = ctx.elapsed().unwrap();

        // Second call must not re-anchor.
        std::thread::sleep(Duration::from_millis(5));
        ctx.mark_started();
        assert!(ctx.elapsed().unwrap() >= first);
    }

    #[test]
    fn test_deadline() {
        let ctx = RunContext::new(Duration::from_millis(1));
        ctx.mark_started();
        std::thread::sleep(Duration::from_millis(5));
        assert!(ctx.deadline_passed());
    }

    #[test]
    fn test_accept_and_round_robin_assignment() {
        let listener = bind_listener("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let (tx_b, rx_b) = crossbeam_channel::unbounded();
        let ctx = std::sync::Arc::new(RunContext::new(Duration::from_secs(5)));

        let acceptor_ctx = ctx.clone();
        let handle = std::thread::spawn(move || {
            run_acceptor(listener, vec![tx_a, tx_b], 1, &acceptor_ctx, true);
        });

        let _c1 = TcpStream::connect(addr).unwrap();
        let _c2 = TcpStream::connect(addr).unwrap();

        let (fd_a, _) = rx_a.recv_timeout(Duration::from_secs(2)).unwrap();
        let (fd_b, _) = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ctx.started());

        handle.join().unwrap();
        unsafe {
            libc::close(fd_a);
            libc::close(fd_b);
        }
    }
}
