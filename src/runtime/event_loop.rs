//! io_uring event loop, one per worker thread.
//!
//! Completion-based model: operations are pushed to the submission queue
//! during completion processing and flushed by the next `submit_and_wait`,
//! so submission cost is amortized over each processing pass. Completions
//! arrive in kernel delivery order, not submission order; the packed
//! `user_data` token is what maps each one back to its intent.
//!
//! Per-connection operations are serialized: the next operation on a
//! connection is armed only after the previous one's completion has been
//! observed. Half-duplex broadcast relaxes this and keeps several unpaired
//! sends in flight, identified by their tokens alone.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use io_uring::{opcode, squeue, types, IoUring};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Mode};
use crate::error::Error;
use crate::metrics::{MetricsSnapshot, WorkerReport};
use crate::pages::PageStore;
use crate::protocol::{self, PageRequest};
use crate::runtime::acceptor::RunContext;
use crate::runtime::buffer::BufferPool;
use crate::runtime::connection::{ConnState, ConnectionTable};
use crate::runtime::token::{OpKind, OpToken};

/// `user_data` for cancellation entries; never collides with a packed
/// [`OpToken`], whose top bit is always clear.
const CANCEL_TOKEN: u64 = u64::MAX;

/// `user_data` for the per-tick timeout entry.
const TIMEOUT_TOKEN: u64 = u64::MAX - 1;

/// Reporting-tick and idle-wait period.
const TICK: Duration = Duration::from_secs(1);

/// Ticks to wait after the run deadline before cancelling in-flight
/// operations that peers are never going to complete.
const DRAIN_GRACE_TICKS: u32 = 2;

/// Run one worker: wait for the connection quota, serve until the run
/// deadline or until every peer is gone, and report what happened.
pub fn run_worker(
    worker_id: usize,
    config: &Config,
    pages: Arc<PageStore>,
    ctx: Arc<RunContext>,
    accept_rx: Receiver<(RawFd, SocketAddr)>,
) -> Result<WorkerReport, Error> {
    let ring = IoUring::new(config.queue_depth).map_err(|e| Error::RingSetup(e.to_string()))?;

    let request_class = protocol::REQUEST_LEN;
    let payload_class = protocol::response_len(config.page_size);
    let capacity = config.inflight_ops.max(config.connections_per_worker);

    let mut pool = BufferPool::new(
        &[request_class, payload_class],
        capacity,
        config.pin_memory,
    )?;
    if config.register_buffers {
        pool.register(&ring.submitter())?;
    }

    let quota = config.connections_per_worker;
    let table = wait_for_quota(worker_id, quota, &accept_rx, &ctx);
    if table.is_empty() {
        info!(worker = worker_id, "no connections assigned; worker exiting");
        return Ok(WorkerReport {
            worker_id,
            snapshots: vec![Vec::new(); quota],
            ..WorkerReport::default()
        });
    }

    info!(
        worker = worker_id,
        connections = table.len(),
        mode = ?config.mode,
        registered = config.register_buffers,
        "worker serving"
    );

    let mut worker = Worker {
        id: worker_id,
        mode: config.mode,
        page_size: config.page_size,
        request_class,
        payload_class,
        inflight_budget: config.inflight_ops,
        ring,
        pool,
        table,
        pages,
        ctx,
        inflight: 0,
        stop_arming: false,
        snapshots: vec![Vec::new(); quota],
        totals: Totals::default(),
        wait_ts: types::Timespec::new().sec(1),
    };

    let serve_start = Instant::now();
    let result = worker.serve();
    let duration = serve_start.elapsed();
    worker.teardown();

    let report = WorkerReport {
        worker_id,
        duration,
        total_requests: worker.totals.requests,
        total_bytes_sent: worker.totals.bytes_sent,
        total_bytes_received: worker.totals.bytes_received,
        snapshots: worker.snapshots,
    };

    info!(
        worker = worker_id,
        requests = report.total_requests,
        bytes_sent = report.total_bytes_sent,
        bytes_received = report.total_bytes_received,
        secs = duration.as_secs_f64(),
        "worker finished"
    );

    result.map(|_| report)
}

/// Block (bounded polling with sleep) until the worker's connection quota
/// arrives, the acceptor goes away, or the run deadline passes.
fn wait_for_quota(
    worker_id: usize,
    quota: usize,
    accept_rx: &Receiver<(RawFd, SocketAddr)>,
    ctx: &RunContext,
) -> ConnectionTable {
    let mut table = ConnectionTable::new(quota);

    while table.len() < quota {
        match accept_rx.recv_timeout(Duration::from_millis(1)) {
            Ok((fd, peer)) => {
                if fd > OpToken::MAX_FD {
                    warn!(worker = worker_id, fd, "fd exceeds token range; dropping");
                    unsafe { libc::close(fd) };
                    continue;
                }
                let index = table.insert(fd).expect("quota checked above");
                debug!(worker = worker_id, conn = index, fd, %peer, "connection registered");
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.deadline_passed() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    table
}

#[derive(Debug, Default)]
struct Totals {
    requests: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

struct Worker {
    id: usize,
    mode: Mode,
    page_size: usize,
    request_class: usize,
    payload_class: usize,
    inflight_budget: usize,
    // The ring is declared before the pool: it must drop first so no
    // kernel reference to pool memory outlives the allocations.
    ring: IoUring,
    pool: BufferPool,
    table: ConnectionTable,
    pages: Arc<PageStore>,
    ctx: Arc<RunContext>,
    inflight: usize,
    stop_arming: bool,
    snapshots: Vec<Vec<MetricsSnapshot>>,
    totals: Totals,
    /// One-tick timespec for the timeout entry; lives here so its address
    /// is stable across submissions.
    wait_ts: types::Timespec,
}

impl Worker {
    fn serve(&mut self) -> Result<(), Error> {
        self.pre_arm()?;

        let mut last_tick = Instant::now();
        let mut grace_ticks = 0u32;
        let mut cancelled = false;
        let mut timeout_armed = false;

        loop {
            if !self.stop_arming && self.ctx.deadline_passed() {
                debug!(worker = self.id, "run deadline reached; draining");
                self.stop_arming = true;
            }
            if self.table.is_empty() {
                break;
            }
            if self.stop_arming && self.inflight == 0 {
                break;
            }

            // A timeout entry guarantees the wait below wakes within one
            // tick even when no I/O completes.
            if !timeout_armed {
                let entry = opcode::Timeout::new(&self.wait_ts as *const types::Timespec)
                    .build()
                    .user_data(TIMEOUT_TOKEN);
                push_sqe(&mut self.ring, &entry).map_err(Error::Io)?;
                timeout_armed = true;
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    error!(worker = self.id, error = %e, "completion wait failed; aborting worker");
                    return Err(Error::Io(e));
                }
            }

            let mut progress = false;
            loop {
                let Some(cqe) = self.ring.completion().next() else {
                    break;
                };
                match cqe.user_data() {
                    TIMEOUT_TOKEN => timeout_armed = false,
                    CANCEL_TOKEN => {}
                    user_data => {
                        progress = true;
                        self.on_completion(user_data, cqe.result())?;
                    }
                }
            }

            if last_tick.elapsed() >= TICK {
                self.tick(&mut last_tick);
            }

            // Peers that will never complete their armed operations stall
            // the drain; count only idle passes toward the grace period.
            if self.stop_arming && self.inflight > 0 && !progress {
                grace_ticks += 1;
                if grace_ticks >= DRAIN_GRACE_TICKS && !cancelled {
                    self.cancel_pending()?;
                    cancelled = true;
                } else if grace_ticks > DRAIN_GRACE_TICKS + 3 {
                    warn!(
                        worker = self.id,
                        abandoned = self.inflight,
                        "in-flight operations did not drain; forcing exit"
                    );
                    break;
                }
            }
        }

        Ok(())
    }

    /// Arm the initial operations, distributed round-robin, and submit
    /// them as one batch.
    fn pre_arm(&mut self) -> Result<(), Error> {
        let ids: Vec<usize> = self.table.iter().map(|(id, _)| id).collect();

        match self.mode {
            Mode::FullDuplex => {
                // One operation per connection keeps each connection's
                // request/response chain serialized.
                for &id in &ids {
                    self.arm_recv(id).map_err(Error::Io)?;
                }
            }
            Mode::HalfDuplex => {
                for i in 0..self.inflight_budget {
                    let id = ids[i % ids.len()];
                    let Some(handle) = self.pool.check_out(self.payload_class) else {
                        warn!(worker = self.id, "payload pool exhausted during pre-arm");
                        break;
                    };
                    let conn = self.table.get_mut(id).expect("pre-arm id is live");
                    conn.state = ConnState::Broadcasting;
                    conn.inflight_sends.push(handle.index);
                    let fd = conn.fd;
                    let entry = self.send_entry(fd, handle.index, 0, self.page_size);
                    push_sqe(&mut self.ring, &entry).map_err(Error::Io)?;
                    self.inflight += 1;
                }
            }
        }

        self.ring.submit().map_err(Error::Io)?;
        Ok(())
    }

    fn class_for(&self, kind: OpKind) -> usize {
        match kind {
            OpKind::Recv => self.request_class,
            OpKind::Send => self.payload_class,
        }
    }

    fn on_completion(&mut self, user_data: u64, res: i32) -> Result<(), Error> {
        self.inflight -= 1;
        let token = OpToken::unpack(user_data);

        let Some(conn_id) = self.table.index_of(token.fd) else {
            // Late completion for a connection already torn down (possible
            // in broadcast mode, where several sends fly per connection).
            // The buffer is the only thing left to reclaim.
            self.pool.check_in(self.class_for(token.kind), token.buf_index);
            return Ok(());
        };

        if res < 0 {
            let errno = -res;
            match errno {
                libc::EAGAIN => self.resubmit(token, conn_id).map_err(Error::Io)?,
                libc::ECONNRESET | libc::EPIPE => {
                    debug!(worker = self.id, fd = token.fd, conn = conn_id, "peer reset");
                    self.close_connection(conn_id);
                }
                libc::ECANCELED => {
                    debug!(worker = self.id, fd = token.fd, conn = conn_id, "operation cancelled");
                    self.close_connection(conn_id);
                }
                _ => {
                    let err = io::Error::from_raw_os_error(errno);
                    error!(
                        worker = self.id,
                        fd = token.fd,
                        conn = conn_id,
                        op = ?token.kind,
                        error = %err,
                        "operation failed; closing connection"
                    );
                    self.close_connection(conn_id);
                }
            }
            return Ok(());
        }

        if res == 0 {
            // Orderly shutdown by the peer.
            debug!(worker = self.id, fd = token.fd, conn = conn_id, "peer closed");
            self.close_connection(conn_id);
            return Ok(());
        }

        let n = res as usize;
        match token.kind {
            OpKind::Recv => self.on_recv(conn_id, token, n).map_err(Error::Io),
            OpKind::Send => self.on_send(conn_id, token, n).map_err(Error::Io),
        }
    }

    fn on_recv(&mut self, conn_id: usize, token: OpToken, n: usize) -> io::Result<()> {
        let conn = self.table.get_mut(conn_id).expect("conn_id from live fd");
        conn.counters.record_recv(n);
        let state = conn.state;
        let fd = conn.fd;

        if self.mode == Mode::HalfDuplex {
            // Ping traffic; re-arm the same direction with the same buffer.
            if self.stop_arming {
                self.pool.check_in(self.request_class, token.buf_index);
                return Ok(());
            }
            let entry = self.recv_entry(fd, token.buf_index, 0);
            push_sqe(&mut self.ring, &entry)?;
            self.inflight += 1;
            return Ok(());
        }

        let ConnState::Receiving { buf, filled } = state else {
            warn!(worker = self.id, conn = conn_id, "receive completion in unexpected state");
            self.close_connection(conn_id);
            return Ok(());
        };
        debug_assert_eq!(buf, token.buf_index);

        let filled = filled + n;
        if filled < protocol::REQUEST_LEN {
            // Partial record: pick up where the short read stopped.
            if self.stop_arming {
                self.close_connection(conn_id);
                return Ok(());
            }
            self.table.get_mut(conn_id).expect("still live").state =
                ConnState::Receiving { buf, filled };
            let entry = self.recv_entry(fd, buf, filled);
            push_sqe(&mut self.ring, &entry)?;
            self.inflight += 1;
            return Ok(());
        }

        let request = PageRequest::decode(&self.pool.slice(self.request_class, buf)[..filled])
            .expect("full record is decodable");
        self.pool.check_in(self.request_class, buf);
        self.table.get_mut(conn_id).expect("still live").state = ConnState::Idle;

        if self.stop_arming {
            return Ok(());
        }

        if request.page_number as usize >= self.pages.page_count() {
            warn!(
                worker = self.id,
                conn = conn_id,
                page = request.page_number,
                "invalid page number requested"
            );
        }

        let Some(handle) = self.pool.check_out(self.payload_class) else {
            error!(
                worker = self.id,
                conn = conn_id,
                fd,
                "payload pool exhausted; dropping connection"
            );
            self.close_connection(conn_id);
            return Ok(());
        };

        let out = self.pool.slice_mut(self.payload_class, handle.index);
        let total = protocol::encode_response(&request, &self.pages, out);

        self.table
            .get_mut(conn_id)
            .expect("still live")
            .start_sending(handle.index, total);
        let entry = self.send_entry(fd, handle.index, 0, total);
        push_sqe(&mut self.ring, &entry)?;
        self.inflight += 1;
        Ok(())
    }

    fn on_send(&mut self, conn_id: usize, token: OpToken, n: usize) -> io::Result<()> {
        let conn = self.table.get_mut(conn_id).expect("conn_id from live fd");
        conn.counters.record_send(n);
        let state = conn.state;
        let fd = conn.fd;

        if self.mode == Mode::HalfDuplex {
            let conn = self.table.get_mut(conn_id).expect("still live");
            conn.counters.record_request();
            if self.stop_arming {
                conn.inflight_sends.retain(|&buf| buf != token.buf_index);
                self.pool.check_in(self.payload_class, token.buf_index);
                return Ok(());
            }
            // Broadcast: re-arm the same payload immediately; the buffer
            // stays on the in-flight list.
            let entry = self.send_entry(fd, token.buf_index, 0, self.page_size);
            push_sqe(&mut self.ring, &entry)?;
            self.inflight += 1;
            return Ok(());
        }

        let ConnState::Sending { buf, written, total } = state else {
            warn!(worker = self.id, conn = conn_id, "send completion in unexpected state");
            self.close_connection(conn_id);
            return Ok(());
        };
        debug_assert_eq!(buf, token.buf_index);

        let written = written + n;
        if written < total {
            // Short send: push the remainder.
            self.table.get_mut(conn_id).expect("still live").state = ConnState::Sending {
                buf,
                written,
                total,
            };
            let entry = self.send_entry(fd, buf, written, total - written);
            push_sqe(&mut self.ring, &entry)?;
            self.inflight += 1;
            return Ok(());
        }

        self.pool.check_in(self.payload_class, buf);
        let conn = self.table.get_mut(conn_id).expect("still live");
        conn.counters.record_request();
        conn.state = ConnState::Idle;

        if self.stop_arming {
            return Ok(());
        }
        self.arm_recv(conn_id)
    }

    /// Check out a request buffer and arm a receive for the next record.
    /// Pool exhaustion drops this connection only.
    fn arm_recv(&mut self, conn_id: usize) -> io::Result<()> {
        let Some(conn) = self.table.get(conn_id) else {
            return Ok(());
        };
        let fd = conn.fd;

        let Some(handle) = self.pool.check_out(self.request_class) else {
            error!(
                worker = self.id,
                conn = conn_id,
                fd,
                "request pool exhausted; dropping connection"
            );
            self.close_connection(conn_id);
            return Ok(());
        };

        self.table
            .get_mut(conn_id)
            .expect("still live")
            .start_receiving(handle.index);
        let entry = self.recv_entry(fd, handle.index, 0);
        push_sqe(&mut self.ring, &entry)?;
        self.inflight += 1;
        Ok(())
    }

    /// Resubmit an operation unchanged after `-EAGAIN`.
    fn resubmit(&mut self, token: OpToken, conn_id: usize) -> io::Result<()> {
        let state = self.table.get(conn_id).expect("conn_id from live fd").state;

        let entry = match token.kind {
            OpKind::Recv => {
                let offset = match state {
                    ConnState::Receiving { filled, .. } => filled,
                    _ => 0,
                };
                self.recv_entry(token.fd, token.buf_index, offset)
            }
            OpKind::Send => match state {
                ConnState::Sending { written, total, .. } => {
                    self.send_entry(token.fd, token.buf_index, written, total - written)
                }
                _ => self.send_entry(token.fd, token.buf_index, 0, self.page_size),
            },
        };

        push_sqe(&mut self.ring, &entry)?;
        self.inflight += 1;
        Ok(())
    }

    fn recv_entry(&self, fd: RawFd, buf_index: u32, offset: usize) -> squeue::Entry {
        let ptr = unsafe { self.pool.ptr(self.request_class, buf_index).add(offset) };
        let len = (protocol::REQUEST_LEN - offset) as u32;
        let token = OpToken::new(OpKind::Recv, buf_index, fd).pack();

        match self.pool.fixed_index(self.request_class, buf_index) {
            Some(fixed) => opcode::ReadFixed::new(types::Fd(fd), ptr, len, fixed)
                .build()
                .user_data(token),
            None => opcode::Recv::new(types::Fd(fd), ptr, len)
                .build()
                .user_data(token),
        }
    }

    fn send_entry(&self, fd: RawFd, buf_index: u32, offset: usize, len: usize) -> squeue::Entry {
        let ptr = unsafe { self.pool.ptr(self.payload_class, buf_index).add(offset) };
        let token = OpToken::new(OpKind::Send, buf_index, fd).pack();

        match self.pool.fixed_index(self.payload_class, buf_index) {
            Some(fixed) => opcode::WriteFixed::new(types::Fd(fd), ptr, len as u32, fixed)
                .build()
                .user_data(token),
            None => opcode::Send::new(types::Fd(fd), ptr, len as u32)
                .build()
                .user_data(token),
        }
    }

    /// Cancel everything still in flight, reconstructing each target's
    /// token from the connection state (or, in broadcast mode, from the
    /// in-flight send list). Cancelled operations complete with
    /// `-ECANCELED` and flow through the normal dispatch path.
    fn cancel_pending(&mut self) -> Result<(), Error> {
        debug!(
            worker = self.id,
            inflight = self.inflight,
            "cancelling in-flight operations"
        );

        let mut targets = Vec::with_capacity(self.inflight);
        for (_, conn) in self.table.iter() {
            match conn.state {
                ConnState::Receiving { buf, .. } => {
                    targets.push(OpToken::new(OpKind::Recv, buf, conn.fd).pack());
                }
                ConnState::Sending { buf, .. } => {
                    targets.push(OpToken::new(OpKind::Send, buf, conn.fd).pack());
                }
                ConnState::Broadcasting => {
                    targets.extend(
                        conn.inflight_sends
                            .iter()
                            .map(|&buf| OpToken::new(OpKind::Send, buf, conn.fd).pack()),
                    );
                }
                ConnState::Idle => {}
            }
        }

        for target in targets {
            let entry = opcode::AsyncCancel::new(target)
                .build()
                .user_data(CANCEL_TOKEN);
            push_sqe(&mut self.ring, &entry).map_err(Error::Io)?;
        }
        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize) {
        let Some(conn) = self.table.remove(conn_id) else {
            return;
        };

        // An operation buffer referenced by the state belongs to this
        // connection's consumed completion; reclaim it exactly once here.
        match conn.state {
            ConnState::Receiving { buf, .. } => self.pool.check_in(self.request_class, buf),
            ConnState::Sending { buf, .. } => self.pool.check_in(self.payload_class, buf),
            ConnState::Idle | ConnState::Broadcasting => {}
        }

        self.totals.requests += conn.counters.requests;
        self.totals.bytes_sent += conn.counters.bytes_sent;
        self.totals.bytes_received += conn.counters.bytes_received;

        unsafe { libc::close(conn.fd) };
        debug!(worker = self.id, conn = conn_id, fd = conn.fd, "connection closed");
    }

    /// Per-second metrics pass: one shared timestamp for every connection
    /// in this tick.
    fn tick(&mut self, last_tick: &mut Instant) {
        let timestamp = self.ctx.timestamp();
        let interval = last_tick.elapsed().as_secs_f64();
        for (id, conn) in self.table.iter_mut() {
            self.snapshots[id].push(conn.counters.tick(timestamp, interval));
        }
        *last_tick = Instant::now();
    }

    fn teardown(&mut self) {
        let ids: Vec<usize> = self.table.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.close_connection(id);
        }
        if let Err(e) = self.pool.unregister(&self.ring.submitter()) {
            warn!(worker = self.id, error = %e, "buffer unregistration failed");
        }
    }
}

/// Push one entry, flushing the queue first if it is full.
fn push_sqe(ring: &mut IoUring, entry: &squeue::Entry) -> io::Result<()> {
    if unsafe { ring.submission().push(entry) }.is_ok() {
        return Ok(());
    }
    ring.submit()?;
    unsafe { ring.submission().push(entry) }
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))
}
