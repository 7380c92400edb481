//! Completion-driven runtime.
//!
//! One acceptor thread plus `workers` event-loop threads, each owning a
//! private io_uring instance, buffer pool, and connection table. The only
//! cross-thread state is the per-worker accept channels and the shared
//! [`RunContext`].

mod acceptor;
mod buffer;
mod connection;
mod token;

#[cfg(target_os = "linux")]
mod event_loop;

pub use acceptor::{bind_listener, run_acceptor, RunContext};
pub use buffer::{BufHandle, BufferPool};
pub use connection::{ConnState, Connection, ConnectionTable};
pub use token::{OpKind, OpToken};

use crate::config::Config;
use crate::error::Error;
use crate::metrics::RunReport;

/// Run the engine to completion: bind, accept, serve for the configured
/// duration, and aggregate the per-worker reports.
pub fn run(config: &Config) -> Result<RunReport, Error> {
    #[cfg(target_os = "linux")]
    {
        run_linux(config)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(Error::Unsupported)
    }
}

#[cfg(target_os = "linux")]
fn run_linux(config: &Config) -> Result<RunReport, Error> {
    use std::sync::Arc;
    use std::thread;

    use tracing::{error, info};

    use crate::metrics::WorkerReport;
    use crate::pages::{FillPattern, PageStore};

    let pages = Arc::new(PageStore::new(
        config.page_count,
        config.page_size,
        FillPattern::default(),
    ));
    let ctx = Arc::new(RunContext::new(config.run_duration));

    let listener = bind_listener(&config.listen)?;
    info!(
        addr = %listener.local_addr()?,
        workers = config.workers,
        connections_per_worker = config.connections_per_worker,
        mode = ?config.mode,
        "listening"
    );

    let mut worker_txs = Vec::with_capacity(config.workers);
    let mut worker_rxs = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        let (tx, rx) = crossbeam_channel::unbounded();
        worker_txs.push(tx);
        worker_rxs.push(rx);
    }

    let acceptor = {
        let ctx = Arc::clone(&ctx);
        let connections_per_worker = config.connections_per_worker;
        let tcp_nodelay = config.tcp_nodelay;
        thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                run_acceptor(listener, worker_txs, connections_per_worker, &ctx, tcp_nodelay);
            })
            .map_err(Error::Io)?
    };

    let mut handles = Vec::with_capacity(config.workers);
    for (worker_id, rx) in worker_rxs.into_iter().enumerate() {
        let config = config.clone();
        let pages = Arc::clone(&pages);
        let ctx = Arc::clone(&ctx);

        let handle = thread::Builder::new()
            .name(format!("worker-{}", worker_id))
            .spawn(move || event_loop::run_worker(worker_id, &config, pages, ctx, rx))
            .map_err(Error::Io)?;
        handles.push(handle);
    }

    // Per-worker failures abort that worker only; the run still reports
    // the work the others completed.
    let mut reports: Vec<WorkerReport> = Vec::with_capacity(config.workers);
    for (worker_id, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => error!(worker = worker_id, error = %e, "worker aborted"),
            Err(_) => error!(worker = worker_id, "worker panicked"),
        }
    }

    let _ = acceptor.join();

    Ok(RunReport::aggregate(reports))
}
