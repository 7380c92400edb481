//! pagering: an io_uring page-serving engine.
//!
//! Workers own private completion queues and pre-pinned buffer pools;
//! an acceptor thread distributes connections round-robin. At run end a
//! delimited metrics table is written with one row per per-second,
//! per-connection snapshot.

use std::fs::File;
use std::io;
use std::path::PathBuf;

use pagering::config::Config;
use pagering::metrics::{MetricsSink, RunReport, TableSink};
use pagering::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        connections_per_worker = config.connections_per_worker,
        queue_depth = config.queue_depth,
        page_size = config.page_size,
        page_count = config.page_count,
        inflight = config.inflight_ops,
        mode = ?config.mode,
        pin = config.pin_memory,
        register = config.register_buffers,
        duration_secs = config.run_duration.as_secs(),
        "starting pagering"
    );

    let report = runtime::run(&config)?;

    info!(
        requests = report.total_requests,
        bytes_sent = report.total_bytes_sent,
        bytes_received = report.total_bytes_received,
        secs = report.elapsed.as_secs_f64(),
        request_rate = report.request_rate(),
        gbit_per_second = report.gbit_per_second(),
        "run complete"
    );

    write_report(&config, &report)?;

    Ok(())
}

/// Write the metrics table to the configured sink: "-" for stdout,
/// otherwise a file path, defaulting to a timestamped name.
fn write_report(config: &Config, report: &RunReport) -> io::Result<()> {
    let path = config.metrics_out.clone().unwrap_or_else(|| {
        PathBuf::from(format!(
            "report_server_{}.csv",
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
        ))
    });

    if path.as_os_str() == "-" {
        let stdout = io::stdout();
        TableSink::new(stdout.lock()).write_report(report)?;
    } else {
        let file = File::create(&path)?;
        let mut sink = TableSink::new(io::BufWriter::new(file));
        sink.write_report(report)?;
        info!(path = %path.display(), "metrics report written");
    }

    Ok(())
}
