//! Per-connection traffic counters and run reporting.
//!
//! Workers own their counters privately and sample them at least once per
//! wall-clock second into append-only snapshot sequences. The aggregator
//! only reads what the event loop recorded; it never participates in the
//! I/O path. At run end the per-worker reports are summed into one
//! [`RunReport`] and rendered as a delimited text table.

use std::io::{self, Write};
use std::time::Duration;

/// Per-connection byte and request counters.
///
/// `record_*` methods are called by the event loop on completions;
/// [`ConnCounters::tick`] drains the since-last-sample deltas into a
/// snapshot.
#[derive(Debug, Default, Clone)]
pub struct ConnCounters {
    pub requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    last_requests: u64,
    last_bytes_sent: u64,
    last_bytes_received: u64,
}

impl ConnCounters {
    pub fn record_send(&mut self, n: usize) {
        self.bytes_sent += n as u64;
    }

    pub fn record_recv(&mut self, n: usize) {
        self.bytes_received += n as u64;
    }

    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Produce a snapshot for the reporting tick ending now.
    ///
    /// `timestamp` is seconds since the run-start anchor; `interval` is the
    /// seconds elapsed since the previous tick on this worker.
    pub fn tick(&mut self, timestamp: f64, interval: f64) -> MetricsSnapshot {
        let requests_delta = self.requests - self.last_requests;
        let bytes_delta = (self.bytes_sent - self.last_bytes_sent)
            + (self.bytes_received - self.last_bytes_received);

        self.last_requests = self.requests;
        self.last_bytes_sent = self.bytes_sent;
        self.last_bytes_received = self.bytes_received;

        MetricsSnapshot {
            timestamp,
            requests: self.requests,
            request_rate: requests_delta as f64 / interval,
            gbit_per_second: (bytes_delta * 8) as f64 / (interval * 1e9),
        }
    }
}

/// One per-connection sample within a reporting tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Seconds since the run-start anchor. All snapshots taken in one tick
    /// share this value.
    pub timestamp: f64,
    /// Cumulative completed requests.
    pub requests: u64,
    /// Requests per second over the tick interval.
    pub request_rate: f64,
    /// Combined send+receive bit rate over the tick interval.
    pub gbit_per_second: f64,
}

/// Everything one worker produced during its run.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub duration: Duration,
    pub total_requests: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    /// Snapshot sequence per connection index.
    pub snapshots: Vec<Vec<MetricsSnapshot>>,
}

/// Aggregated result of a whole run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub total_requests: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    /// Workers may finish at slightly different times; the run's elapsed
    /// time is the longest worker duration.
    pub elapsed: Duration,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    pub fn aggregate(workers: Vec<WorkerReport>) -> Self {
        let mut report = RunReport::default();
        for worker in &workers {
            report.total_requests += worker.total_requests;
            report.total_bytes_sent += worker.total_bytes_sent;
            report.total_bytes_received += worker.total_bytes_received;
            report.elapsed = report.elapsed.max(worker.duration);
        }
        report.workers = workers;
        report
    }

    pub fn request_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.total_requests as f64 / secs
    }

    pub fn gbit_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        ((self.total_bytes_sent + self.total_bytes_received) * 8) as f64 / (secs * 1e9)
    }
}

/// Destination for the end-of-run report.
pub trait MetricsSink {
    fn write_report(&mut self, report: &RunReport) -> io::Result<()>;
}

/// Renders the report as a delimited text table: one header row, then one
/// row per snapshot.
pub struct TableSink<W: Write> {
    out: W,
}

impl<W: Write> TableSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> MetricsSink for TableSink<W> {
    fn write_report(&mut self, report: &RunReport) -> io::Result<()> {
        writeln!(
            self.out,
            "timestamp,thread_id,connection,requests,throughput,gbit_per_second"
        )?;
        for worker in &report.workers {
            for (conn_index, snapshots) in worker.snapshots.iter().enumerate() {
                for snapshot in snapshots {
                    writeln!(
                        self.out,
                        "{:.3},{},{},{},{:.2},{:.6}",
                        snapshot.timestamp,
                        worker.worker_id,
                        conn_index,
                        snapshot.requests,
                        snapshot.request_rate,
                        snapshot.gbit_per_second,
                    )?;
                }
            }
        }
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_drains_deltas() {
        let mut counters = ConnCounters::default();
        counters.record_recv(8);
        counters.record_send(4108);
        counters.record_request();

        let first = counters.tick(1.0, 1.0);
        assert_eq!(first.requests, 1);
        assert_eq!(first.request_rate, 1.0);
        assert_eq!(first.gbit_per_second, (4116 * 8) as f64 / 1e9);

        // No traffic since the last tick: rates drop to zero, cumulative
        // count stays.
        let second = counters.tick(2.0, 1.0);
        assert_eq!(second.requests, 1);
        assert_eq!(second.request_rate, 0.0);
        assert_eq!(second.gbit_per_second, 0.0);
    }

    #[test]
    fn test_aggregate_sums_totals_and_takes_max_duration() {
        let workers = vec![
            WorkerReport {
                worker_id: 0,
                duration: Duration::from_millis(1500),
                total_requests: 10,
                total_bytes_sent: 1000,
                total_bytes_received: 80,
                snapshots: vec![Vec::new()],
            },
            WorkerReport {
                worker_id: 1,
                duration: Duration::from_millis(2000),
                total_requests: 5,
                total_bytes_sent: 500,
                total_bytes_received: 40,
                snapshots: vec![Vec::new()],
            },
        ];

        let report = RunReport::aggregate(workers);
        assert_eq!(report.total_requests, 15);
        assert_eq!(report.total_bytes_sent, 1500);
        assert_eq!(report.total_bytes_received, 120);
        assert_eq!(report.elapsed, Duration::from_millis(2000));
    }

    #[test]
    fn test_table_sink_format() {
        let mut worker = WorkerReport {
            worker_id: 1,
            duration: Duration::from_secs(2),
            total_requests: 3,
            total_bytes_sent: 300,
            total_bytes_received: 24,
            snapshots: vec![Vec::new(), Vec::new()],
        };
        worker.snapshots[1].push(MetricsSnapshot {
            timestamp: 1.0,
            requests: 3,
            request_rate: 3.0,
            gbit_per_second: 0.000001,
        });
        let report = RunReport::aggregate(vec![worker]);

        let mut buf = Vec::new();
        TableSink::new(&mut buf).write_report(&report).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp,thread_id,connection,requests,throughput,gbit_per_second"
        );
        assert_eq!(lines.next().unwrap(), "1.000,1,1,3,3.00,0.000001");
        assert!(lines.next().is_none());
    }
}
