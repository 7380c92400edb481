#![cfg(target_os = "linux")]
//! Integration tests: page protocol over real TCP connections.
//!
//! Each test launches the engine with a scaled-down configuration, drives
//! it with std TCP clients, and checks the aggregated run report. Pinning
//! and registration are off so the tests need no extra privileges.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use pagering::config::{Config, Mode};
use pagering::metrics::RunReport;
use pagering::pages::{FillPattern, PageStore};
use pagering::protocol::{
    PageRequest, ResponseHeader, RESPONSE_HEADER_LEN, STATUS_INVALID_PAGE, STATUS_OK,
};
use pagering::runtime;

const PAGE_SIZE: usize = 4096;
const PAGE_COUNT: usize = 64;

fn test_config(port: u16, workers: usize, connections_per_worker: usize, secs: u64) -> Config {
    Config {
        listen: format!("127.0.0.1:{port}"),
        workers,
        connections_per_worker,
        queue_depth: 64,
        page_size: PAGE_SIZE,
        page_count: PAGE_COUNT,
        inflight_ops: 32,
        mode: Mode::FullDuplex,
        pin_memory: false,
        register_buffers: false,
        run_duration: Duration::from_secs(secs),
        tcp_nodelay: true,
        metrics_out: None,
        log_level: "warn".into(),
    }
}

/// Find an available port by binding to :0.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn start_server(config: Config) -> thread::JoinHandle<Result<RunReport, pagering::Error>> {
    thread::spawn(move || runtime::run(&config))
}

/// Connect with retries while the server is still binding. The connection
/// counts toward the worker quota, so there is no separate probe.
fn connect(port: u16) -> TcpStream {
    let addr = format!("127.0.0.1:{port}");
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(&addr) {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            return stream;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

/// One synchronous request/response round trip.
fn request_page(
    stream: &mut TcpStream,
    request_id: u32,
    page_number: u32,
) -> std::io::Result<(ResponseHeader, Vec<u8>)> {
    let mut wire = [0u8; 8];
    PageRequest {
        request_id,
        page_number,
    }
    .encode(&mut wire);
    stream.write_all(&wire)?;

    let mut response = vec![0u8; RESPONSE_HEADER_LEN + PAGE_SIZE];
    stream.read_exact(&mut response)?;
    let header = ResponseHeader::decode(&response).unwrap();
    Ok((header, response[RESPONSE_HEADER_LEN..].to_vec()))
}

#[test]
fn test_page_round_trip() {
    let port = free_port();
    let server = start_server(test_config(port, 1, 1, 5));

    let mut stream = connect(port);
    let (header, payload) = request_page(&mut stream, 1, 5).unwrap();

    assert_eq!(header.request_id, 1);
    assert_eq!(header.status, STATUS_OK);
    assert_eq!(header.page_number, 5);

    // The payload must match the canonical fill for page 5.
    let pages = PageStore::new(PAGE_COUNT, PAGE_SIZE, FillPattern::default());
    assert_eq!(payload.len(), PAGE_SIZE);
    assert!(pages.verify(&payload, 5));

    drop(stream);
    let report = server.join().unwrap().unwrap();
    assert!(report.total_requests >= 1);
}

#[test]
fn test_invalid_page_keeps_connection_usable() {
    let port = free_port();
    let server = start_server(test_config(port, 1, 1, 5));

    let mut stream = connect(port);

    // Out-of-range page: error status, but the response is still the full
    // fixed length so the parse stays aligned.
    let (header, payload) = request_page(&mut stream, 7, 2000).unwrap();
    assert_eq!(header.request_id, 7);
    assert_eq!(header.status, STATUS_INVALID_PAGE);
    assert_eq!(header.page_number, 2000);
    assert_eq!(payload.len(), PAGE_SIZE);
    assert!(payload.iter().all(|&b| b == 0xFA));

    // The connection survives the protocol error.
    let (header, payload) = request_page(&mut stream, 8, 3).unwrap();
    assert_eq!(header.status, STATUS_OK);
    let pages = PageStore::new(PAGE_COUNT, PAGE_SIZE, FillPattern::default());
    assert!(pages.verify(&payload, 3));

    drop(stream);
    let report = server.join().unwrap().unwrap();
    assert_eq!(report.total_requests, 2);
}

#[test]
fn test_partial_request_then_disconnect() {
    let port = free_port();
    let server = start_server(test_config(port, 1, 1, 5));

    let mut stream = connect(port);
    // Fewer bytes than the fixed request record.
    stream.write_all(&[0x01, 0x02, 0x03]).unwrap();
    stream.flush().unwrap();
    drop(stream);

    // The server observes the zero-length completion and closes cleanly;
    // with its only connection gone the run ends early.
    let report = server.join().unwrap().unwrap();
    assert_eq!(report.total_requests, 0);
}

#[test]
fn test_half_duplex_broadcast() {
    let port = free_port();
    let mut config = test_config(port, 1, 1, 2);
    config.mode = Mode::HalfDuplex;
    let server = start_server(config);

    // Broadcast mode: the server streams fixed payloads without waiting
    // for requests; the client just drains.
    let mut stream = connect(port);
    let start = Instant::now();
    let mut received = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    while start.elapsed() < Duration::from_secs(4) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received += n as u64,
            Err(_) => break,
        }
    }
    assert!(received > 0);
    drop(stream);

    let report = server.join().unwrap().unwrap();
    assert!(report.total_requests > 0);
    // The client can never have read more than the server accounted for.
    assert!(report.total_bytes_sent >= received);
}

#[test]
fn test_two_workers_metrics_and_totals() {
    let port = free_port();
    let secs = 3u64;
    let server = start_server(test_config(port, 2, 2, secs));

    let mut clients = Vec::new();
    for client_id in 0..4u32 {
        clients.push(thread::spawn(move || {
            let mut stream = connect(port);
            let start = Instant::now();
            let mut responses = 0u64;
            let mut request_id = client_id << 16;

            while start.elapsed() < Duration::from_secs(secs + 1) {
                request_id += 1;
                match request_page(&mut stream, request_id, request_id % PAGE_COUNT as u32) {
                    Ok((header, _)) => {
                        assert_eq!(header.status, STATUS_OK);
                        responses += 1;
                    }
                    // Run over: server stopped responding or closed.
                    Err(_) => break,
                }
            }
            responses
        }));
    }

    let client_responses: u64 = clients.into_iter().map(|c| c.join().unwrap()).sum();
    assert!(client_responses > 0);

    let report = server.join().unwrap().unwrap();
    assert_eq!(report.workers.len(), 2);

    // Aggregate totals are exactly the sum of the per-worker totals.
    let summed_requests: u64 = report.workers.iter().map(|w| w.total_requests).sum();
    let summed_sent: u64 = report.workers.iter().map(|w| w.total_bytes_sent).sum();
    let summed_received: u64 = report.workers.iter().map(|w| w.total_bytes_received).sum();
    assert_eq!(report.total_requests, summed_requests);
    assert_eq!(report.total_bytes_sent, summed_sent);
    assert_eq!(report.total_bytes_received, summed_received);

    // Every connection saw sustained traffic, so every connection must
    // have at least one snapshot per elapsed second (minus the last,
    // possibly partial, tick).
    for worker in &report.workers {
        let live: Vec<_> = worker
            .snapshots
            .iter()
            .filter(|snaps| !snaps.is_empty())
            .collect();
        assert_eq!(live.len(), 2, "worker {} connections", worker.worker_id);
        for snapshots in live {
            assert!(snapshots.len() as u64 >= secs - 1);
            // Snapshots within one tick share a timestamp; across ticks
            // they are strictly ordered.
            for pair in snapshots.windows(2) {
                assert!(pair[1].timestamp > pair[0].timestamp);
            }
        }
    }

    // Each 200-status response pairs with one counted request; clients may
    // have a final response cut off by the deadline, never the reverse.
    assert!(report.total_requests >= client_responses);
}
