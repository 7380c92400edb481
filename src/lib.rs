//! pagering: a page-serving network engine built on io_uring.
//!
//! The server hands out fixed-size synthetic pages to connected clients.
//! Each worker thread owns a private completion queue and a pool of
//! pre-pinned, size-classed buffers that can be registered with the kernel
//! for zero-copy operation. An acceptor thread distributes connections to
//! workers round-robin; workers drive a small request/response protocol
//! entirely through completion events.
//!
//! Two operating modes:
//! - Full-duplex page protocol: clients request numbered pages and receive
//!   fixed-length responses.
//! - Half-duplex broadcast: workers stream fixed payloads for raw
//!   throughput measurement.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pages;
pub mod protocol;
pub mod runtime;

pub use config::Config;
pub use error::Error;
