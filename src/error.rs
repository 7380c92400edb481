use std::io;

use thiserror::Error;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the kernel or socket layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Completion queue setup failed (e.g., unsupported kernel features).
    #[error("ring setup: {0}")]
    RingSetup(String),
    /// Buffer allocation, pinning, or kernel registration failed.
    #[error("buffer pool: {0}")]
    BufferPool(String),
    /// Configuration rejected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// io_uring is only available on Linux.
    #[error("unsupported platform: io_uring requires Linux")]
    Unsupported,
}
