//! Per-worker pinned buffer pools.
//!
//! Buffers are allocated once at worker startup: page-aligned, grouped into
//! fixed size classes, optionally locked in physical memory and registered
//! with the kernel as a single batch so operations can reference them by
//! fixed index instead of copying. The pool is private to one worker; no
//! synchronization happens on the checkout path.
//!
//! Checkout scans each class with a round-robin cursor rather than a LIFO
//! free list, which bounds worst-case checkout latency by the class
//! capacity and spreads reuse evenly across the class.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::Error;

/// Alignment for every pool buffer.
const BUFFER_ALIGN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufState {
    Free,
    CheckedOut,
}

struct RawBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

struct ClassPool {
    size: usize,
    bufs: Vec<RawBuf>,
    states: Vec<BufState>,
    /// Next scan position; advanced past each checkout.
    cursor: usize,
    checked_out: usize,
    /// Index of this class's first buffer in the registration batch.
    fixed_base: u32,
}

/// A checked-out buffer, identified by its size class and index.
///
/// The holder owns the buffer's contents until it is checked back in;
/// checking in exactly once per checkout is the caller's responsibility.
#[derive(Debug, Clone, Copy)]
pub struct BufHandle {
    pub size: usize,
    pub index: u32,
}

/// Fixed set of size-classed buffers owned by one worker.
pub struct BufferPool {
    classes: Vec<ClassPool>,
    pinned: bool,
    registered: bool,
}

impl BufferPool {
    /// Allocate `capacity` aligned buffers for each requested size class,
    /// locking them in physical memory when `pin` is set.
    ///
    /// Any allocation or pinning failure is returned as an error; buffers
    /// allocated before the failure are released by `Drop`.
    pub fn new(class_sizes: &[usize], capacity: usize, pin: bool) -> Result<Self, Error> {
        let mut pool = Self {
            classes: Vec::with_capacity(class_sizes.len()),
            pinned: pin,
            registered: false,
        };

        for &size in class_sizes {
            if size == 0 {
                return Err(Error::BufferPool("zero-sized buffer class".into()));
            }
            if pool.classes.iter().any(|c| c.size == size) {
                return Err(Error::BufferPool(format!("duplicate buffer class {size}")));
            }

            let layout = Layout::from_size_align(size, BUFFER_ALIGN)
                .map_err(|e| Error::BufferPool(format!("bad layout for class {size}: {e}")))?;

            let mut class = ClassPool {
                size,
                bufs: Vec::with_capacity(capacity),
                states: vec![BufState::Free; capacity],
                cursor: 0,
                checked_out: 0,
                fixed_base: 0,
            };

            for _ in 0..capacity {
                let ptr = unsafe { alloc_zeroed(layout) };
                let Some(ptr) = NonNull::new(ptr) else {
                    pool.classes.push(class);
                    return Err(Error::BufferPool(format!(
                        "failed to allocate {size}-byte buffer"
                    )));
                };
                class.bufs.push(RawBuf { ptr, layout });

                if pin {
                    let ret = unsafe { libc::mlock(ptr.as_ptr() as *const libc::c_void, size) };
                    if ret != 0 {
                        pool.classes.push(class);
                        return Err(Error::BufferPool(format!(
                            "failed to pin {size}-byte buffer: {}",
                            std::io::Error::last_os_error()
                        )));
                    }
                }
            }

            pool.classes.push(class);
        }

        Ok(pool)
    }

    fn class(&self, size: usize) -> Option<&ClassPool> {
        self.classes.iter().find(|c| c.size == size)
    }

    fn class_mut(&mut self, size: usize) -> Option<&mut ClassPool> {
        self.classes.iter_mut().find(|c| c.size == size)
    }

    /// Check out a free buffer of the given size class.
    ///
    /// Returns `None` when the class is unknown or every buffer of it is
    /// checked out — callers treat this as backpressure, not a crash.
    pub fn check_out(&mut self, size: usize) -> Option<BufHandle> {
        let class = self.class_mut(size)?;
        let capacity = class.states.len();
        for i in 0..capacity {
            let index = (class.cursor + i) % capacity;
            if class.states[index] == BufState::Free {
                class.states[index] = BufState::CheckedOut;
                class.cursor = (index + 1) % capacity;
                class.checked_out += 1;
                return Some(BufHandle {
                    size,
                    index: index as u32,
                });
            }
        }
        None
    }

    /// Return a buffer to its class. No-op on an unknown class.
    pub fn check_in(&mut self, size: usize, index: u32) {
        if let Some(class) = self.class_mut(size) {
            let index = index as usize;
            debug_assert!(
                class.states[index] == BufState::CheckedOut,
                "double check-in of buffer {index} in class {size}"
            );
            if class.states[index] == BufState::CheckedOut {
                class.states[index] = BufState::Free;
                class.checked_out -= 1;
            }
        }
    }

    /// Buffer contents by (class, index).
    ///
    /// # Panics
    /// Panics if the class or index is unknown.
    pub fn slice(&self, size: usize, index: u32) -> &[u8] {
        let class = self.class(size).expect("unknown buffer class");
        let buf = &class.bufs[index as usize];
        unsafe { std::slice::from_raw_parts(buf.ptr.as_ptr(), class.size) }
    }

    /// Mutable buffer contents by (class, index).
    ///
    /// # Panics
    /// Panics if the class or index is unknown.
    pub fn slice_mut(&mut self, size: usize, index: u32) -> &mut [u8] {
        let class = self.class(size).expect("unknown buffer class");
        let buf = &class.bufs[index as usize];
        unsafe { std::slice::from_raw_parts_mut(buf.ptr.as_ptr(), class.size) }
    }

    /// Raw pointer for submission entries.
    ///
    /// # Panics
    /// Panics if the class or index is unknown.
    pub fn ptr(&self, size: usize, index: u32) -> *mut u8 {
        let class = self.class(size).expect("unknown buffer class");
        class.bufs[index as usize].ptr.as_ptr()
    }

    /// Number of buffers of a class currently checked out.
    pub fn checked_out(&self, size: usize) -> usize {
        self.class(size).map_or(0, |c| c.checked_out)
    }

    /// Capacity of a size class.
    pub fn capacity(&self, size: usize) -> usize {
        self.class(size).map_or(0, |c| c.bufs.len())
    }

    /// A buffer's index in the registration batch, if registered.
    pub fn fixed_index(&self, size: usize, index: u32) -> Option<u16> {
        if !self.registered {
            return None;
        }
        self.class(size).map(|c| (c.fixed_base + index) as u16)
    }

    /// Register every buffer of every class with the ring as one batch.
    ///
    /// Records per-class base offsets so operations can reference buffers
    /// by fixed index. Failure is fatal at startup.
    #[cfg(target_os = "linux")]
    pub fn register(&mut self, submitter: &io_uring::Submitter<'_>) -> Result<(), Error> {
        let total: usize = self.classes.iter().map(|c| c.bufs.len()).sum();
        if total > u16::MAX as usize {
            return Err(Error::BufferPool(format!(
                "{total} buffers exceed the fixed-index range"
            )));
        }

        let mut iovecs = Vec::with_capacity(total);
        let mut base = 0u32;
        for class in &mut self.classes {
            class.fixed_base = base;
            base += class.bufs.len() as u32;
            for buf in &class.bufs {
                iovecs.push(libc::iovec {
                    iov_base: buf.ptr.as_ptr() as *mut libc::c_void,
                    iov_len: class.size,
                });
            }
        }

        unsafe { submitter.register_buffers(&iovecs) }
            .map_err(|e| Error::BufferPool(format!("registration failed: {e}")))?;
        self.registered = true;
        Ok(())
    }

    /// Drop the kernel's view of the buffers. The ring teardown also
    /// releases registrations, so this is only needed for orderly shutdown
    /// while the ring stays alive.
    #[cfg(target_os = "linux")]
    pub fn unregister(&mut self, submitter: &io_uring::Submitter<'_>) -> Result<(), Error> {
        if self.registered {
            submitter
                .unregister_buffers()
                .map_err(|e| Error::BufferPool(format!("unregistration failed: {e}")))?;
            self.registered = false;
        }
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for class in &self.classes {
            for buf in &class.bufs {
                unsafe {
                    if self.pinned {
                        libc::munlock(buf.ptr.as_ptr() as *const libc::c_void, class.size);
                    }
                    dealloc(buf.ptr.as_ptr(), buf.layout);
                }
            }
        }
    }
}
