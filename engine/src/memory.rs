//! C1 Memory Accountant — spec §4.1.

use crate::error::EngineError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks allocation/release against a fixed ceiling.
///
/// QuickJS enforces its own heap ceiling via
/// `rquickjs::Runtime::set_memory_limit`; this accountant is the
/// engine-facing wrapper so the rest of the code (and tests) can reason about
/// memory usage independent of the embedded script engine, and so bridge
/// bindings that copy bytes into the sandbox (fetch responses, decrypted
/// secrets) can be charged explicitly, since those allocations happen before
/// the bytes ever reach a QuickJS value.
#[derive(Clone)]
pub struct MemoryAccountant {
    used: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    limit: usize,
}

impl MemoryAccountant {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            used: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            limit: limit_bytes,
        }
    }

    /// Reserve `n` bytes against the ceiling. Never partially succeeds.
    pub fn allocate(&self, n: usize) -> Result<(), EngineError> {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let next = current.saturating_add(n);
            if next > self.limit {
                return Err(EngineError::MemoryExceeded {
                    used: current,
                    limit: self.limit,
                });
            }
            if self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.peak.fetch_max(next, Ordering::AcqRel);
                return Ok(());
            }
        }
    }

    /// Highest `used` value observed since construction, spec §3
    /// `peak_memory_bytes`.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Release `n` bytes, saturating at zero (never goes negative).
    pub fn release(&self, n: usize) {
        let mut current = self.used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(n);
            match self
                .used
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn current(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}
