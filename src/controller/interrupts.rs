//! Interrupt mode bookkeeping: polling, or MSI-X vector counters.
//!
//! There is no real interrupt controller to program here (this is a
//! userspace VFIO-style driver; the host glue that would `eventfd`-wire a
//! real MSI-X vector is out of scope). What this module keeps is the
//! per-vector pending-completion counters spec.md §4.6 describes scanning,
//! modeled the way the teacher tracks simple atomic counters for its
//! interrupt-adjacent bookkeeping (`mem::phys`'s allocator uses the same
//! `AtomicU64`-per-slot shape).

use crate::error::{DriverError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    Polling,
    MsiX,
}

/// One event counter per armed MSI-X vector, plus the CQID each vector is
/// bound to once a completion queue is created against it.
pub struct InterruptTable {
    mode: InterruptMode,
    counters: Vec<AtomicU64>,
    start: usize,
    vector_of_cqid: Vec<(u16, usize)>,
}

impl InterruptTable {
    pub fn polling() -> Self {
        Self {
            mode: InterruptMode::Polling,
            counters: Vec::new(),
            start: 0,
            vector_of_cqid: Vec::new(),
        }
    }

    /// `init_msix_interrupts(num_vectors, start)`.
    pub fn msix(num_vectors: usize, start: usize) -> Self {
        Self {
            mode: InterruptMode::MsiX,
            counters: (0..num_vectors).map(|_| AtomicU64::new(0)).collect(),
            start,
            vector_of_cqid: Vec::new(),
        }
    }

    pub fn mode(&self) -> InterruptMode {
        self.mode
    }

    pub fn vector_count(&self) -> usize {
        self.counters.len()
    }

    /// Bind `cqid` to vector `iv` (index relative to `start`). In polling
    /// mode `iv` is forced to 0 by the caller before this is reached.
    pub fn bind(&mut self, cqid: u16, iv: usize) -> Result<()> {
        if self.mode == InterruptMode::MsiX && iv >= self.counters.len() {
            return Err(DriverError::Configuration(
                "interrupt vector index exceeds the armed vector count",
            ));
        }
        self.vector_of_cqid.push((cqid, iv));
        Ok(())
    }

    pub fn vector_for_cqid(&self, cqid: u16) -> Option<usize> {
        self.vector_of_cqid
            .iter()
            .find(|(id, _)| *id == cqid)
            .map(|(_, v)| self.start + v)
    }

    /// Device side: bump the counter for `vector` (a completion was
    /// posted).
    pub fn signal(&self, vector: usize) {
        if let Some(counter) = self.counters.get(vector.saturating_sub(self.start)) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Host side: read and clear the pending count for `vector`.
    pub fn drain_pending(&self, vector: usize) -> u64 {
        self.counters
            .get(vector.saturating_sub(self.start))
            .map(|counter| counter.swap(0, Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_mode_has_no_vectors() {
        let table = InterruptTable::polling();
        assert_eq!(table.vector_count(), 0);
    }

    #[test]
    fn msix_bind_rejects_out_of_range_vector() {
        let mut table = InterruptTable::msix(2, 0);
        assert!(table.bind(1, 5).is_err());
        assert!(table.bind(1, 1).is_ok());
    }

    #[test]
    fn signal_then_drain_roundtrip() {
        let table = InterruptTable::msix(2, 3);
        table.signal(3);
        table.signal(3);
        assert_eq!(table.drain_pending(3), 2);
        assert_eq!(table.drain_pending(3), 0);
    }

    #[test]
    fn vector_for_cqid_includes_start_offset() {
        let mut table = InterruptTable::msix(4, 10);
        table.bind(7, 2).unwrap();
        assert_eq!(table.vector_for_cqid(7), Some(12));
    }
}
