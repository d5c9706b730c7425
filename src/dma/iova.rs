//! Process-wide IOVA allocator.
//!
//! Fixed-size slots of `stride` bytes (2 MiB by default) starting at a
//! constant base (`0xED000000` by default, per spec.md §3). Grounded on the
//! teacher's capacity-bounded allocators (`mem::phys::PHYS_ALLOCATOR`
//! bitmap style) generalized from page-granularity to IOVA-slot
//! granularity; pool size follows spec.md §7's documented 100-slot fixed
//! pool.

use crate::error::{DriverError, Result};

pub const DEFAULT_BASE: u64 = 0xED00_0000;
pub const DEFAULT_STRIDE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_SLOTS: usize = 100;

pub struct IovaAllocator {
    base: u64,
    stride: u64,
    used: Vec<bool>,
}

impl IovaAllocator {
    pub fn new(base: u64, stride: u64, slots: usize) -> Self {
        Self {
            base,
            stride,
            used: vec![false; slots],
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_STRIDE, DEFAULT_SLOTS)
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Reserve one slot for an allocation of `size` bytes. Fails
    /// (panics, matching spec.md §7's documented pool-exhaustion behavior)
    /// if the pool has no free slot, and returns a `Configuration` error if
    /// `size` exceeds the slot stride.
    pub fn get(&mut self, size: usize) -> Result<u64> {
        if size as u64 > self.stride {
            return Err(DriverError::Configuration(
                "requested IOVA allocation exceeds slot stride",
            ));
        }
        let slot = self
            .used
            .iter()
            .position(|used| !*used)
            .unwrap_or_else(|| panic!("IOVA pool exhausted ({} slots)", self.used.len()));
        self.used[slot] = true;
        Ok(self.base + slot as u64 * self.stride)
    }

    pub fn free(&mut self, iova: u64) {
        if iova < self.base {
            return;
        }
        let slot = ((iova - self.base) / self.stride) as usize;
        if let Some(used) = self.used.get_mut(slot) {
            *used = false;
        }
    }

    /// Forget all allocations — used by controller disable.
    pub fn reset(&mut self) {
        self.used.iter_mut().for_each(|u| *u = false);
    }

    pub fn slots_in_use(&self) -> usize {
        self.used.iter().filter(|u| **u).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_free_roundtrip() {
        let mut iova = IovaAllocator::new(0x1000_0000, 0x2000, 4);
        let a = iova.get(0x10).unwrap();
        let b = iova.get(0x10).unwrap();
        assert_ne!(a, b);
        assert_eq!(iova.slots_in_use(), 2);
        iova.free(a);
        assert_eq!(iova.slots_in_use(), 1);
    }

    #[test]
    fn size_over_stride_rejected() {
        let mut iova = IovaAllocator::new(0x1000_0000, 0x1000, 4);
        assert!(matches!(
            iova.get(0x1001),
            Err(DriverError::Configuration(_))
        ));
    }

    #[test]
    fn reset_frees_everything() {
        let mut iova = IovaAllocator::new(0x1000_0000, 0x1000, 2);
        iova.get(1).unwrap();
        iova.get(1).unwrap();
        iova.reset();
        assert_eq!(iova.slots_in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "IOVA pool exhausted")]
    fn pool_exhaustion_panics() {
        let mut iova = IovaAllocator::new(0x1000_0000, 0x1000, 1);
        iova.get(1).unwrap();
        let _ = iova.get(1);
    }
}
