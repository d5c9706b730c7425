//! DMA memory subsystem: hugepage arena, IOVA allocation, and
//! direction-tagged IOMMU mappings.
//!
//! Grounded on the teacher's `mem::dma::DmaBuf` (phys-addr-backed buffer
//! with `flush_cache`/`invalidate_cache` direction hints) generalized to a
//! host/device IOVA split — the teacher runs in ring 0 with an identity or
//! HHDM mapping, so it never needed a separate `vaddr`/`iova` pair; a
//! userspace VFIO driver does, because the IOMMU remaps whatever `vaddr`
//! the arena allocated to a device-visible `iova` the arena does not
//! control directly (that mapping is the `DmaGateway` trait below, the
//! seam the out-of-scope VFIO container implements).

pub mod arena;
pub mod iova;
pub mod prp;

use std::sync::Arc;

/// Direction of a DMA mapping, matching spec.md §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device reads; host writes before the device consumes it.
    HostToDevice,
    /// Device writes; host reads after the device produces it.
    DeviceToHost,
    /// Device may read and write.
    Bidirectional,
}

/// A DMA buffer descriptor: `{vaddr, iova, size, client_tag, in_use,
/// linked_pages}` from spec.md §3.
#[derive(Debug, Clone)]
pub struct MemoryLocation {
    pub vaddr: usize,
    pub iova: u64,
    pub size: usize,
    pub client_tag: &'static str,
    pub in_use: bool,
    /// Additional pages stitched onto this allocation, enumerated as
    /// `(vaddr, iova)` pairs, for allocations spanning more than one arena
    /// page.
    pub linked_pages: Vec<(usize, u64)>,
}

impl MemoryLocation {
    /// All `(vaddr, iova)` pairs this location covers, head page first.
    pub fn pages(&self) -> Vec<(usize, u64)> {
        let mut all = vec![(self.vaddr, self.iova)];
        all.extend(self.linked_pages.iter().copied());
        all
    }

    pub fn total_size(&self, page_size: usize) -> usize {
        page_size * self.pages().len()
    }
}

/// The seam to the host IOMMU container (VFIO-style). Out of scope to
/// implement for real here (that's host glue); the arena only needs
/// `map`/`unmap` to exist.
pub trait DmaGateway: Send + Sync {
    /// Map `size` bytes at host `vaddr` for DMA at `iova`, in the given
    /// direction. Must be called before the device can touch the memory.
    fn map(&self, vaddr: usize, iova: u64, size: usize, direction: Direction);

    /// Reverse a previous `map`.
    fn unmap(&self, iova: u64, size: usize);
}

/// In-process stand-in gateway used by the simulator and tests: since both
/// sides live in the same address space there, `iova == vaddr` and
/// map/unmap are no-ops beyond bookkeeping direction for assertions.
#[derive(Default)]
pub struct IdentityDmaGateway;

impl DmaGateway for IdentityDmaGateway {
    fn map(&self, _vaddr: usize, _iova: u64, _size: usize, _direction: Direction) {}
    fn unmap(&self, _iova: u64, _size: usize) {}
}

pub fn identity_gateway() -> Arc<dyn DmaGateway> {
    Arc::new(IdentityDmaGateway)
}
