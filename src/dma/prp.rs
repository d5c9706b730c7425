//! PRP (Physical Region Page) list construction, per spec.md §4.3.
//!
//! Shape selection (one page / two pages / a list page) and the 2 MiB cap
//! are ported from `lone/nvme/spec/prp.py`'s `PRP` class; allocation itself
//! goes through [`HugepageArena`] rather than a direct device call, and the
//! list page is filled via volatile writes the way the teacher's
//! `command::build_prp_contiguous` fills its PRP list page.

use crate::dma::arena::HugepageArena;
use crate::dma::{Direction, MemoryLocation};
use crate::error::{DriverError, Result};

const ENTRY_SIZE: usize = 8;
const MAX_BYTES: usize = 2 * 1024 * 1024;

/// A built (or reconstructed) PRP, holding every page it owns so they can be
/// freed together.
pub struct Prp {
    num_bytes: usize,
    mps: usize,
    prps_per_page: usize,
    pages_needed: usize,
    lists_needed: usize,
    prp1: u64,
    prp2: u64,
    mem_list: Vec<MemoryLocation>,
}

impl Prp {
    /// Compute the shape for a transfer of `num_bytes` at page size `mps`,
    /// without allocating anything yet.
    pub fn new(num_bytes: usize, mps: usize) -> Result<Self> {
        if num_bytes == 0 {
            return Err(DriverError::Configuration("PRP transfer size must be nonzero"));
        }
        if num_bytes > MAX_BYTES {
            return Err(DriverError::Unsupported(
                "PRPs larger than 2 MiB are not supported",
            ));
        }
        let prps_per_page = mps / ENTRY_SIZE - 1;
        let pages_needed = (num_bytes + mps - 1) / mps;
        let lists_needed = if pages_needed > 2 {
            let remaining = pages_needed - 1;
            (remaining + prps_per_page - 1) / prps_per_page
        } else {
            0
        };
        if lists_needed > 1 {
            return Err(DriverError::Unsupported(
                "PRPs requiring more than one list page are not supported",
            ));
        }
        Ok(Self {
            num_bytes,
            mps,
            prps_per_page,
            pages_needed,
            lists_needed,
            prp1: 0,
            prp2: 0,
            mem_list: Vec::new(),
        })
    }

    pub fn prp1(&self) -> u64 {
        self.prp1
    }

    pub fn prp2(&self) -> u64 {
        self.prp2
    }

    pub fn pages_needed(&self) -> usize {
        self.pages_needed
    }

    pub fn lists_needed(&self) -> usize {
        self.lists_needed
    }

    fn malloc_page(
        &mut self,
        arena: &mut HugepageArena,
        direction: Direction,
        tag: &'static str,
    ) -> Result<MemoryLocation> {
        let mem = arena.malloc(self.mps, tag, direction)?;
        self.mem_list.push(mem.clone());
        Ok(mem)
    }

    /// Allocate the pages (and, if needed, the list page) backing this
    /// transfer.
    pub fn alloc(&mut self, arena: &mut HugepageArena, direction: Direction) -> Result<()> {
        if self.pages_needed == 1 {
            let mem = self.malloc_page(arena, direction, "prp1_only")?;
            self.prp1 = mem.iova;
        } else if self.pages_needed == 2 {
            let a = self.malloc_page(arena, direction, "prp1_prp2_1")?;
            self.prp1 = a.iova;
            let b = self.malloc_page(arena, direction, "prp1_prp2_2")?;
            self.prp2 = b.iova;
        } else {
            let head = self.malloc_page(arena, direction, "prp_list_1")?;
            self.prp1 = head.iova;

            let list_page = self.malloc_page(arena, Direction::HostToDevice, "prp_list_2")?;
            self.prp2 = list_page.iova;

            let mut remaining_pages = self.pages_needed - 1;
            for i in 0..self.prps_per_page {
                let seg = self.malloc_page(arena, direction, "prp_list_seg")?;
                unsafe {
                    let entry_ptr = (list_page.vaddr as *mut u64).add(i);
                    std::ptr::write_volatile(entry_ptr, seg.iova);
                }
                remaining_pages -= 1;
                if remaining_pages == 0 {
                    break;
                }
            }
            if remaining_pages != 0 {
                return Err(DriverError::Invariant(
                    "PRP list page could not hold all remaining segments",
                ));
            }
        }
        Ok(())
    }

    /// Reconstruct a `Prp` view over memory the *device* already populated
    /// (e.g. for inspecting a command the simulator completed), from raw
    /// PRP1/PRP2 values and a reader that maps an IOVA back to a host
    /// vaddr. Since this crate's IOVA and vaddr coincide 1:1 in the
    /// simulator, `iova_to_vaddr` is typically the identity function.
    pub fn from_address(
        num_bytes: usize,
        mps: usize,
        prp1_address: u64,
        prp2_address: u64,
        iova_to_vaddr: impl Fn(u64) -> usize,
    ) -> Result<Self> {
        let mut prp = Self::new(num_bytes, mps)?;

        if prp.pages_needed == 1 {
            if prp1_address == 0 {
                return Err(DriverError::Invariant("PRP1 required but absent"));
            }
            prp.prp1 = prp1_address;
            prp.mem_list.push(placeholder(prp1_address, &iova_to_vaddr, mps));
        } else if prp.pages_needed == 2 {
            if prp1_address == 0 || prp2_address == 0 {
                return Err(DriverError::Invariant("PRP1 and PRP2 required but absent"));
            }
            prp.prp1 = prp1_address;
            prp.mem_list.push(placeholder(prp1_address, &iova_to_vaddr, mps));
            prp.prp2 = prp2_address;
            prp.mem_list.push(placeholder(prp2_address, &iova_to_vaddr, mps));
        } else {
            if prp1_address == 0 || prp2_address == 0 {
                return Err(DriverError::Invariant("PRP1 and PRP2 required but absent"));
            }
            prp.prp1 = prp1_address;
            prp.mem_list.push(placeholder(prp1_address, &iova_to_vaddr, mps));
            prp.prp2 = prp2_address;
            let list_mem = placeholder(prp2_address, &iova_to_vaddr, mps);
            let list_vaddr = list_mem.vaddr;
            prp.mem_list.push(list_mem);

            let entries = mps / ENTRY_SIZE;
            for i in 0..entries {
                let entry = unsafe { std::ptr::read_volatile((list_vaddr as *const u64).add(i)) };
                if entry != 0 {
                    prp.mem_list.push(placeholder(entry, &iova_to_vaddr, mps));
                }
            }
        }

        Ok(prp)
    }

    /// The memory segments backing this PRP, in transfer order: PRP1, then
    /// (if present) PRP2 directly, or every list-page entry in order.
    pub fn get_data_segments(&self) -> Vec<&MemoryLocation> {
        let mut segments = Vec::new();
        for page in &self.mem_list {
            if self.prp1 == page.iova {
                segments.push(page);
            }
        }
        if self.pages_needed <= 2 {
            for page in &self.mem_list {
                if self.prp2 != 0 && self.prp2 == page.iova {
                    segments.push(page);
                }
            }
        } else if let Some(list_page) = self.mem_list.iter().find(|p| p.iova == self.prp2) {
            let entries = self.mps / ENTRY_SIZE;
            for i in 0..entries {
                let entry =
                    unsafe { std::ptr::read_volatile((list_page.vaddr as *const u64).add(i)) };
                if entry == 0 {
                    continue;
                }
                if let Some(seg) = self.mem_list.iter().find(|p| p.iova == entry) {
                    segments.push(seg);
                }
            }
        }
        segments
    }

    pub fn get_data_buffer(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.num_bytes);
        for segment in self.get_data_segments() {
            let take = std::cmp::min(segment.size, self.num_bytes - data.len());
            let slice = unsafe { std::slice::from_raw_parts(segment.vaddr as *const u8, take) };
            data.extend_from_slice(slice);
            if data.len() >= self.num_bytes {
                break;
            }
        }
        data
    }

    pub fn set_data_buffer(&self, data: &[u8]) {
        let mut offset = 0;
        for segment in self.get_data_segments() {
            if offset >= data.len() {
                break;
            }
            let end = std::cmp::min(offset + segment.size, data.len());
            let len = end - offset;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data[offset..end].as_ptr(),
                    segment.vaddr as *mut u8,
                    len,
                );
            }
            offset = end;
        }
    }

    /// Release every page this PRP allocated.
    pub fn free_all_memory(&mut self, arena: &mut HugepageArena) {
        for mem in self.mem_list.drain(..) {
            arena.free(&mem);
        }
    }
}

fn placeholder(iova: u64, iova_to_vaddr: &impl Fn(u64) -> usize, mps: usize) -> MemoryLocation {
    MemoryLocation {
        vaddr: iova_to_vaddr(iova),
        iova,
        size: mps,
        client_tag: "prp.from_address",
        in_use: true,
        linked_pages: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::arena::ArenaConfig;
    use crate::dma::identity_gateway;

    fn arena() -> HugepageArena {
        HugepageArena::new(
            ArenaConfig {
                page_size: 4096,
                hugepage_size: 4096 * 8,
            },
            identity_gateway(),
        )
        .unwrap()
    }

    #[test]
    fn single_page_shape() {
        let prp = Prp::new(100, 4096).unwrap();
        assert_eq!(prp.pages_needed(), 1);
        assert_eq!(prp.lists_needed(), 0);
    }

    #[test]
    fn two_page_shape() {
        let prp = Prp::new(4096 + 1, 4096).unwrap();
        assert_eq!(prp.pages_needed(), 2);
        assert_eq!(prp.lists_needed(), 0);
    }

    #[test]
    fn list_page_shape() {
        let prp = Prp::new(4096 * 3, 4096).unwrap();
        assert_eq!(prp.pages_needed(), 3);
        assert_eq!(prp.lists_needed(), 1);
    }

    #[test]
    fn over_cap_rejected() {
        assert!(Prp::new(MAX_BYTES + 1, 4096).is_err());
    }

    #[test]
    fn single_page_roundtrip_data() {
        let mut a = arena();
        let mut prp = Prp::new(10, 4096).unwrap();
        prp.alloc(&mut a, Direction::Bidirectional).unwrap();
        prp.set_data_buffer(&[1, 2, 3, 4, 5]);
        let data = prp.get_data_buffer();
        assert_eq!(&data[..5], &[1, 2, 3, 4, 5]);
        prp.free_all_memory(&mut a);
    }

    #[test]
    fn multi_page_roundtrip_via_list() {
        let mut a = arena();
        let size = 4096 * 3 + 100;
        let mut prp = Prp::new(size, 4096).unwrap();
        prp.alloc(&mut a, Direction::Bidirectional).unwrap();
        let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        prp.set_data_buffer(&payload);
        let data = prp.get_data_buffer();
        assert_eq!(data, payload);
        prp.free_all_memory(&mut a);
    }
}
