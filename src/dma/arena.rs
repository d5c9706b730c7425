//! Hugepage-backed arena: a bitmap of fixed-size pages, grown one hugepage
//! at a time, handing out contiguous runs for allocations bigger than one
//! page.
//!
//! Grounded on `lone/system/linux/hugepages_mgr.py`'s `malloc`/
//! `malloc_pages`/`free` (original_source), reimplemented in the teacher's
//! idiom — a `Vec`-backed free/used bitmap like `mem::phys`'s physical
//! allocator, rather than a Python list of `MemoryLocation` objects scanned
//! on every call. One real hugepage-sized `mmap` (via `libc`, `MAP_HUGETLB`)
//! backs each growth step; see `valopok-vroom`'s `std` PCI/mmap resource
//! opening for the idiomatic `libc::mmap` call shape this follows.

use super::iova::IovaAllocator;
use super::{Direction, DmaGateway, MemoryLocation};
use crate::error::{DriverError, Result};
use std::sync::Arc;

pub const DEFAULT_HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

struct Hugepage {
    vaddr: usize,
    size: usize,
}

impl Drop for Hugepage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.vaddr as *mut libc::c_void, self.size);
        }
    }
}

struct Page {
    vaddr: usize,
    iova: u64,
    in_use: bool,
}

pub struct ArenaConfig {
    pub page_size: usize,
    pub hugepage_size: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            hugepage_size: DEFAULT_HUGEPAGE_SIZE,
        }
    }
}

pub struct HugepageArena {
    config: ArenaConfig,
    hugepages: Vec<Hugepage>,
    pages: Vec<Page>,
    iova: IovaAllocator,
    gateway: Arc<dyn DmaGateway>,
}

impl HugepageArena {
    pub fn new(config: ArenaConfig, gateway: Arc<dyn DmaGateway>) -> Result<Self> {
        let mut arena = Self {
            config,
            hugepages: Vec::new(),
            pages: Vec::new(),
            iova: IovaAllocator::with_defaults(),
            gateway,
        };
        arena.grow(1)?;
        Ok(arena)
    }

    fn grow(&mut self, num_hugepages: usize) -> Result<()> {
        for _ in 0..num_hugepages {
            let hp = map_hugepage(self.config.hugepage_size)?;
            let page_size = self.config.page_size;
            let num_pages = hp.size / page_size;
            for idx in 0..num_pages {
                self.pages.push(Page {
                    vaddr: hp.vaddr + idx * page_size,
                    iova: 0,
                    in_use: false,
                });
            }
            self.hugepages.push(hp);
        }
        Ok(())
    }

    fn free_page_count(&self) -> usize {
        self.pages.iter().filter(|p| !p.in_use).count()
    }

    fn find_contiguous_free_run(&self, n: usize) -> Option<usize> {
        let page_size = self.config.page_size;
        let free_indices: Vec<usize> = self
            .pages
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.in_use)
            .map(|(i, _)| i)
            .collect();
        'outer: for window in free_indices.windows(n) {
            for pair in window.windows(2) {
                let (a, b) = (pair[0], pair[1]);
                if self.pages[a].vaddr + page_size != self.pages[b].vaddr {
                    continue 'outer;
                }
            }
            return Some(window[0]);
        }
        None
    }

    /// `malloc(size, tag)`: allocate a contiguous run of pages covering
    /// `size` bytes, growing the arena by one hugepage and retrying if no
    /// contiguous run is currently free.
    pub fn malloc(
        &mut self,
        size: usize,
        tag: &'static str,
        direction: Direction,
    ) -> Result<MemoryLocation> {
        if size == 0 {
            return Err(DriverError::Configuration("malloc size must be nonzero"));
        }
        let page_size = self.config.page_size;
        let pages_needed = std::cmp::max(1, (size + page_size - 1) / page_size);

        let start = loop {
            if let Some(start) = self.find_contiguous_free_run(pages_needed) {
                break start;
            }
            if self.free_page_count() >= pages_needed {
                // Enough free pages exist overall, but none are contiguous —
                // growing won't help; this is the arena's documented
                // out-of-memory condition distinct from "needs another
                // hugepage".
                return Err(DriverError::OutOfMemory(
                    "no contiguous run of free pages satisfies this allocation",
                ));
            }
            self.grow(1)?;
        };

        let iova = self.iova.get(size)?;
        for offset in 0..pages_needed {
            self.pages[start + offset].in_use = true;
            self.pages[start + offset].iova = iova + (offset * page_size) as u64;
        }
        let head = &self.pages[start];
        self.gateway.map(head.vaddr, iova, size, direction);

        let linked_pages = (1..pages_needed)
            .map(|i| {
                let p = &self.pages[start + i];
                (p.vaddr, p.iova)
            })
            .collect();

        Ok(MemoryLocation {
            vaddr: head.vaddr,
            iova,
            size,
            client_tag: tag,
            in_use: true,
            linked_pages,
        })
    }

    /// `malloc_pages(n, tag)`: return `n` free pages without a contiguity
    /// requirement.
    pub fn malloc_pages(&mut self, n: usize, tag: &'static str) -> Result<Vec<MemoryLocation>> {
        while self.free_page_count() < n {
            self.grow(1)?;
        }
        let mut out = Vec::with_capacity(n);
        let mut taken = 0;
        for page in self.pages.iter_mut() {
            if taken == n {
                break;
            }
            if !page.in_use {
                page.in_use = true;
                taken += 1;
                out.push(MemoryLocation {
                    vaddr: page.vaddr,
                    iova: 0,
                    size: self.config.page_size,
                    client_tag: tag,
                    in_use: true,
                    linked_pages: Vec::new(),
                });
            }
        }
        Ok(out)
    }

    /// Release `loc` and every page it links, zeroing their memory first.
    pub fn free(&mut self, loc: &MemoryLocation) {
        self.gateway.unmap(loc.iova, loc.size);
        for (vaddr, _) in loc.pages() {
            unsafe {
                std::ptr::write_bytes(vaddr as *mut u8, 0, self.config.page_size);
            }
            if let Some(page) = self.pages.iter_mut().find(|p| p.vaddr == vaddr) {
                page.in_use = false;
                page.iova = 0;
            }
        }
        self.iova.free(loc.iova);
    }

    /// Clear the IOVA allocator and forget all tracked pages (controller
    /// disable). Hugepages themselves stay mapped; only the bookkeeping is
    /// reset.
    pub fn reset(&mut self) {
        for page in self.pages.iter_mut() {
            page.in_use = false;
            page.iova = 0;
        }
        self.iova.reset();
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }
}

#[cfg(not(target_os = "linux"))]
fn map_hugepage(size: usize) -> Result<Hugepage> {
    // Fallback for non-Linux dev hosts: a plain anonymous mapping behaves
    // identically for our purposes (contiguity + zero-fill), just without
    // the hugetlb backing.
    map_anonymous(size)
}

#[cfg(target_os = "linux")]
fn map_hugepage(size: usize) -> Result<Hugepage> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        // Hugetlb pool exhausted or unavailable: fall back to a normal
        // anonymous mapping so the arena still functions (e.g. under test
        // or on hosts without reserved hugepages configured).
        return map_anonymous(size);
    }
    Ok(Hugepage {
        vaddr: addr as usize,
        size,
    })
}

fn map_anonymous(size: usize) -> Result<Hugepage> {
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(DriverError::OutOfMemory("hugepage reservation exhausted"));
    }
    Ok(Hugepage {
        vaddr: addr as usize,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::identity_gateway;

    fn small_arena() -> HugepageArena {
        HugepageArena::new(
            ArenaConfig {
                page_size: 4096,
                hugepage_size: 4096 * 4,
            },
            identity_gateway(),
        )
        .unwrap()
    }

    #[test]
    fn malloc_single_page_then_free_zeroes_memory() {
        let mut arena = small_arena();
        let loc = arena.malloc(100, "test", Direction::HostToDevice).unwrap();
        assert_eq!(loc.linked_pages.len(), 0);
        unsafe {
            std::ptr::write_bytes(loc.vaddr as *mut u8, 0xAB, 4096);
        }
        arena.free(&loc);
        let byte = unsafe { std::ptr::read(loc.vaddr as *const u8) };
        assert_eq!(byte, 0);
    }

    #[test]
    fn malloc_multi_page_stitches_linked_pages() {
        let mut arena = small_arena();
        let loc = arena
            .malloc(4096 * 3, "test", Direction::Bidirectional)
            .unwrap();
        assert_eq!(loc.linked_pages.len(), 2);
        assert_eq!(loc.pages().len(), 3);
    }

    #[test]
    fn arena_grows_when_out_of_contiguous_space() {
        let mut arena = small_arena(); // 1 hugepage = 4 pages
        let _a = arena.malloc(4096 * 4, "test", Direction::HostToDevice).unwrap();
        // arena is now full; the next alloc must grow by another hugepage
        let _b = arena.malloc(4096, "test", Direction::HostToDevice).unwrap();
        assert!(arena.hugepages.len() >= 2);
    }

    #[test]
    fn reset_clears_iova_and_usage() {
        let mut arena = small_arena();
        let loc = arena.malloc(100, "test", Direction::HostToDevice).unwrap();
        assert!(loc.iova != 0);
        arena.reset();
        assert_eq!(arena.free_page_count(), arena.pages.len());
    }
}
