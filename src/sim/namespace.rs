//! Device-side namespace storage: a file-backed `mmap`, one per NSID.
//!
//! Grounded on `nvsim/state/__init__.py`'s `NVSimNamespace` (truncate a file
//! to `num_lbas * block_size`, `mmap` it, slice directly on read/write).
//! Sized far smaller than the original's IDEMA GB-scale formula, since this
//! is a backing store for an in-process test simulator, not a capacity
//! demo — see DESIGN.md. Uses an anonymous `tempfile` rather than a fixed
//! `/tmp` path so concurrent test runs never collide, and mmaps it with
//! `libc` the same way [`HugepageArena`](crate::dma::arena::HugepageArena)
//! maps its own pages.

use crate::error::{DriverError, Result};
use std::os::unix::io::AsRawFd;

pub struct Namespace {
    nsid: u32,
    block_size: u32,
    num_lbas: u64,
    vaddr: usize,
    len: usize,
    _file: std::fs::File,
}

unsafe impl Send for Namespace {}
unsafe impl Sync for Namespace {}

impl Namespace {
    pub fn create(nsid: u32, block_size: u32, num_lbas: u64) -> Result<Self> {
        let len = block_size as usize * num_lbas as usize;
        let file = tempfile::tempfile()
            .map_err(|_| DriverError::Configuration("failed to create namespace backing file"))?;
        file.set_len(len as u64)
            .map_err(|_| DriverError::Configuration("failed to size namespace backing file"))?;

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(DriverError::OutOfMemory("namespace backing mmap failed"));
        }

        Ok(Self {
            nsid,
            block_size,
            num_lbas,
            vaddr: addr as usize,
            len,
            _file: file,
        })
    }

    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn num_lbas(&self) -> u64 {
        self.num_lbas
    }

    pub fn read(&self, slba: u64, nlb: u16) -> Vec<u8> {
        let start = slba as usize * self.block_size as usize;
        let len = (nlb as usize + 1) * self.block_size as usize;
        unsafe { std::slice::from_raw_parts((self.vaddr + start) as *const u8, len).to_vec() }
    }

    pub fn write(&self, slba: u64, data: &[u8]) {
        let start = slba as usize * self.block_size as usize;
        let len = std::cmp::min(data.len(), self.len.saturating_sub(start));
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (self.vaddr + start) as *mut u8, len);
        }
    }

    /// Format NVM: zero the whole namespace.
    pub fn format(&self) {
        unsafe { std::ptr::write_bytes(self.vaddr as *mut u8, 0, self.len) }
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.vaddr as *mut libc::c_void, self.len);
        }
    }
}

/// Deterministic, non-overlapping `(slba, nlb)` coverage of `0..num_lbas`,
/// generated with a small xorshift PRNG instead of pulling in `rand` for a
/// single test helper. Not part of the crate's public surface; used only by
/// the integration scenarios.
#[doc(hidden)]
pub fn lba_ranges(num_lbas: u64, max_nlb: u16, seed: u64) -> Vec<(u64, u16)> {
    let mut state = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
    let mut ranges = Vec::new();
    let mut cursor = 0u64;
    while cursor < num_lbas {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let remaining = num_lbas - cursor;
        let cap = std::cmp::min(remaining, max_nlb as u64 + 1);
        let blocks = 1 + (state % cap);
        let nlb = (blocks - 1) as u16;
        ranges.push((cursor, nlb));
        cursor += blocks;
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let ns = Namespace::create(1, 512, 64).unwrap();
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        ns.write(0, &data);
        let back = ns.read(0, 1);
        assert_eq!(back, data);
    }

    #[test]
    fn format_zeroes_storage() {
        let ns = Namespace::create(1, 512, 4);
        let ns = ns.unwrap();
        ns.write(0, &[0xAB; 512]);
        ns.format();
        assert_eq!(ns.read(0, 0), vec![0u8; 512]);
    }

    #[test]
    fn lba_ranges_cover_without_overlap() {
        let ranges = lba_ranges(1000, 7, 42);
        let mut cursor = 0u64;
        for (slba, nlb) in &ranges {
            assert_eq!(*slba, cursor);
            cursor += *nlb as u64 + 1;
        }
        assert_eq!(cursor, 1000);
    }
}
