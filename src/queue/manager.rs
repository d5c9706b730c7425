//! Registry of `(sqid, cqid) -> (sq?, cq?)` pairs, round-robin IOSQ
//! selection, and the CQID list used for completion scanning.
//!
//! The teacher has no equivalent (one fixed IO queue pair); this is built
//! fresh per spec.md §4.5, following the ordered-map-plus-derived-lists
//! shape `lone/nvme/device.py`'s queue bookkeeping implies (admin pair
//! always keyed `(0,0)`).

use super::{CompletionQueue, SubmissionQueue};
use crate::error::{DriverError, Result};

struct Entry {
    sqid: u16,
    cqid: u16,
    sq: Option<SubmissionQueue>,
    cq: Option<CompletionQueue>,
}

#[derive(Default)]
pub struct QueueManager {
    entries: Vec<Entry>,
    iosqids: Vec<u16>,
    iocqids: Vec<u16>,
    next_iosq_cursor: usize,
}

/// What `get` was asked to find.
pub enum Lookup {
    Exact { sqid: u16, cqid: u16 },
    BySqid(u16),
    ByCqid(u16),
}

impl QueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_io_lists(&mut self) {
        self.iosqids = self
            .entries
            .iter()
            .filter(|e| e.sqid != 0 && e.cqid != 0 && e.sq.is_some())
            .map(|e| e.sqid)
            .collect();
        self.iocqids = self
            .entries
            .iter()
            .filter(|e| e.sqid != 0 && e.cqid != 0 && e.cq.is_some())
            .map(|e| e.cqid)
            .collect();
    }

    pub fn add(&mut self, sq: SubmissionQueue, cq: CompletionQueue) {
        let sqid = sq.id();
        let cqid = cq.id();
        self.entries.push(Entry {
            sqid,
            cqid,
            sq: Some(sq),
            cq: Some(cq),
        });
        self.refresh_io_lists();
    }

    /// Null the SQ half of every entry matching `sqid`.
    pub fn remove_sq(&mut self, sqid: u16) {
        for entry in self.entries.iter_mut() {
            if entry.sqid == sqid {
                entry.sq = None;
            }
        }
        self.refresh_io_lists();
    }

    /// Null the CQ half of every entry matching `cqid`. Precondition: the
    /// paired SQ half is already null (delete-order invariant).
    pub fn remove_cq(&mut self, cqid: u16) -> Result<()> {
        for entry in self.entries.iter() {
            if entry.cqid == cqid && entry.sq.is_some() {
                return Err(DriverError::Invariant(
                    "cannot remove a completion queue whose submission queue is still registered",
                ));
            }
        }
        for entry in self.entries.iter_mut() {
            if entry.cqid == cqid {
                entry.cq = None;
            }
        }
        self.entries
            .retain(|e| e.sq.is_some() || e.cq.is_some());
        self.refresh_io_lists();
        Ok(())
    }

    pub fn get(&self, lookup: Lookup) -> Result<(Option<&SubmissionQueue>, Option<&CompletionQueue>)> {
        match lookup {
            Lookup::Exact { sqid, cqid } => self
                .entries
                .iter()
                .find(|e| e.sqid == sqid && e.cqid == cqid)
                .map(|e| (e.sq.as_ref(), e.cq.as_ref()))
                .ok_or(DriverError::Invariant("no queue pair registered for that (sqid, cqid)")),
            Lookup::BySqid(sqid) => self
                .entries
                .iter()
                .find(|e| e.sqid == sqid)
                .map(|e| (e.sq.as_ref(), e.cq.as_ref()))
                .ok_or(DriverError::Invariant("no queue pair registered for that sqid")),
            Lookup::ByCqid(cqid) => self
                .entries
                .iter()
                .find(|e| e.cqid == cqid)
                .map(|e| (e.sq.as_ref(), e.cq.as_ref()))
                .ok_or(DriverError::Invariant("no queue pair registered for that cqid")),
        }
    }

    pub fn get_mut(
        &mut self,
        lookup: Lookup,
    ) -> Result<(Option<&mut SubmissionQueue>, Option<&mut CompletionQueue>)> {
        let entry = match lookup {
            Lookup::Exact { sqid, cqid } => self
                .entries
                .iter_mut()
                .find(|e| e.sqid == sqid && e.cqid == cqid),
            Lookup::BySqid(sqid) => self.entries.iter_mut().find(|e| e.sqid == sqid),
            Lookup::ByCqid(cqid) => self.entries.iter_mut().find(|e| e.cqid == cqid),
        };
        entry
            .map(|e| (e.sq.as_mut(), e.cq.as_mut()))
            .ok_or(DriverError::Invariant("no queue pair registered for that lookup"))
    }

    /// Round-robin over registered IOSQIDs, advancing an internal cursor
    /// with wrap.
    pub fn next_iosq_id(&mut self) -> Result<u16> {
        if self.iosqids.is_empty() {
            return Err(DriverError::Invariant("no I/O submission queues registered"));
        }
        let id = self.iosqids[self.next_iosq_cursor % self.iosqids.len()];
        self.next_iosq_cursor = (self.next_iosq_cursor + 1) % self.iosqids.len();
        Ok(id)
    }

    /// `[0] ++ iocqids`.
    pub fn all_cqids(&self) -> Vec<u16> {
        let mut all = vec![0u16];
        all.extend(self.iocqids.iter().copied());
        all
    }

    pub fn iosqids(&self) -> &[u16] {
        &self.iosqids
    }

    pub fn iocqids(&self) -> &[u16] {
        &self.iocqids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every registered queue pair (controller disable).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.iosqids.clear();
        self.iocqids.clear();
        self.next_iosq_cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::MemoryLocation;

    fn mem(size: usize) -> MemoryLocation {
        let buf = vec![0u8; size].into_boxed_slice();
        let vaddr = Box::into_raw(buf) as *mut u8 as usize;
        MemoryLocation {
            vaddr,
            iova: vaddr as u64,
            size,
            client_tag: "test",
            in_use: true,
            linked_pages: Vec::new(),
        }
    }

    fn pair(sqid: u16, cqid: u16) -> (SubmissionQueue, CompletionQueue) {
        let sq = SubmissionQueue::new(sqid, cqid, 4, mem(4 * 64)).unwrap();
        let cq = CompletionQueue::new(cqid, 4, mem(4 * 16)).unwrap();
        (sq, cq)
    }

    #[test]
    fn admin_pair_excluded_from_io_lists() {
        let mut qm = QueueManager::new();
        let (sq, cq) = pair(0, 0);
        qm.add(sq, cq);
        assert!(qm.iosqids().is_empty());
        assert_eq!(qm.all_cqids(), vec![0]);
    }

    #[test]
    fn round_robin_over_three_queues() {
        let mut qm = QueueManager::new();
        for i in 1..=3 {
            let (sq, cq) = pair(i, i);
            qm.add(sq, cq);
        }
        let mut seq = Vec::new();
        for _ in 0..6 {
            seq.push(qm.next_iosq_id().unwrap());
        }
        assert_eq!(seq, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn remove_cq_requires_sq_already_removed() {
        let mut qm = QueueManager::new();
        let (sq, cq) = pair(1, 1);
        qm.add(sq, cq);
        assert!(qm.remove_cq(1).is_err());
        qm.remove_sq(1);
        assert!(qm.remove_cq(1).is_ok());
    }

    #[test]
    fn get_exact_vs_by_sqid_vs_by_cqid() {
        let mut qm = QueueManager::new();
        let (sq, cq) = pair(1, 2);
        qm.add(sq, cq);
        assert!(qm.get(Lookup::Exact { sqid: 1, cqid: 2 }).is_ok());
        assert!(qm.get(Lookup::BySqid(1)).is_ok());
        assert!(qm.get(Lookup::ByCqid(2)).is_ok());
        assert!(qm.get(Lookup::Exact { sqid: 1, cqid: 99 }).is_err());
    }
}
