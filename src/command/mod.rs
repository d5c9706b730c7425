//! Command construction, posting, and completion pairing.
//!
//! `SubmissionEntry`/`CompletionEntry` layouts live in [`crate::queue`];
//! this module owns the higher-level `Command` value and the CID
//! generator, state machine, and PRP-allocation rules from spec.md §4.6,
//! grounded on the teacher's opcode enums and `classify_status` dispatch in
//! `drivers/nvme/command.rs`, generalized from a fixed single-queue driver
//! into one that posts through an arbitrary [`QueueManager`] pair.

pub mod status;

use crate::dma::arena::HugepageArena;
use crate::dma::prp::Prp;
use crate::dma::Direction;
use crate::error::{DriverError, Result};
use crate::queue::manager::{Lookup, QueueManager};
use crate::queue::{CompletionEntry, SubmissionEntry};
use crate::registers::nvme::NvmeRegisters;
use status::Scope;

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const OPCODE_ADMIN_DELETE_IO_SQ: u8 = 0x00;
pub const OPCODE_ADMIN_CREATE_IO_SQ: u8 = 0x01;
pub const OPCODE_ADMIN_DELETE_IO_CQ: u8 = 0x04;
pub const OPCODE_ADMIN_CREATE_IO_CQ: u8 = 0x05;
pub const OPCODE_ADMIN_IDENTIFY: u8 = 0x06;
pub const OPCODE_ADMIN_GET_LOG_PAGE: u8 = 0x02;
pub const OPCODE_ADMIN_FORMAT_NVM: u8 = 0x80;

pub const OPCODE_NVM_FLUSH: u8 = 0x00;
pub const OPCODE_NVM_WRITE: u8 = 0x01;
pub const OPCODE_NVM_READ: u8 = 0x02;

/// Which command set an opcode belongs to — mirrors the teacher's
/// `AdminOpcode`/`NvmOpcode` split, collapsed to a tag carried on `Command`
/// since opcodes alone are ambiguous between the two sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSet {
    Admin,
    Nvm,
}

impl CmdSet {
    fn status_scope(self, opcode: u8) -> Scope {
        match (self, opcode) {
            (CmdSet::Admin, OPCODE_ADMIN_CREATE_IO_SQ) => Scope::CreateIoSq,
            (CmdSet::Admin, OPCODE_ADMIN_CREATE_IO_CQ) => Scope::CreateIoCq,
            (CmdSet::Admin, OPCODE_ADMIN_DELETE_IO_SQ) => Scope::DeleteIoSq,
            (CmdSet::Admin, OPCODE_ADMIN_DELETE_IO_CQ) => Scope::DeleteIoCq,
            (CmdSet::Admin, OPCODE_ADMIN_FORMAT_NVM) => Scope::FormatNvm,
            (CmdSet::Admin, OPCODE_ADMIN_GET_LOG_PAGE) => Scope::GetLogPage,
            (CmdSet::Nvm, OPCODE_NVM_READ) => Scope::Read,
            (CmdSet::Nvm, OPCODE_NVM_WRITE) => Scope::Write,
            _ => Scope::Generic,
        }
    }
}

/// Monotonic command-identifier generator: starts at `0x1000`, wraps back
/// to `0x1000` once it would exceed `0xFFFE`.
pub struct CidGenerator {
    next: u16,
}

impl Default for CidGenerator {
    fn default() -> Self {
        Self { next: 0x1000 }
    }
}

impl CidGenerator {
    const MIN: u16 = 0x1000;
    const MAX: u16 = 0xFFFE;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> u16 {
        let cid = self.next;
        self.next = if self.next >= Self::MAX {
            Self::MIN
        } else {
            self.next + 1
        };
        cid
    }
}

/// A command in flight. Built with defaults applied, `start`ed (CID
/// stamped, PRPs allocated, copied into the SQ), and `complete`d (CQE
/// copied in, DMA freed).
pub struct Command {
    pub opcode: u8,
    pub cmdset: CmdSet,
    pub nsid: u32,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
    pub data_in: Option<Vec<u8>>,
    pub data_out: Option<Vec<u8>>,
    raw_prp: Option<(u64, u64)>,

    cid: Option<u16>,
    sqid: Option<u16>,
    cqid: Option<u16>,
    prps: Vec<Prp>,
    posted: bool,
    complete: bool,
    internal_mem: bool,
    cqe: CompletionEntry,
    start_at: Option<Instant>,
    end_at: Option<Instant>,
}

impl Command {
    fn new(cmdset: CmdSet, opcode: u8, nsid: u32) -> Self {
        Self {
            opcode,
            cmdset,
            nsid,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
            data_in: None,
            data_out: None,
            raw_prp: None,
            cid: None,
            sqid: None,
            cqid: None,
            prps: Vec::new(),
            posted: false,
            complete: false,
            internal_mem: false,
            cqe: CompletionEntry::zeroed(),
            start_at: None,
            end_at: None,
        }
    }

    pub fn admin(opcode: u8) -> Self {
        Self::new(CmdSet::Admin, opcode, 0)
    }

    pub fn nvm(opcode: u8, nsid: u32) -> Self {
        Self::new(CmdSet::Nvm, opcode, nsid)
    }

    pub fn with_cdw10(mut self, v: u32) -> Self {
        self.cdw10 = v;
        self
    }

    pub fn with_cdw11(mut self, v: u32) -> Self {
        self.cdw11 = v;
        self
    }

    pub fn with_cdw12(mut self, v: u32) -> Self {
        self.cdw12 = v;
        self
    }

    pub fn with_cdw13(mut self, v: u32) -> Self {
        self.cdw13 = v;
        self
    }

    pub fn expect_data_in(mut self, size: usize) -> Self {
        self.data_in = Some(vec![0u8; size]);
        self
    }

    pub fn with_data_out(mut self, bytes: Vec<u8>) -> Self {
        self.data_out = Some(bytes);
        self
    }

    /// Attach a PRP1/PRP2 pair directly, bypassing the arena-backed
    /// transfer allocation. Used for admin commands whose DPTR names
    /// memory the caller already owns (e.g. a queue's own backing pages
    /// for Create I/O Submission/Completion Queue).
    pub fn with_raw_prp(mut self, prp1: u64, prp2: u64) -> Self {
        self.raw_prp = Some((prp1, prp2));
        self
    }

    /// Override the namespace identifier. Used for per-namespace Identify
    /// (CNS=0x00), which is an admin command but still names a namespace.
    pub fn with_nsid(mut self, nsid: u32) -> Self {
        self.nsid = nsid;
        self
    }

    /// NVM read/write helper: LBA split across CDW10/CDW11, NLB in CDW12.
    pub fn with_lba_range(mut self, slba: u64, nlb: u16) -> Self {
        self.cdw10 = slba as u32;
        self.cdw11 = (slba >> 32) as u32;
        self.cdw12 = (self.cdw12 & 0xFFFF_0000) | nlb as u32;
        self
    }

    fn nlb(&self) -> u16 {
        (self.cdw12 & 0xFFFF) as u16
    }

    fn slba(&self) -> u64 {
        (self.cdw10 as u64) | ((self.cdw11 as u64) << 32)
    }

    pub fn is_posted(&self) -> bool {
        self.posted
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn cqe(&self) -> &CompletionEntry {
        &self.cqe
    }

    pub fn cid(&self) -> Option<u16> {
        self.cid
    }

    pub fn sqid(&self) -> Option<u16> {
        self.sqid
    }

    pub fn cqid(&self) -> Option<u16> {
        self.cqid
    }

    pub fn duration(&self) -> Option<Duration> {
        Some(self.end_at?.saturating_duration_since(self.start_at?))
    }

    /// Decode this command's completion status against its own scope.
    pub fn status(&self) -> Result<status::StatusCode> {
        let sf = self.cqe.status();
        let sct = (sf >> 8) & 0x7;
        let sc_value = sf & 0xFF;
        status::decode(sct as u8, sc_value as u8, self.cmdset.status_scope(self.opcode))
    }

    fn to_submission_entry(&self) -> SubmissionEntry {
        let mut entry = SubmissionEntry::zeroed();
        entry.cdw0 = self.opcode as u32;
        entry.nsid = self.nsid;
        entry.cdw10 = self.cdw10;
        entry.cdw11 = self.cdw11;
        entry.cdw12 = self.cdw12;
        entry.cdw13 = self.cdw13;
        entry.cdw14 = self.cdw14;
        entry.cdw15 = self.cdw15;
        if let Some((prp1, prp2)) = self.raw_prp {
            entry.prp1 = prp1;
            entry.prp2 = prp2;
        } else if let Some(prp) = self.prps.first() {
            entry.prp1 = prp.prp1();
            entry.prp2 = prp.prp2();
        }
        entry
    }
}

/// What transfer (if any) a command implies, per spec.md §4.6's PRP
/// allocation table.
fn required_transfer(cmd: &Command, lba_bytes: u64) -> Result<Option<(Direction, usize)>> {
    if cmd.data_in.is_some() && cmd.data_out.is_some() {
        return Err(DriverError::Unsupported(
            "a command cannot have both data_in and data_out",
        ));
    }
    match (cmd.cmdset, cmd.opcode) {
        (CmdSet::Nvm, OPCODE_NVM_WRITE) => {
            Ok(Some((Direction::HostToDevice, (cmd.nlb() as u64 + 1) as usize * lba_bytes as usize)))
        }
        (CmdSet::Nvm, OPCODE_NVM_READ) => {
            Ok(Some((Direction::DeviceToHost, (cmd.nlb() as u64 + 1) as usize * lba_bytes as usize)))
        }
        _ => {
            if let Some(data_in) = &cmd.data_in {
                if !data_in.is_empty() {
                    return Ok(Some((Direction::DeviceToHost, data_in.len())));
                }
            }
            if let Some(data_out) = &cmd.data_out {
                if !data_out.is_empty() {
                    return Ok(Some((Direction::HostToDevice, data_out.len())));
                }
            }
            Ok(None)
        }
    }
}

/// Owns the CID generator and the outstanding-command table; everything
/// else (queues, DMA arena, registers) is borrowed per call, matching the
/// ownership split spec.md §3 describes (the controller owns queues and
/// arena; commands are borrowed by key while in flight).
pub struct CommandEngine {
    cid_gen: CidGenerator,
    outstanding: HashMap<(u16, u16), Command>,
    completed: HashMap<(u16, u16), Command>,
}

impl Default for CommandEngine {
    fn default() -> Self {
        Self {
            cid_gen: CidGenerator::new(),
            outstanding: HashMap::new(),
            completed: HashMap::new(),
        }
    }
}

impl CommandEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// `start(command, sqid?, cqid?, alloc_mem=true)`.
    pub fn start(
        &mut self,
        mut cmd: Command,
        sqid: Option<u16>,
        queues: &mut QueueManager,
        arena: &mut HugepageArena,
        registers: &NvmeRegisters,
        alloc_mem: bool,
        lba_bytes: u64,
    ) -> Result<(u16, u16)> {
        if cmd.posted {
            return Err(DriverError::Invariant("command is already posted"));
        }

        let sqid = match sqid {
            Some(s) => s,
            None if cmd.cmdset == CmdSet::Admin => 0,
            None => queues.next_iosq_id()?,
        };

        let (sq, cq) = queues.get_mut(Lookup::BySqid(sqid))?;
        let sq = sq.ok_or(DriverError::Invariant("submission queue not registered"))?;
        let cqid = cq
            .as_ref()
            .map(|c| c.id())
            .unwrap_or_else(|| sq.cqid());

        if alloc_mem {
            if let Some((direction, size)) = required_transfer(&cmd, lba_bytes)? {
                let mps = registers.mps() as usize;
                let mut prp = Prp::new(size, mps)?;
                prp.alloc(arena, direction)?;
                if direction == Direction::HostToDevice {
                    let bytes = cmd.data_out.clone().unwrap_or_default();
                    if bytes.len() > mps {
                        return Err(DriverError::Configuration(
                            "host-to-device transfer exceeds the single-PRP copy cap",
                        ));
                    }
                    prp.set_data_buffer(&bytes);
                }
                cmd.prps.push(prp);
                cmd.internal_mem = true;
            }
        }

        let cid = self.cid_gen.alloc();
        let entry = cmd.to_submission_entry().with_cid(cid);

        if self.outstanding.contains_key(&(cid, sqid)) {
            return Err(DriverError::Invariant(
                "(cid, sqid) already present in the outstanding table",
            ));
        }

        let new_tail = sq.post(entry)?;

        cmd.cid = Some(cid);
        cmd.sqid = Some(sqid);
        cmd.cqid = Some(cqid);
        cmd.posted = true;
        cmd.start_at = Some(Instant::now());

        registers.write_doorbell(registers.sq_tail_doorbell_offset(sqid), new_tail as u32);

        self.outstanding.insert((cid, sqid), cmd);
        Ok((cid, sqid))
    }

    /// `get_completion(cqid)`.
    pub fn get_completion(
        &mut self,
        cqid: u16,
        queues: &mut QueueManager,
        arena: &mut HugepageArena,
        registers: &NvmeRegisters,
    ) -> Result<bool> {
        let (sq, cq) = queues.get_mut(Lookup::ByCqid(cqid))?;
        let cq = cq.ok_or(DriverError::Invariant("completion queue not registered"))?;

        let Some(cqe) = cq.peek() else {
            return Ok(false);
        };

        let key = (cqe.command_id(), cqe.sqid());
        let mut cmd = self
            .outstanding
            .remove(&key)
            .ok_or(DriverError::Invariant(
                "completion received for a (cid, sqid) not in the outstanding table",
            ))?;

        cmd.end_at = Some(Instant::now());
        cmd.cqe = cqe;
        cmd.posted = false;
        cmd.complete = true;

        if cmd.internal_mem {
            if let Some(prp) = cmd.prps.first() {
                if let Some(data_in) = cmd.data_in.as_mut() {
                    let buf = prp.get_data_buffer();
                    let len = std::cmp::min(buf.len(), data_in.len());
                    data_in[..len].copy_from_slice(&buf[..len]);
                }
            }
            for mut prp in std::mem::take(&mut cmd.prps) {
                prp.free_all_memory(arena);
            }
        }

        cq.consume();
        if let Some(sq) = sq {
            sq.advance_head_shadow(cqe.sq_head());
        }
        registers.write_doorbell(registers.cq_head_doorbell_offset(cqid), cq.head() as u32);

        self.completed.insert(key, cmd);
        Ok(true)
    }

    /// `process_completions(cqids?, max_completions, max_time_s)`.
    pub fn process_completions(
        &mut self,
        cqids: &[u16],
        max_completions: usize,
        max_time: Duration,
        queues: &mut QueueManager,
        arena: &mut HugepageArena,
        registers: &NvmeRegisters,
    ) -> Result<usize> {
        let deadline = Instant::now() + max_time;
        let mut num = 0;
        if max_completions == 0 {
            return Ok(0);
        }
        loop {
            let mut consumed_this_round = false;
            for &cqid in cqids {
                if self.get_completion(cqid, queues, arena, registers)? {
                    num += 1;
                    consumed_this_round = true;
                    if num >= max_completions {
                        return Ok(num);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(num);
            }
            if !consumed_this_round {
                std::thread::yield_now();
            }
        }
    }

    /// Remove and return a command once it has completed.
    pub fn take_completed(&mut self, cid: u16, sqid: u16) -> Option<Command> {
        self.completed.remove(&(cid, sqid))
    }

    /// `sync_cmd`: `start` then poll that command's CQ until complete.
    pub fn sync_cmd(
        &mut self,
        cmd: Command,
        sqid: Option<u16>,
        queues: &mut QueueManager,
        arena: &mut HugepageArena,
        registers: &NvmeRegisters,
        alloc_mem: bool,
        lba_bytes: u64,
        timeout: Duration,
        check: bool,
    ) -> Result<Command> {
        let (cid, sqid) = self.start(cmd, sqid, queues, arena, registers, alloc_mem, lba_bytes)?;
        let cqid = {
            let (_, cq) = queues.get(Lookup::BySqid(sqid))?;
            cq.map(|c| c.id())
                .ok_or(DriverError::Invariant("submission queue has no paired completion queue"))?
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(done) = self.take_completed(cid, sqid) {
                if check {
                    let status = done.status()?;
                    if !status.is_success() {
                        return Err(DriverError::status(status));
                    }
                }
                return Ok(done);
            }
            self.get_completion(cqid, queues, arena, registers)?;
            if self.completed.contains_key(&(cid, sqid)) {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout("command completion"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_generator_wraps_at_max() {
        let mut gen = CidGenerator::new();
        let mut last = 0;
        for _ in 0..=(CidGenerator::MAX - CidGenerator::MIN) {
            last = gen.alloc();
        }
        assert_eq!(last, CidGenerator::MAX);
        assert_eq!(gen.alloc(), CidGenerator::MIN);
    }

    #[test]
    fn required_transfer_rejects_both_data_in_and_out() {
        let cmd = Command::admin(OPCODE_ADMIN_IDENTIFY)
            .expect_data_in(4096)
            .with_data_out(vec![0; 10]);
        assert!(required_transfer(&cmd, 512).is_err());
    }

    #[test]
    fn required_transfer_write_uses_nlb_times_lba_bytes() {
        let cmd = Command::nvm(OPCODE_NVM_WRITE, 1).with_lba_range(0, 7);
        let (direction, size) = required_transfer(&cmd, 512).unwrap().unwrap();
        assert_eq!(direction, Direction::HostToDevice);
        assert_eq!(size, 8 * 512);
    }

    #[test]
    fn required_transfer_read_is_device_to_host() {
        let cmd = Command::nvm(OPCODE_NVM_READ, 1).with_lba_range(0, 0);
        let (direction, size) = required_transfer(&cmd, 4096).unwrap().unwrap();
        assert_eq!(direction, Direction::DeviceToHost);
        assert_eq!(size, 4096);
    }

    #[test]
    fn command_slba_roundtrip() {
        let cmd = Command::nvm(OPCODE_NVM_WRITE, 1).with_lba_range(0x1_0000_0002, 9);
        assert_eq!(cmd.slba(), 0x1_0000_0002);
        assert_eq!(cmd.nlb(), 9);
    }
}
