//! In-process NVMe device model: a background tick thread that plays the
//! device side of the protocol against the same BAR0/config-space memory a
//! [`Controller`](crate::controller::Controller) drives from the host side.
//!
//! Grounded on the `nvsim` package: `__init__.py`'s `NVSimThread` (the tick
//! loop and its CFS-on-exception fallback), `reg_handlers/nvme.py`'s
//! `NVMeRegChangeHandler` (CC.EN transition detection, the SQ drain loop,
//! injector handling), and `cmd_handlers/{admin,nvm}.py` (the individual
//! opcode handlers). Unlike the host driver, the simulator keeps its own
//! [`QueueManager`] — spec.md §5 calls this out explicitly, since the two
//! sides must not share mutable queue state despite pointing at the same
//! backing memory. `DeleteIoSq`/`DeleteIoCq`/`GetLogPage` have no
//! counterpart in `nvsim` (it never registered handlers for them); those
//! three are authored directly against spec.md's description instead.

pub mod injectors;
pub mod namespace;

use crate::command::status::{self, Scope, StatusCode};
use crate::command::{
    OPCODE_ADMIN_CREATE_IO_CQ, OPCODE_ADMIN_CREATE_IO_SQ, OPCODE_ADMIN_DELETE_IO_CQ,
    OPCODE_ADMIN_DELETE_IO_SQ, OPCODE_ADMIN_FORMAT_NVM, OPCODE_ADMIN_GET_LOG_PAGE,
    OPCODE_ADMIN_IDENTIFY, OPCODE_NVM_FLUSH, OPCODE_NVM_READ, OPCODE_NVM_WRITE,
};
use crate::dma::prp::Prp;
use crate::dma::MemoryLocation;
use crate::error::Result;
use crate::gateway::{MmioRegion, RegisterIo, VecGateway};
use crate::queue::manager::{Lookup, QueueManager};
use crate::queue::{CompletionEntry, CompletionQueue, SubmissionEntry, SubmissionQueue};
use crate::registers::nvme::{cc, csts, NvmeRegisters, OFFSET_CC};
use crate::registers::pcie;
use injectors::{Injector, InjectorQueue};
use namespace::Namespace;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default namespace layout: NSID 1 at 512 B/LBA, NSIDs 2-4 at 4096 B/LBA,
/// matching `nvsim/state/__init__.py`'s block-size split but sized for a
/// test fixture rather than a multi-gigabyte capacity demo (see DESIGN.md).
const NAMESPACE_LAYOUT: &[(u32, u32, u64)] = &[(1, 512, 2048), (2, 4096, 256), (3, 4096, 256), (4, 4096, 256)];

pub struct SimulatorConfig {
    pub tick_interval: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_micros(1),
        }
    }
}

struct SimQueues {
    queues: QueueManager,
    holding_cqs: Vec<(u16, CompletionQueue)>,
    device_heads: HashMap<u16, u16>,
    ready: bool,
}

impl Default for SimQueues {
    fn default() -> Self {
        Self {
            queues: QueueManager::new(),
            holding_cqs: Vec::new(),
            device_heads: HashMap::new(),
            ready: false,
        }
    }
}

struct SimState {
    queues: SimQueues,
    namespaces: HashMap<u32, Namespace>,
    ignore_until: Option<Instant>,
    fail_next: Option<StatusCode>,
    cfs_pending: bool,
}

/// A running in-process NVMe device model. Drop joins the tick thread.
pub struct Simulator {
    pci_gateway: Arc<VecGateway>,
    region: Arc<MmioRegion>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    injectors: Arc<InjectorQueue>,
}

impl Simulator {
    pub fn start(config: SimulatorConfig) -> Result<Arc<Self>> {
        let pci_gateway = Arc::new(VecGateway::new(0x200));
        let region = Arc::new(MmioRegion::from_boxed(
            vec![0u8; 0x1000 + 1024 * 8].into_boxed_slice(),
        ));

        init_pci_identity(pci_gateway.as_ref());
        init_pci_capabilities(pci_gateway.as_ref());
        init_nvme_registers(region.as_ref());

        let mut namespaces = HashMap::new();
        for &(nsid, block_size, num_lbas) in NAMESPACE_LAYOUT {
            namespaces.insert(nsid, Namespace::create(nsid, block_size, num_lbas)?);
        }

        let state = Arc::new(Mutex::new(SimState {
            queues: SimQueues::default(),
            namespaces,
            ignore_until: None,
            fail_next: None,
            cfs_pending: false,
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let injectors = Arc::new(InjectorQueue::new());

        let handle = {
            let region = region.clone();
            let stop = stop.clone();
            let state = state.clone();
            let injectors = injectors.clone();
            let interval = config.tick_interval;
            std::thread::Builder::new()
                .name("nvsim-tick".into())
                .spawn(move || {
                    let registers = NvmeRegisters::new(region.clone());
                    while !stop.load(Ordering::Relaxed) {
                        let mut guard = state.lock().unwrap();
                        if let Err(_e) = tick(region.as_ref(), &registers, &injectors, &mut guard) {
                            let csts_val = registers.read_csts();
                            registers.write_csts(csts_val | (1 << 1));
                            log::error!("nvsim tick failed, controller fault-stopped");
                            drop(guard);
                            break;
                        }
                        drop(guard);
                        std::thread::sleep(interval);
                    }
                })
                .expect("spawn nvsim tick thread")
        };

        Ok(Arc::new(Self {
            pci_gateway,
            region,
            stop,
            handle: Mutex::new(Some(handle)),
            injectors,
        }))
    }

    pub fn region(&self) -> Arc<MmioRegion> {
        self.region.clone()
    }

    pub fn pci_gateway(&self) -> Arc<VecGateway> {
        self.pci_gateway.clone()
    }

    pub fn inject(&self, injector: Injector) {
        self.injectors.push(injector);
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn init_pci_identity(gateway: &VecGateway) {
    // VID=0xED00, DID=0xDA01, matching `nvsim`'s `init_pcie_regs`.
    RegisterIo::write_bytes(gateway, pcie::OFFSET_ID, &[0x00, 0xED, 0x01, 0xDA]);
    RegisterIo::write_bytes(gateway, pcie::OFFSET_CAP, &[0x40, 0, 0, 0]);
}

/// Standard capability chain (PM -> MSI -> PCI Express -> MSI-X -> Generic)
/// at 16-byte strides from 0x40; extended chain (AER -> DSN) fixed at 0x100,
/// matching `nvsim/__init__.py`'s `initialize_pcie_caps`.
fn init_pci_capabilities(gateway: &VecGateway) {
    let standard: [(u8, u64); 5] = [(0x01, 0x40), (0x05, 0x50), (0x10, 0x60), (0x11, 0x70), (0x0A, 0x80)];
    for (i, &(id, offset)) in standard.iter().enumerate() {
        let next = if i + 1 < standard.len() { standard[i + 1].1 } else { 0 };
        RegisterIo::write_bytes(gateway, offset, &[id, next as u8]);
    }

    write_extended_cap_header(gateway, 0x100, 0x01, 0x140);
    write_extended_cap_header(gateway, 0x140, 0x03, 0);
}

fn write_extended_cap_header(gateway: &VecGateway, offset: u64, id: u16, next: u64) {
    let header: u32 = id as u32 | ((next as u32 & 0xFFF) << 20);
    RegisterIo::write_bytes(gateway, offset, &header.to_le_bytes());
}

fn init_nvme_registers(region: &MmioRegion) {
    use crate::registers::nvme::{cap, vs, OFFSET_CAP, OFFSET_VS};
    cap::MQES.write(region, OFFSET_CAP, 0x3FFF);
    cap::CQR.write(region, OFFSET_CAP, 1);
    cap::TO.write(region, OFFSET_CAP, 20);
    cap::CSS.write(region, OFFSET_CAP, 0x40);
    cap::MPSMIN.write(region, OFFSET_CAP, 0);
    cap::MPSMAX.write(region, OFFSET_CAP, 4);
    vs::MJR.write(region, OFFSET_VS, 2);
    vs::MNR.write(region, OFFSET_VS, 1);
}

fn sct_for(scope: Scope) -> u8 {
    if scope == Scope::Generic {
        0
    } else {
        1
    }
}

fn status_tuple(code: StatusCode) -> (u8, u8) {
    (sct_for(code.scope), code.value)
}

fn make_cqe(cid: u16, sqid: u16, sqhd: u16, sct: u8, sc: u8) -> CompletionEntry {
    let sf = ((sct as u32) << 9) | ((sc as u32) << 1);
    CompletionEntry {
        dw0: 0,
        dw1: 0,
        sq_head_sqid: (sqhd as u32) | ((sqid as u32) << 16),
        cid_status: ((cid as u32) << 16) | sf,
    }
}

fn read_submission_entry(vaddr: usize, index: u16) -> SubmissionEntry {
    let offset = index as usize * core::mem::size_of::<SubmissionEntry>();
    unsafe {
        let src = (vaddr as *const u8).add(offset) as *const SubmissionEntry;
        std::ptr::read_volatile(src)
    }
}

fn identity(iova: u64) -> usize {
    iova as usize
}

fn write_prp_data(prp1: u64, prp2: u64, mps: usize, data: &[u8]) -> Result<()> {
    let prp = Prp::from_address(data.len(), mps, prp1, prp2, identity)?;
    prp.set_data_buffer(data);
    Ok(())
}

fn read_prp_data(prp1: u64, prp2: u64, mps: usize, len: usize) -> Result<Vec<u8>> {
    let prp = Prp::from_address(len, mps, prp1, prp2, identity)?;
    Ok(prp.get_data_buffer())
}

/// One pass: drain injectors, watch for a CC.EN edge, then drain every
/// registered SQ that has pending entries. Mirrors
/// `NVMeRegChangeHandler.__call__`'s single invocation per tick.
fn tick(
    region: &MmioRegion,
    registers: &NvmeRegisters,
    injectors: &InjectorQueue,
    state: &mut SimState,
) -> Result<()> {
    for token in injectors.drain() {
        match token {
            Injector::IgnoreNVMeRegChanges { timeout_s } => {
                state.ignore_until = Some(Instant::now() + Duration::from_secs_f64(timeout_s));
            }
            Injector::FailCommand { sc } => state.fail_next = Some(sc),
            Injector::SetCFS => state.cfs_pending = true,
        }
    }

    if let Some(until) = state.ignore_until {
        if Instant::now() < until {
            return Ok(());
        }
        state.ignore_until = None;
    }

    if state.cfs_pending {
        csts::CFS.write(region, crate::registers::nvme::OFFSET_CSTS, 1);
        state.cfs_pending = false;
    }

    let cc_en = cc::EN.read(region, OFFSET_CC) != 0;
    if cc_en && !state.queues.ready {
        bring_up_admin_queue(registers, &mut state.queues)?;
        csts::RDY.write(region, crate::registers::nvme::OFFSET_CSTS, 1);
    } else if !cc_en && state.queues.ready {
        state.queues = SimQueues::default();
        csts::RDY.write(region, crate::registers::nvme::OFFSET_CSTS, 0);
    }

    if !state.queues.ready {
        return Ok(());
    }

    let mps = registers.mps() as usize;
    let mut sqids = vec![0u16];
    sqids.extend(state.queues.queues.iosqids().iter().copied());
    for sqid in sqids {
        process_sq(sqid, registers, state, mps)?;
    }
    Ok(())
}

fn bring_up_admin_queue(registers: &NvmeRegisters, queues: &mut SimQueues) -> Result<()> {
    let aqa = registers.read_aqa();
    let asq_entries = (aqa & 0xFFF) as u16 + 1;
    let acq_entries = ((aqa >> 16) & 0xFFF) as u16 + 1;
    let asq_addr = registers.read_asq();
    let acq_addr = registers.read_acq();

    let sq_mem = MemoryLocation {
        vaddr: identity(asq_addr),
        iova: asq_addr,
        size: asq_entries as usize * core::mem::size_of::<SubmissionEntry>(),
        client_tag: "nvsim_asq",
        in_use: true,
        linked_pages: Vec::new(),
    };
    let cq_mem = MemoryLocation {
        vaddr: identity(acq_addr),
        iova: acq_addr,
        size: acq_entries as usize * core::mem::size_of::<CompletionEntry>(),
        client_tag: "nvsim_acq",
        in_use: true,
        linked_pages: Vec::new(),
    };
    let sq = SubmissionQueue::new(0, 0, asq_entries, sq_mem)?;
    let cq = CompletionQueue::new(0, acq_entries, cq_mem)?;
    queues.queues.add(sq, cq);
    queues.ready = true;
    Ok(())
}

fn process_sq(sqid: u16, registers: &NvmeRegisters, state: &mut SimState, mps: usize) -> Result<()> {
    let tail = registers.read_doorbell(registers.sq_tail_doorbell_offset(sqid)) as u16;
    loop {
        let head = *state.queues.device_heads.get(&sqid).unwrap_or(&0);
        if head == tail {
            break;
        }

        let (sq_vaddr, sq_entries, cqid) = {
            let lookup_result = state.queues.queues.get(Lookup::BySqid(sqid));
            let Ok((sq_opt, cq_opt)) = lookup_result else {
                break;
            };
            let Some(sq) = sq_opt else { break };
            let Some(cq) = cq_opt else { break };
            (sq.mem().vaddr, sq.entries(), cq.id())
        };

        let entry = read_submission_entry(sq_vaddr, head);
        let new_head = (head + 1) % sq_entries;
        state.queues.device_heads.insert(sqid, new_head);

        let (sct, sc) = if let Some(forced) = state.fail_next.take() {
            status_tuple(forced)
        } else if sqid == 0 {
            dispatch_admin(&entry, state, mps)?
        } else {
            dispatch_nvm(&entry, state, mps)?
        };

        let cqe = make_cqe(entry.cid(), sqid, new_head, sct, sc);
        if let Ok((_, Some(cq))) = state.queues.queues.get_mut(Lookup::ByCqid(cqid)) {
            let _ = cq.post(cqe);
        }
    }
    Ok(())
}

fn dispatch_admin(entry: &SubmissionEntry, state: &mut SimState, mps: usize) -> Result<(u8, u8)> {
    match entry.opcode() {
        OPCODE_ADMIN_IDENTIFY => admin_identify(entry, state, mps),
        OPCODE_ADMIN_CREATE_IO_CQ => admin_create_iocq(entry, &mut state.queues),
        OPCODE_ADMIN_CREATE_IO_SQ => admin_create_iosq(entry, &mut state.queues),
        OPCODE_ADMIN_DELETE_IO_SQ => admin_delete_iosq(entry, &mut state.queues),
        OPCODE_ADMIN_DELETE_IO_CQ => admin_delete_iocq(entry, &mut state.queues),
        OPCODE_ADMIN_GET_LOG_PAGE => admin_get_log_page(entry, mps),
        OPCODE_ADMIN_FORMAT_NVM => admin_format_nvm(entry, state),
        _ => Ok(status_tuple(status::lookup(0x01, Scope::Generic)?)),
    }
}

fn dispatch_nvm(entry: &SubmissionEntry, state: &mut SimState, mps: usize) -> Result<(u8, u8)> {
    match entry.opcode() {
        OPCODE_NVM_WRITE => nvm_write(entry, state, mps),
        OPCODE_NVM_READ => nvm_read(entry, state, mps),
        OPCODE_NVM_FLUSH => Ok(status_tuple(status::lookup(0x00, Scope::Generic)?)),
        _ => Ok(status_tuple(status::lookup(0x01, Scope::Generic)?)),
    }
}

fn admin_identify(entry: &SubmissionEntry, state: &mut SimState, mps: usize) -> Result<(u8, u8)> {
    let cns = entry.cdw10 & 0xFF;
    let mut data = vec![0u8; 4096];
    match cns {
        0x01 => {
            write_ascii_padded(&mut data[4..24], b"EDDAE771");
            write_ascii_padded(&mut data[24..64], b"nvsim_0.1");
            write_ascii_padded(&mut data[64..72], b"0.001");
        }
        0x00 => {
            let Some(ns) = state.namespaces.get(&entry.nsid) else {
                return Ok(status_tuple(status::lookup(0x0B, Scope::Generic)?));
            };
            let num_lbas = ns.num_lbas();
            data[0..8].copy_from_slice(&num_lbas.to_le_bytes());
            data[16..24].copy_from_slice(&num_lbas.to_le_bytes());
            data[25] = 1; // NLBAF - 1: two supported LBA formats
            data[26] = if ns.block_size() == 512 { 0 } else { 1 }; // FLBAS
            write_lbaf(&mut data[128..132], 9); // 512 B
            write_lbaf(&mut data[132..136], 12); // 4096 B
        }
        0x02 => {
            for (i, &(nsid, _, _)) in NAMESPACE_LAYOUT.iter().enumerate() {
                let off = i * 4;
                data[off..off + 4].copy_from_slice(&nsid.to_le_bytes());
            }
        }
        0x17 => {}
        _ => return Ok(status_tuple(status::lookup(0x02, Scope::Generic)?)),
    }
    write_prp_data(entry.prp1, entry.prp2, mps, &data)?;
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

fn write_ascii_padded(dst: &mut [u8], value: &[u8]) {
    dst.fill(b' ');
    let len = std::cmp::min(dst.len(), value.len());
    dst[..len].copy_from_slice(&value[..len]);
}

fn write_lbaf(dst: &mut [u8], lbads: u8) {
    dst[0] = 0; // MS low
    dst[1] = 0; // MS high
    dst[2] = lbads;
    dst[3] = 0; // RP
}

fn admin_create_iocq(entry: &SubmissionEntry, queues: &mut SimQueues) -> Result<(u8, u8)> {
    let cqid = (entry.cdw10 & 0xFFFF) as u16;
    let entries = ((entry.cdw10 >> 16) & 0xFFFF) as u16 + 1;
    let pc = entry.cdw11 & 1;
    if pc != 1 {
        return Ok(status_tuple(status::lookup(0x02, Scope::Generic)?));
    }
    let mem = MemoryLocation {
        vaddr: identity(entry.prp1),
        iova: entry.prp1,
        size: entries as usize * core::mem::size_of::<CompletionEntry>(),
        client_tag: "nvsim_iocq",
        in_use: true,
        linked_pages: Vec::new(),
    };
    let cq = CompletionQueue::new(cqid, entries, mem)?;
    queues.holding_cqs.push((cqid, cq));
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

fn admin_create_iosq(entry: &SubmissionEntry, queues: &mut SimQueues) -> Result<(u8, u8)> {
    let sqid = (entry.cdw10 & 0xFFFF) as u16;
    let entries = ((entry.cdw10 >> 16) & 0xFFFF) as u16 + 1;
    let cqid = ((entry.cdw11 >> 16) & 0xFFFF) as u16;
    let pc = entry.cdw11 & 1;
    if pc != 1 {
        return Ok(status_tuple(status::lookup(0x02, Scope::Generic)?));
    }
    let Some(pos) = queues.holding_cqs.iter().position(|(id, _)| *id == cqid) else {
        return Ok(status_tuple(status::lookup(0x00, Scope::CreateIoSq)?));
    };
    let (_, cq) = queues.holding_cqs.remove(pos);
    let mem = MemoryLocation {
        vaddr: identity(entry.prp1),
        iova: entry.prp1,
        size: entries as usize * core::mem::size_of::<SubmissionEntry>(),
        client_tag: "nvsim_iosq",
        in_use: true,
        linked_pages: Vec::new(),
    };
    let sq = SubmissionQueue::new(sqid, cqid, entries, mem)?;
    queues.queues.add(sq, cq);
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

fn admin_delete_iosq(entry: &SubmissionEntry, queues: &mut SimQueues) -> Result<(u8, u8)> {
    let sqid = (entry.cdw10 & 0xFFFF) as u16;
    if sqid == 0 || queues.queues.get(Lookup::BySqid(sqid)).is_err() {
        return Ok(status_tuple(status::lookup(0x01, Scope::DeleteIoSq)?));
    }
    queues.queues.remove_sq(sqid);
    queues.device_heads.remove(&sqid);
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

fn admin_delete_iocq(entry: &SubmissionEntry, queues: &mut SimQueues) -> Result<(u8, u8)> {
    let cqid = (entry.cdw10 & 0xFFFF) as u16;
    if cqid == 0 || queues.queues.get(Lookup::ByCqid(cqid)).is_err() {
        return Ok(status_tuple(status::lookup(0x01, Scope::DeleteIoCq)?));
    }
    match queues.queues.remove_cq(cqid) {
        Ok(()) => Ok(status_tuple(status::lookup(0x00, Scope::Generic)?)),
        Err(_) => Ok(status_tuple(status::lookup(0x0C, Scope::DeleteIoCq)?)),
    }
}

/// LID 0x00 (Supported Log Pages): a 256-entry claim-all table, 4 bytes
/// each, honoring the byte offset from CDW12/CDW13. Not present in
/// `nvsim`; built directly from spec.md's description.
fn admin_get_log_page(entry: &SubmissionEntry, mps: usize) -> Result<(u8, u8)> {
    let lid = (entry.cdw10 & 0xFF) as u8;
    if lid != 0x00 {
        return Ok(status_tuple(status::lookup(0x09, Scope::GetLogPage)?));
    }
    let offset = entry.cdw12 as u64 | ((entry.cdw13 as u64) << 32);
    let mut table = vec![0u8; 256 * 4];
    for chunk in table.chunks_mut(4) {
        chunk[0] = 1; // LSUPP
    }
    let start = std::cmp::min(offset as usize, table.len());
    if start < table.len() {
        write_prp_data(entry.prp1, entry.prp2, mps, &table[start..])?;
    }
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

fn admin_format_nvm(entry: &SubmissionEntry, state: &mut SimState) -> Result<(u8, u8)> {
    match state.namespaces.get(&entry.nsid) {
        Some(ns) => {
            ns.format();
            Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
        }
        None => Ok(status_tuple(status::lookup(0x0B, Scope::Generic)?)),
    }
}

fn nvm_write(entry: &SubmissionEntry, state: &mut SimState, mps: usize) -> Result<(u8, u8)> {
    let Some(ns) = state.namespaces.get(&entry.nsid) else {
        return Ok(status_tuple(status::lookup(0x0B, Scope::Generic)?));
    };
    let slba = entry.cdw10 as u64 | ((entry.cdw11 as u64) << 32);
    let nlb = (entry.cdw12 & 0xFFFF) as u16;
    if slba + nlb as u64 + 1 > ns.num_lbas() {
        return Ok(status_tuple(status::lookup(0x80, Scope::Write)?));
    }
    let len = (nlb as usize + 1) * ns.block_size() as usize;
    let data = read_prp_data(entry.prp1, entry.prp2, mps, len)?;
    ns.write(slba, &data);
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

fn nvm_read(entry: &SubmissionEntry, state: &mut SimState, mps: usize) -> Result<(u8, u8)> {
    let Some(ns) = state.namespaces.get(&entry.nsid) else {
        return Ok(status_tuple(status::lookup(0x0B, Scope::Generic)?));
    };
    let slba = entry.cdw10 as u64 | ((entry.cdw11 as u64) << 32);
    let nlb = (entry.cdw12 & 0xFFFF) as u16;
    if slba + nlb as u64 + 1 > ns.num_lbas() {
        return Ok(status_tuple(status::lookup(0x80, Scope::Read)?));
    }
    let data = ns.read(slba, nlb);
    write_prp_data(entry.prp1, entry.prp2, mps, &data)?;
    Ok(status_tuple(status::lookup(0x00, Scope::Generic)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Controller, ControllerConfig};
    use std::sync::Arc as StdArc;

    fn harness() -> (StdArc<Simulator>, Controller) {
        let sim = Simulator::start(SimulatorConfig::default()).unwrap();
        let ctrl = Controller::with_identity_dma(
            sim.region(),
            sim.pci_gateway(),
            ControllerConfig::default(),
        )
        .unwrap();
        (sim, ctrl)
    }

    #[test]
    fn admin_bring_up_reaches_running() {
        let (_sim, mut ctrl) = harness();
        ctrl.cc_disable().unwrap();
        ctrl.init_admin_queues().unwrap();
        ctrl.cc_enable().unwrap();
        ctrl.identify().unwrap();
        assert_eq!(ctrl.model_number().unwrap(), "nvsim_0.1");
        assert_eq!(ctrl.serial_number().unwrap(), "EDDAE771");
        assert_eq!(ctrl.firmware_revision().unwrap(), "0.001");
    }

    #[test]
    fn write_then_read_round_trips_through_the_device() {
        let (_sim, mut ctrl) = harness();
        ctrl.cc_disable().unwrap();
        ctrl.init_admin_queues().unwrap();
        ctrl.cc_enable().unwrap();
        ctrl.identify().unwrap();
        ctrl.init_io_queues(1, 32).unwrap();

        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        ctrl.write(1, 0, payload.clone()).unwrap();
        let back = ctrl.read(1, 0, 7).unwrap();
        assert_eq!(back, payload);
    }
}
