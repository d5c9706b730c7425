//! PCIe configuration space overlay and capability walker.
//!
//! Offsets from spec.md §6. Field access always goes through the indirect
//! `ByteGateway` path (read-modify-write), since config space is not
//! mmapped. Capability discovery walks the standard list from `CAP.CP`
//! (offset 0x34) and the extended list from the fixed offset 0x100,
//! matching the teacher's PCI scan style in `drivers/nvme/pci.rs`
//! (`pci_read32`/`pci_write32`) generalized to the byte-gateway interface.

use super::RegField;
use crate::gateway::ByteGateway;

pub const OFFSET_ID: u64 = 0x00;
pub const OFFSET_CMD: u64 = 0x04;
pub const OFFSET_STS: u64 = 0x06;
pub const OFFSET_RID: u64 = 0x08;
pub const OFFSET_CC: u64 = 0x09;
pub const OFFSET_CLS: u64 = 0x0C;
pub const OFFSET_MLT: u64 = 0x0D;
pub const OFFSET_HTYPE: u64 = 0x0E;
pub const OFFSET_BIST: u64 = 0x0F;
pub const OFFSET_BAR0: u64 = 0x10;
pub const OFFSET_CCPTR: u64 = 0x28;
pub const OFFSET_SS: u64 = 0x2C;
pub const OFFSET_EROM: u64 = 0x30;
pub const OFFSET_CAP: u64 = 0x34;
pub const OFFSET_INTR: u64 = 0x3C;
pub const OFFSET_MGNT: u64 = 0x3E;
pub const OFFSET_MLAT: u64 = 0x3F;
pub const OFFSET_CAPS_START: u64 = 0x40;
pub const OFFSET_EXT_CAPS_START: u64 = 0x100;

pub mod cmd {
    use super::RegField;
    pub const MEMORY_SPACE: RegField = RegField::new(0, 1, 1);
    pub const BUS_MASTER: RegField = RegField::new(0, 2, 1);
}

/// Standard capability IDs this crate recognizes by name; anything else
/// maps to [`CapabilityKind::Generic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardCapabilityId {
    PowerManagement = 0x01,
    Msi = 0x05,
    PciExpress = 0x10,
    MsiX = 0x11,
}

impl StandardCapabilityId {
    fn from_u8(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::PowerManagement),
            0x05 => Some(Self::Msi),
            0x10 => Some(Self::PciExpress),
            0x11 => Some(Self::MsiX),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedCapabilityId {
    AdvancedErrorReporting = 0x01,
    DeviceSerialNumber = 0x03,
}

impl ExtendedCapabilityId {
    fn from_u16(id: u16) -> Option<Self> {
        match id {
            0x01 => Some(Self::AdvancedErrorReporting),
            0x03 => Some(Self::DeviceSerialNumber),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Standard(StandardCapabilityId),
    Extended(ExtendedCapabilityId),
    Generic(u16),
}

/// One discovered capability, bound to the offset it was found at so that
/// subsequent field access on its sub-structure resolves correctly.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub kind: CapabilityKind,
    pub base_offset: u64,
}

/// Overlay over PCI configuration space, plus the capability walker.
pub struct PciRegisters<'a> {
    gateway: &'a dyn ByteGateway,
}

impl<'a> PciRegisters<'a> {
    pub fn new(gateway: &'a dyn ByteGateway) -> Self {
        Self { gateway }
    }

    fn read_u16(&self, offset: u64) -> u16 {
        let b = crate::gateway::RegisterIo::read_bytes(self.gateway, offset, 2);
        u16::from_le_bytes([b[0], b[1]])
    }

    fn read_u32(&self, offset: u64) -> u32 {
        let b = crate::gateway::RegisterIo::read_bytes(self.gateway, offset, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn vendor_device_id(&self) -> u32 {
        self.read_u32(OFFSET_ID)
    }

    pub fn set_bus_master_and_memory_space(&self) {
        let mut cmd = self.read_u16(OFFSET_CMD);
        cmd |= 0b0000_0110; // memory space + bus master
        crate::gateway::RegisterIo::write_bytes(self.gateway, OFFSET_CMD, &cmd.to_le_bytes());
    }

    pub fn clear_bus_master(&self) {
        let mut cmd = self.read_u16(OFFSET_CMD);
        cmd &= !0b0000_0100;
        crate::gateway::RegisterIo::write_bytes(self.gateway, OFFSET_CMD, &cmd.to_le_bytes());
    }

    /// Walk the standard capability list starting at `CAP.CP`, then the
    /// extended list fixed at 0x100. Stops the standard walk at
    /// `next_ptr == 0`; the extended walk is bounded defensively at 64
    /// hops to tolerate a malformed/cyclic list without looping forever
    /// (real hardware should never produce one).
    pub fn walk_capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        let mut ptr = self.read_u16(OFFSET_CAP) as u64 & 0xFF;
        let mut hops = 0;
        while ptr != 0 && hops < 64 {
            let id = crate::gateway::RegisterIo::read_bytes(self.gateway, ptr, 1)[0];
            let next = crate::gateway::RegisterIo::read_bytes(self.gateway, ptr + 1, 1)[0];
            let kind = match StandardCapabilityId::from_u8(id) {
                Some(k) => CapabilityKind::Standard(k),
                None => CapabilityKind::Generic(id as u16),
            };
            caps.push(Capability {
                kind,
                base_offset: ptr,
            });
            ptr = next as u64;
            hops += 1;
        }

        let mut ext_ptr = OFFSET_EXT_CAPS_START;
        hops = 0;
        while ext_ptr != 0 && hops < 64 {
            let header = self.read_u32(ext_ptr);
            if header == 0 {
                break;
            }
            let id = (header & 0xFFFF) as u16;
            let next = ((header >> 20) & 0xFFF) as u64;
            let kind = match ExtendedCapabilityId::from_u16(id) {
                Some(k) => CapabilityKind::Extended(k),
                None => CapabilityKind::Generic(id),
            };
            caps.push(Capability {
                kind,
                base_offset: ext_ptr,
            });
            ext_ptr = next;
            hops += 1;
        }

        caps
    }

    /// Set the "Initiate Function Level Reset" bit on the PCI Express
    /// capability's Device Control register, if present. Used by the `flr`
    /// CLI collaborator (out of scope itself, but this is the hook it
    /// calls into).
    pub fn initiate_flr(&self) -> bool {
        let caps = self.walk_capabilities();
        let Some(pcie_cap) = caps
            .iter()
            .find(|c| c.kind == CapabilityKind::Standard(StandardCapabilityId::PciExpress))
        else {
            return false;
        };
        // Device Control register is at capability offset +0x08, bit 15 is
        // Initiate Function Level Reset.
        let devctl_offset = pcie_cap.base_offset + 0x08;
        let mut devctl = self.read_u16(devctl_offset);
        devctl |= 1 << 15;
        crate::gateway::RegisterIo::write_bytes(
            self.gateway,
            devctl_offset,
            &devctl.to_le_bytes(),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::VecGateway;

    fn gateway_with_cap_chain() -> VecGateway {
        let gw = VecGateway::new(0x200);
        // CAP pointer at 0x34 -> first cap at 0x40
        crate::gateway::RegisterIo::write_bytes(&gw, super::OFFSET_CAP, &[0x40, 0, 0, 0]);
        // cap at 0x40: id=0x01 (power mgmt), next=0x50
        crate::gateway::RegisterIo::write_bytes(&gw, 0x40, &[0x01, 0x50]);
        // cap at 0x50: id=0x11 (MSI-X), next=0x00 (end)
        crate::gateway::RegisterIo::write_bytes(&gw, 0x50, &[0x11, 0x00]);
        gw
    }

    #[test]
    fn standard_capability_walk_terminates_and_maps_ids() {
        let gw = gateway_with_cap_chain();
        let pci = PciRegisters::new(&gw);
        let caps = pci.walk_capabilities();
        let standard: Vec<_> = caps
            .iter()
            .filter(|c| matches!(c.kind, CapabilityKind::Standard(_)))
            .collect();
        assert_eq!(standard.len(), 2);
        assert_eq!(
            standard[0].kind,
            CapabilityKind::Standard(StandardCapabilityId::PowerManagement)
        );
        assert_eq!(standard[0].base_offset, 0x40);
        assert_eq!(
            standard[1].kind,
            CapabilityKind::Standard(StandardCapabilityId::MsiX)
        );
    }

    #[test]
    fn unknown_cap_id_is_generic() {
        let gw = VecGateway::new(0x200);
        crate::gateway::RegisterIo::write_bytes(&gw, super::OFFSET_CAP, &[0x40, 0, 0, 0]);
        crate::gateway::RegisterIo::write_bytes(&gw, 0x40, &[0xEE, 0x00]);
        let pci = PciRegisters::new(&gw);
        let caps = pci.walk_capabilities();
        assert!(matches!(
            caps.iter().find(|c| c.base_offset == 0x40).unwrap().kind,
            CapabilityKind::Generic(0xEE)
        ));
    }

    #[test]
    fn bus_master_and_memory_space_bits_set() {
        let gw = VecGateway::new(0x200);
        let pci = PciRegisters::new(&gw);
        pci.set_bus_master_and_memory_space();
        assert_eq!(pci.read_u16(OFFSET_CMD) & 0b110, 0b110);
    }
}
