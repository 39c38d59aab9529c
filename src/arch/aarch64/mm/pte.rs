//! Stage-2 descriptor encoding
//!
//! Page-table entries are handled as [`Pte`] everywhere above this file.
//! The raw u64 layout only exists where a table slot is read or written.

use bitflags::bitflags;

use crate::arch::aarch64::defs::*;

bitflags! {
    /// Abstract permission and attribute set of a leaf mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u64 {
        const X = 1 << 0;
        const W = 1 << 1;
        const R = 1 << 2;
        const DEVICE = 1 << 3;
        const NORMAL_NC = 1 << 4;
        const PXN = 1 << 5;
        const UXN = 1 << 6;
        const SW0 = PTE_SW0;
        const SW1 = PTE_SW1;

        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

/// Default host mapping of RAM.
pub const PKVM_HOST_MEM_PROT: Prot = Prot::RWX;
/// Default host mapping of device memory.
pub const PKVM_HOST_MMIO_PROT: Prot = Prot::RW.union(Prot::DEVICE);
/// Hyp linear-map defaults.
pub const PAGE_HYP: Prot = Prot::RW;
pub const PAGE_HYP_DEVICE: Prot = Prot::RW.union(Prot::DEVICE);

/// Decoded view of one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pte {
    /// All-zero slot.
    Invalid,
    /// No translation; the page belongs to the component with this id.
    Owned(u8),
    /// No translation; guest declared the IPA as MMIO it may touch.
    MmioGuard,
    /// Next-level table.
    Table(u64),
    /// Block or page mapping.
    Leaf { phys: u64, prot: Prot },
}

impl Pte {
    pub fn decode(raw: u64, level: u32) -> Self {
        if raw == 0 {
            return Pte::Invalid;
        }
        if raw & PTE_VALID == 0 {
            if raw == INVALID_PTE_MMIO_NOTE {
                return Pte::MmioGuard;
            }
            return Pte::Owned(((raw & INVALID_PTE_OWNER_MASK) >> INVALID_PTE_OWNER_SHIFT) as u8);
        }
        if is_table(raw, level) {
            return Pte::Table(raw & PTE_ADDR_MASK);
        }
        Pte::Leaf {
            phys: raw & PTE_ADDR_MASK,
            prot: leaf_prot(raw),
        }
    }

    /// Raw descriptor for a slot at `level`.
    pub fn encode(self, level: u32) -> u64 {
        match self {
            Pte::Invalid => 0,
            Pte::Owned(id) => (id as u64) << INVALID_PTE_OWNER_SHIFT,
            Pte::MmioGuard => INVALID_PTE_MMIO_NOTE,
            Pte::Table(pa) => (pa & PTE_ADDR_MASK) | PTE_VALID | PTE_TABLE,
            Pte::Leaf { phys, prot } => leaf_raw(phys, prot, level),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Pte::Table(_) | Pte::Leaf { .. })
    }
}

#[inline]
pub fn pte_valid(raw: u64) -> bool {
    raw & PTE_VALID != 0
}

/// Table descriptor test. At the last level bit 1 means "page" instead.
#[inline]
pub fn is_table(raw: u64, level: u32) -> bool {
    level < LAST_LEVEL && raw & (PTE_VALID | PTE_TABLE) == (PTE_VALID | PTE_TABLE)
}

#[inline]
pub fn pte_to_phys(raw: u64) -> u64 {
    raw & PTE_ADDR_MASK
}

/// Permissions and SW bits of a valid leaf.
pub fn leaf_prot(raw: u64) -> Prot {
    let mut prot = Prot::empty();

    if raw & PTE_S2AP_R != 0 {
        prot |= Prot::R;
    }
    if raw & PTE_S2AP_W != 0 {
        prot |= Prot::W;
    }
    match (raw & PTE_XN_MASK) >> PTE_XN_SHIFT {
        XN_NONE => prot |= Prot::X,
        XN_PXN => prot |= Prot::X | Prot::PXN,
        XN_UXN => prot |= Prot::X | Prot::UXN,
        _ => {}
    }
    match (raw & PTE_MEMATTR_MASK) >> PTE_MEMATTR_SHIFT {
        MEMATTR_NORMAL_WB => {}
        MEMATTR_NORMAL_NC => prot |= Prot::NORMAL_NC,
        _ => prot |= Prot::DEVICE,
    }
    prot | Prot::from_bits_truncate(raw & PTE_SW_MASK)
}

fn leaf_raw(phys: u64, prot: Prot, level: u32) -> u64 {
    let mut raw = (phys & PTE_ADDR_MASK) | PTE_VALID | PTE_AF;

    if level == LAST_LEVEL {
        raw |= PTE_TABLE;
    }

    let memattr = if prot.contains(Prot::DEVICE) {
        MEMATTR_DEVICE_NGNRE
    } else if prot.contains(Prot::NORMAL_NC) {
        raw |= PTE_SH_INNER;
        MEMATTR_NORMAL_NC
    } else {
        raw |= PTE_SH_INNER;
        MEMATTR_NORMAL_WB
    };
    raw |= memattr << PTE_MEMATTR_SHIFT;

    if prot.contains(Prot::R) {
        raw |= PTE_S2AP_R;
    }
    if prot.contains(Prot::W) {
        raw |= PTE_S2AP_W;
    }

    let xn = if !prot.contains(Prot::X) {
        XN_ALL
    } else if prot.contains(Prot::PXN) {
        XN_PXN
    } else if prot.contains(Prot::UXN) {
        XN_UXN
    } else {
        XN_NONE
    };
    raw |= xn << PTE_XN_SHIFT;

    raw | (prot.bits() & PTE_SW_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrip_keeps_state_bits() {
        let prot = Prot::RWX | Prot::SW0;
        let raw = Pte::Leaf { phys: 0x4000_1000, prot }.encode(LAST_LEVEL);
        assert_eq!(Pte::decode(raw, LAST_LEVEL), Pte::Leaf { phys: 0x4000_1000, prot });
    }

    #[test]
    fn page_descriptor_is_not_a_table() {
        let raw = Pte::Leaf { phys: 0x1000, prot: Prot::R }.encode(LAST_LEVEL);
        assert!(!is_table(raw, LAST_LEVEL));
        assert!(is_table(Pte::Table(0x2000).encode(2), 2));
    }

    #[test]
    fn annotations_are_invalid() {
        assert!(!pte_valid(Pte::Owned(3).encode(3)));
        assert_eq!(Pte::decode(Pte::Owned(255).encode(2), 2), Pte::Owned(255));
        assert_eq!(Pte::decode(INVALID_PTE_MMIO_NOTE, 3), Pte::MmioGuard);
    }
}
