//! Page ownership states
//!
//! The base state of a page lives in the software bits [56:55] of every
//! valid mapping, and for host RAM additionally in the vmemmap. The extra
//! flags below are meta-states that never appear in a PTE.

use bitflags::bitflags;

use crate::arch::aarch64::mm::pte::Prot;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageState: u8 {
        /// Owner granted access to someone else.
        const SHARED_OWNED = 1 << 0;
        /// Access borrowed from the owner.
        const SHARED_BORROWED = 1 << 1;
        /// No access at all.
        const NOPAGE = 1 << 2;
        /// Mapped with narrower permissions than the default.
        const RESTRICTED_PROT = 1 << 3;
        /// Host lost access to a page claimed by a hypervisor module.
        const MODULE_OWNED = 1 << 4;
    }
}

#[cold]
fn invalid_state(args: core::fmt::Arguments<'_>) -> ! {
    log::error!("{}", args);
    panic!("{}", args)
}

impl PageState {
    pub const OWNED: Self = Self::empty();

    /// Decode a raw tracker value. Unknown bits are an invariant violation.
    pub fn from_raw(bits: u8) -> Self {
        match Self::from_bits(bits) {
            Some(state) => state,
            None => invalid_state(format_args!("undefined page state {:#x}", bits)),
        }
    }

    /// State encoded in the SW bits of a mapping.
    pub fn from_prot(prot: Prot) -> Self {
        match (prot.contains(Prot::SW0), prot.contains(Prot::SW1)) {
            (false, false) => Self::OWNED,
            (true, false) => Self::SHARED_OWNED,
            (false, true) => Self::SHARED_BORROWED,
            (true, true) => invalid_state(format_args!("reserved page state in pte prot {:?}", prot)),
        }
    }

    /// Replace the SW bits of `prot` with this state.
    ///
    /// Only the three mappable states can be encoded.
    pub fn mkstate(self, prot: Prot) -> Prot {
        let base = prot.difference(Prot::SW0 | Prot::SW1);
        if self == Self::OWNED {
            base
        } else if self == Self::SHARED_OWNED {
            base | Prot::SW0
        } else if self == Self::SHARED_BORROWED {
            base | Prot::SW1
        } else {
            invalid_state(format_args!("page state {:?} cannot be encoded in a pte", self))
        }
    }

    /// Drop the restricted-permission qualifier.
    pub fn without_restriction(self) -> Self {
        self.difference(Self::RESTRICTED_PROT)
    }
}
