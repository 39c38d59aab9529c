//! Host protection changes requested by hypervisor modules
//!
//! A module may restrict the host's access to RAM the host still fully
//! owns, or change it again on pages it restricted earlier. Pages taken
//! away completely are annotated as owned by [`PKVM_ID_PROTECTED`]. MMIO
//! has no vmemmap, so changes there are applied without state checks.

use crate::arch::aarch64::defs::PAGE_SIZE;
use crate::arch::aarch64::mm::Prot;
use crate::error::{Error, Result};
use crate::mem_protect::component::PKVM_ID_PROTECTED;
use crate::mem_protect::state::PageState;
use crate::mem_protect::{pfn_range, MemProtect};

/// Attributes a module may ask for.
pub const MODULE_PROT_ALLOWLIST: Prot = Prot::RWX
    .union(Prot::DEVICE)
    .union(Prot::NORMAL_NC)
    .union(Prot::PXN)
    .union(Prot::UXN);

impl MemProtect {
    /// Map `nr_pages` host pages at `pfn` with `prot`, or unmap them when
    /// `prot` is empty.
    ///
    /// # Errors
    /// * `Inval` - `prot` outside [`MODULE_PROT_ALLOWLIST`]
    /// * `Perm` - the range crosses a RAM/MMIO boundary, or mixes
    ///   module-owned pages with anything else
    pub fn module_change_host_page_prot(&self, pfn: u64, prot: Prot, nr_pages: u64) -> Result<()> {
        if !MODULE_PROT_ALLOWLIST.contains(prot) || nr_pages == 0 {
            return Err(Error::Inval);
        }

        let (addr, size) = pfn_range(pfn, nr_pages)?;
        let (region, range) = self.layout.regions.find_mem_range(addr);
        if addr + size > range.end {
            return Err(Error::Perm);
        }
        let is_memory = region.is_some();

        let mut cx = self.lock_host();
        let layout = cx.layout();
        let host = cx.host();

        if is_memory {
            if host.vmemmap.host_state(addr).contains(PageState::MODULE_OWNED) {
                let all_module_owned = (1..nr_pages).all(|i| {
                    host.vmemmap
                        .host_state(addr + i * PAGE_SIZE)
                        .contains(PageState::MODULE_OWNED)
                });
                if !all_module_owned {
                    return Err(Error::Perm);
                }
            } else {
                host.check_page_state_in(layout, addr, size, PageState::OWNED, region)?;
            }
        }

        let ret = if prot.is_empty() {
            host.set_owner_tagged(layout, addr, size, PKVM_ID_PROTECTED, is_memory, PageState::MODULE_OWNED)
        } else {
            host.idmap_locked(layout, addr, size, prot)
        };
        if let Err(err) = ret {
            log::warn!(
                "module prot change [{:#x}, {:#x}) -> {:?} failed: {}",
                addr,
                addr + size,
                prot,
                err
            );
            return Err(err);
        }

        if is_memory && !prot.is_empty() {
            let state = if prot == Prot::RWX {
                PageState::OWNED
            } else {
                PageState::MODULE_OWNED
            };
            host.vmemmap.set_host_state(addr, size, state);
        }
        Ok(())
    }
}
