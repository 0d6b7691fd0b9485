// Page-fault handling: demand paging.
//
// The exception-entry collaborator decodes the syndrome register into a
// `FaultClass` and hands it over together with the faulting address. When
// the handler returns `Resolved`, the entry path resumes the faulted
// instruction and the retry succeeds against the fresh mapping.

use log::{debug, error};

use crate::arch::ArchOps;
use crate::memory::pmm::align_page_down;
use crate::memory::vmm::{self, PteFlags};
use crate::memory::{MemoryManager, VirtAddr};

/// Classification of a synchronous data abort, as decoded by the exception
/// entry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// Translation-level data abort taken from unprivileged (EL0)
    /// execution: the page is unmapped but the access is otherwise
    /// legitimate.
    UserTranslation,
    /// Translation-level data abort taken from privileged (EL1) execution.
    KernelTranslation,
    /// Permission violation, alignment or address-size fault. Never
    /// resolvable by mapping a page.
    Protection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A page was mapped; resume and retry the faulting instruction.
    Resolved,
    /// Unresolvable: the faulting process must be terminated. The kernel
    /// itself carries on.
    Fatal,
}

/// Demand-paging policy for a data abort at `far`.
///
/// Translation faults get a fresh zeroed page mapped read/write at the
/// privilege level that faulted; anything else, or resource exhaustion, is
/// fatal for the faulting process only.
pub fn handle_fault(
    mem: &mut MemoryManager,
    arch: &dyn ArchOps,
    far: VirtAddr,
    class: FaultClass,
) -> FaultOutcome {
    let user = match class {
        FaultClass::UserTranslation => true,
        FaultClass::KernelTranslation => false,
        FaultClass::Protection => {
            error!("fault: invalid access at {:#x}", far);
            return FaultOutcome::Fatal;
        }
    };

    let page = match mem.pmm.alloc_page() {
        Some(page) => page,
        None => {
            error!("fault: no physical pages left for {:#x}", far);
            return FaultOutcome::Fatal;
        }
    };

    let virt = align_page_down(far);
    let mut flags = PteFlags::ATTR_NORMAL | PteFlags::INNER_SHARE | PteFlags::NO_EXEC;
    if user {
        flags |= PteFlags::USER;
    }

    let root = mem.root();
    match vmm::map_page(&mut mem.pmm, root, virt, page, flags) {
        Ok(()) => {
            arch.invalidate_tlb_page(virt);
            debug!("fault: mapped {:#x} -> {:#x} on demand", virt, page);
            FaultOutcome::Resolved
        }
        Err(err) => {
            // The leaf page was never linked in; hand it back.
            mem.pmm.free_page(page);
            error!("fault: mapping {:#x} failed: {:?}", virt, err);
            FaultOutcome::Fatal
        }
    }
}
