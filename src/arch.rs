// Architecture interface for the emberos kernel core.
//
// The core never touches registers, the TLB or the interrupt mask directly;
// a port implements `ArchOps` and the scheduler/fault paths call through it.

/// Callee-saved register context of a suspended process (AAPCS64).
///
/// `cpu_switch_to` on a real port stores x19-x28, the frame pointer, the
/// resume address and the stack pointer here when a process yields, and
/// reloads them when it is selected again. The core treats the contents as
/// an opaque blob; only `ArchOps::init_context` ever writes meaningful
/// values into a fresh one.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    /// Frame pointer (x29).
    pub fp: u64,
    /// Resume address (x30 on entry to the switch routine).
    pub pc: u64,
    /// Private stack pointer.
    pub sp: u64,
}

impl CpuContext {
    pub const fn zeroed() -> Self {
        Self {
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            pc: 0,
            sp: 0,
        }
    }
}

/// Low-level operations supplied by an architecture port.
pub trait ArchOps: Send + Sync {
    /// Prepare a fresh context so that, when first resumed, the process
    /// enters the port's trampoline, which calls `entry(arg)` and falls
    /// through to `exit()` when the entry function returns.
    fn init_context(&self, ctx: &mut CpuContext, entry: u64, arg: u64, stack_top: u64);

    /// Save the running context into `prev` and resume `next` exactly where
    /// it last yielded, on its own stack.
    ///
    /// # Safety
    /// Both pointers must refer to live PCB contexts, and the caller must
    /// hold interrupts disabled across the structural update of the current
    /// process and this call.
    unsafe fn switch(&self, prev: *mut CpuContext, next: *const CpuContext);

    /// Drop any cached translation for the page containing `virt`. Must be
    /// called after a mapping change or stale translations stay visible.
    fn invalidate_tlb_page(&self, virt: u64);

    /// Mask interrupts, returning whether they were previously enabled.
    fn disable_irqs(&self) -> bool;

    /// Restore the interrupt mask saved by `disable_irqs`.
    fn restore_irqs(&self, were_enabled: bool);

    /// Idle until the next interrupt. Ports map this to `wfi`.
    fn wait_for_interrupt(&self) {}
}

/// Run `f` with interrupts masked, restoring the previous mask afterwards.
///
/// Every spin-protected critical section in the core goes through this: on a
/// single core, taking a timer interrupt inside such a section could reenter
/// and deadlock against the same lock.
pub fn without_interrupts<R>(arch: &dyn ArchOps, f: impl FnOnce() -> R) -> R {
    let were_enabled = arch.disable_irqs();
    let result = f();
    arch.restore_irqs(were_enabled);
    result
}

/// Inert port used before a real architecture is wired up, and by the test
/// suite: context switches update kernel state only, the TLB and interrupt
/// mask operations do nothing.
pub struct NullArch;

impl ArchOps for NullArch {
    fn init_context(&self, ctx: &mut CpuContext, entry: u64, arg: u64, stack_top: u64) {
        // Same convention as a real port: the trampoline finds the entry
        // function in x19 and its argument in x20. There is no trampoline
        // to point pc at, so a NullArch context is never actually resumed.
        ctx.x19 = entry;
        ctx.x20 = arg;
        ctx.fp = stack_top;
        ctx.sp = stack_top;
        ctx.pc = 0;
    }

    unsafe fn switch(&self, _prev: *mut CpuContext, _next: *const CpuContext) {}

    fn invalidate_tlb_page(&self, _virt: u64) {}

    fn disable_irqs(&self) -> bool {
        false
    }

    fn restore_irqs(&self, _were_enabled: bool) {}
}

pub static NULL_ARCH: NullArch = NullArch;
