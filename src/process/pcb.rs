// Process Control Blocks and the fixed-slot process table.

use core::ptr::NonNull;

use arrayvec::ArrayString;
use log::{debug, info};

use crate::arch::{ArchOps, CpuContext};
use crate::memory::heap::KernelHeap;

pub type Pid = usize;

/// Size of the PCB arena; pid = slot index, stable for the process's
/// lifetime.
pub const MAX_PROCESS: usize = 64;

/// Every process runs on a 4 KiB stack carved from the kernel heap.
pub const STACK_SIZE: usize = 4096;

pub const NAME_LEN: usize = 15;

/// Slot 0 is the kernel's own idle process: already running at boot on the
/// boot stack, always eligible as the reschedule fallback, never
/// quantum-limited.
pub const IDLE_PID: Pid = 0;

/// Entry function of a new process. The port's trampoline calls
/// `entry(arg)` and routes a normal return into `exit()`.
pub type ProcessEntry = extern "C" fn(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot free for reuse.
    Unused,
    /// Eligible, waiting for the CPU.
    Ready,
    /// Currently executing. Exactly one PCB is in this state at any
    /// instant.
    Running,
    /// Suspended; ignored by the scheduler until woken.
    Blocked,
    /// Finished; PCB persists until the reaper frees it.
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    None,
    /// Blocked until `wake_up_time`; the timer tick wakes it.
    Sleep,
    /// Parked on a semaphore's wait queue; only `signal` wakes it.
    Wait,
}

#[derive(Debug)]
pub struct Pcb {
    /// Saved register context; written by the context-switch primitive.
    pub context: CpuContext,
    pub state: ProcessState,
    pub pid: Pid,
    /// Lower = more urgent. Aged down while waiting, penalized up when
    /// selected.
    pub priority: i32,
    /// Remaining ticks before preemption; refilled on selection.
    pub quantum: u32,
    /// Absolute tick at which a SLEEP-blocked process becomes eligible.
    pub wake_up_time: u64,
    pub block_reason: BlockReason,
    /// Intrusive wait-queue link. Meaningful only while
    /// `block_reason == Wait`; the scheduler never follows it.
    pub next: Option<Pid>,
    /// Owning pointer to the heap block backing this process's stack.
    /// Released exactly once, by the reaper.
    pub stack_addr: Option<NonNull<u8>>,
    pub cpu_time: u64,
    pub exit_code: Option<i32>,
    pub name: ArrayString<NAME_LEN>,
}

impl Pcb {
    fn new(pid: Pid) -> Self {
        Self {
            context: CpuContext::zeroed(),
            state: ProcessState::Unused,
            pid,
            priority: 0,
            quantum: 0,
            wake_up_time: 0,
            block_reason: BlockReason::None,
            next: None,
            stack_addr: None,
            cpu_time: 0,
            exit_code: None,
            name: ArrayString::new(),
        }
    }

    fn reset(&mut self) {
        let pid = self.pid;
        *self = Pcb::new(pid);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// All 64 slots are occupied.
    TableFull,
    /// The heap could not supply a stack; no slot was consumed.
    StackAllocationFailed,
}

/// Fixed arena of PCBs. Slots are never deallocated; "deletion" is the
/// UNUSED state flag.
pub struct ProcessTable {
    pub(crate) slots: [Pcb; MAX_PROCESS],
    pub(crate) current: Pid,
    live: usize,
}

// Stack pointers are plain addresses into the kernel heap; access to the
// table is serialized by the kernel lock on the single core.
unsafe impl Send for ProcessTable {}

impl ProcessTable {
    /// Fresh table with the idle process installed in slot 0, RUNNING on
    /// the boot stack.
    pub fn new() -> Self {
        let mut table = Self {
            slots: core::array::from_fn(Pcb::new),
            current: IDLE_PID,
            live: 0,
        };

        let idle = &mut table.slots[IDLE_PID];
        idle.state = ProcessState::Running;
        idle.priority = 0;
        idle.name.push_str("kernel");
        table.live = 1;
        table
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    pub fn current(&self) -> &Pcb {
        &self.slots[self.current]
    }

    pub(crate) fn current_mut(&mut self) -> &mut Pcb {
        &mut self.slots[self.current]
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.get(pid)
    }

    pub fn state_of(&self, pid: Pid) -> Option<ProcessState> {
        self.slots.get(pid).map(|p| p.state)
    }

    /// Number of slots not in the UNUSED state (idle included).
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Create a process in the first UNUSED slot: allocate its stack,
    /// initialize the PCB to READY, and prepare a context that resumes at
    /// the port's entry trampoline. On failure nothing is consumed.
    pub fn create(
        &mut self,
        heap: &mut KernelHeap,
        arch: &dyn ArchOps,
        entry: ProcessEntry,
        arg: usize,
        priority: i32,
        name: &str,
    ) -> Result<Pid, ProcessError> {
        let pid = self
            .slots
            .iter()
            .position(|p| p.state == ProcessState::Unused)
            .ok_or(ProcessError::TableFull)?;

        let stack = heap
            .allocate(STACK_SIZE)
            .ok_or(ProcessError::StackAllocationFailed)?;
        let stack_top = stack.as_ptr() as u64 + STACK_SIZE as u64;

        let pcb = &mut self.slots[pid];
        pcb.reset();
        pcb.state = ProcessState::Ready;
        pcb.priority = priority;
        pcb.stack_addr = Some(stack);
        for ch in name.chars() {
            if pcb.name.try_push(ch).is_err() {
                break;
            }
        }
        arch.init_context(&mut pcb.context, entry as usize as u64, arg as u64, stack_top);

        self.live += 1;
        debug!("process: created pid {} ({})", pid, self.slots[pid].name);
        Ok(pid)
    }

    /// Mark the current process ZOMBIE. The caller must follow up with a
    /// `schedule()`; a zombie is never selected again.
    pub(crate) fn mark_current_zombie(&mut self, exit_code: i32) {
        let pcb = self.current_mut();
        pcb.state = ProcessState::Zombie;
        pcb.exit_code = Some(exit_code);
        info!(
            "process: pid {} ({}) exited with code {}",
            pcb.pid, pcb.name, exit_code
        );
    }

    /// The reaper: release every zombie's stack and return its slot to
    /// UNUSED. Runs from the idle loop. This is the only place stack
    /// ownership is released, and `Option::take` makes it happen at most
    /// once per slot.
    pub fn free_zombies(&mut self, heap: &mut KernelHeap) -> usize {
        let mut reaped = 0;
        for pcb in self.slots.iter_mut() {
            if pcb.state != ProcessState::Zombie {
                continue;
            }
            if let Some(stack) = pcb.stack_addr.take() {
                unsafe { heap.free(stack) };
            }
            pcb.reset();
            self.live -= 1;
            reaped += 1;
        }
        if reaped > 0 {
            debug!("process: reaped {} zombie(s)", reaped);
        }
        reaped
    }

    /// Test hook: place a READY process in a slot without allocating a
    /// stack.
    #[cfg(test)]
    pub(crate) fn seed(&mut self, pid: Pid, priority: i32) {
        let pcb = &mut self.slots[pid];
        assert_eq!(pcb.state, ProcessState::Unused);
        pcb.state = ProcessState::Ready;
        pcb.priority = priority;
        self.live += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::NULL_ARCH;
    use crate::memory::testing::leak_region;

    extern "C" fn noop(_arg: usize) {}

    fn heap(bytes: usize) -> KernelHeap {
        let start = leak_region(bytes) as usize;
        let mut heap = KernelHeap::new();
        unsafe { heap.init(start, start + bytes) };
        heap
    }

    #[test]
    fn idle_occupies_slot_zero() {
        let table = ProcessTable::new();
        assert_eq!(table.current_pid(), IDLE_PID);
        assert_eq!(table.state_of(IDLE_PID), Some(ProcessState::Running));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn create_takes_first_unused_slot() {
        let mut table = ProcessTable::new();
        let mut heap = heap(64 * 1024);

        let pid = table
            .create(&mut heap, &NULL_ARCH, noop, 7, 5, "worker")
            .unwrap();
        assert_eq!(pid, 1);

        let pcb = table.get(pid).unwrap();
        assert_eq!(pcb.state, ProcessState::Ready);
        assert_eq!(pcb.priority, 5);
        assert_eq!(pcb.quantum, 0);
        assert_eq!(pcb.block_reason, BlockReason::None);
        assert_eq!(pcb.name.as_str(), "worker");
        // NullArch convention: entry in x19, argument in x20.
        assert_eq!(pcb.context.x19, noop as usize as u64);
        assert_eq!(pcb.context.x20, 7);
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn long_names_are_truncated() {
        let mut table = ProcessTable::new();
        let mut heap = heap(64 * 1024);

        let pid = table
            .create(&mut heap, &NULL_ARCH, noop, 0, 1, "a-very-long-process-name")
            .unwrap();
        assert_eq!(table.get(pid).unwrap().name.len(), NAME_LEN);
    }

    #[test]
    fn full_table_is_reported() {
        let mut table = ProcessTable::new();
        let mut heap = heap(512 * 1024);

        for _ in 0..MAX_PROCESS - 1 {
            table.create(&mut heap, &NULL_ARCH, noop, 0, 1, "p").unwrap();
        }
        assert_eq!(
            table.create(&mut heap, &NULL_ARCH, noop, 0, 1, "p"),
            Err(ProcessError::TableFull)
        );
    }

    #[test]
    fn stack_failure_leaves_no_partial_state() {
        let mut table = ProcessTable::new();
        // Too small for even one stack.
        let mut heap = heap(1024);

        assert_eq!(
            table.create(&mut heap, &NULL_ARCH, noop, 0, 1, "p"),
            Err(ProcessError::StackAllocationFailed)
        );
        assert_eq!(table.state_of(1), Some(ProcessState::Unused));
        assert_eq!(table.live_count(), 1);
    }

    #[test]
    fn reaper_frees_stack_once_and_recycles_slot() {
        let mut table = ProcessTable::new();
        let mut heap = heap(64 * 1024);
        let free_before = heap.free_bytes();

        let pid = table.create(&mut heap, &NULL_ARCH, noop, 0, 1, "doomed").unwrap();
        table.current = pid;
        table.slots[pid].state = ProcessState::Running;
        table.mark_current_zombie(0);
        table.current = IDLE_PID;

        assert_eq!(table.free_zombies(&mut heap), 1);
        assert_eq!(table.state_of(pid), Some(ProcessState::Unused));
        assert_eq!(table.live_count(), 1);
        assert_eq!(heap.free_bytes(), free_before);

        // A second pass finds nothing; the stack is not freed twice.
        assert_eq!(table.free_zombies(&mut heap), 0);
        assert_eq!(heap.free_bytes(), free_before);

        // The slot is reusable.
        assert_eq!(
            table.create(&mut heap, &NULL_ARCH, noop, 0, 1, "reborn"),
            Ok(pid)
        );
    }
}
