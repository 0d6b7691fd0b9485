// Scheduler: priority selection with aging and penalty, round-robin
// quantum, timer-driven preemption and sleep/wake.

use log::warn;

use crate::arch::{ArchOps, CpuContext};
use crate::process::pcb::{BlockReason, Pid, ProcessState, ProcessTable, IDLE_PID};

/// Ticks a freshly selected (non-idle) process may run before the tick
/// handler raises the deferred-reschedule flag.
pub const DEFAULT_QUANTUM: u32 = 5;

/// Added to a process's priority on selection, so having just waited does
/// not let it monopolize future selections.
pub const PRIORITY_PENALTY: i32 = 2;

/// No penalty is applied at or above this value, bounding the climb.
pub const PRIORITY_CEILING: i32 = 10;

/// Kernel-wide scheduling state: the process table, the global tick
/// counter and the deferred-reschedule flag, grouped in one place. The
/// tick counter is written only from the timer-interrupt level, the flag
/// is raised there and consumed by `schedule()`.
pub struct Scheduler {
    pub(crate) table: ProcessTable,
    ticks: u64,
    need_resched: bool,
    switches: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            table: ProcessTable::new(),
            ticks: 0,
            need_resched: false,
            switches: 0,
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    /// Global tick count since boot.
    pub fn now(&self) -> u64 {
        self.ticks
    }

    /// Whether a preemption is pending. The interrupt-return path polls
    /// this and calls `schedule()` outside interrupt context when set.
    pub fn reschedule_pending(&self) -> bool {
        self.need_resched
    }

    pub fn context_switches(&self) -> u64 {
        self.switches
    }

    /// Timer-tick bookkeeping. Runs in interrupt context and therefore
    /// never calls `schedule()` itself; preemption is requested through
    /// the deferred flag only.
    pub fn timer_tick(&mut self) {
        self.ticks += 1;

        let current = self.table.current_pid();
        let pcb = &mut self.table.slots[current];
        if pcb.state == ProcessState::Running {
            pcb.cpu_time += 1;

            if current != IDLE_PID {
                pcb.quantum = pcb.quantum.saturating_sub(1);
                if pcb.quantum == 0 {
                    self.need_resched = true;
                }
            }
        }

        // Wake sleepers whose deadline has arrived. WAIT blockers are
        // woken by sem_signal, never here.
        let now = self.ticks;
        let mut woke = false;
        for pcb in self.table.slots.iter_mut() {
            if pcb.state == ProcessState::Blocked
                && pcb.block_reason == BlockReason::Sleep
                && pcb.wake_up_time <= now
            {
                pcb.state = ProcessState::Ready;
                pcb.block_reason = BlockReason::None;
                woke = true;
            }
        }

        // The idle process has no quantum to exhaust, so a wake-up (or any
        // READY work while idle runs) must raise the flag itself or it
        // would never be consumed.
        if woke
            || (current == IDLE_PID
                && self
                    .table
                    .slots
                    .iter()
                    .any(|p| p.state == ProcessState::Ready))
        {
            self.need_resched = true;
        }
    }

    /// Pick and switch to the most urgent process. Called voluntarily
    /// (sleep, semaphore block, exit) or from the interrupt-return path
    /// when the deferred flag is set.
    ///
    /// Interrupts stay masked across the structural update and the switch
    /// itself; the new process re-enables them on its own path.
    pub fn schedule(&mut self, arch: &dyn ArchOps) {
        let were_enabled = arch.disable_irqs();
        if let Some((prev, next)) = self.prepare_switch() {
            unsafe {
                arch.switch(prev, next);
            }
        }
        arch.restore_irqs(were_enabled);
    }

    /// Selection and table update only, returning the context pair to hand
    /// to `ArchOps::switch` when the CPU must actually move.
    ///
    /// Split from `schedule` so a caller that reaches the scheduler
    /// through a lock can release it between the table update and the
    /// switch: a process must never be suspended while it still owns a
    /// lock that the context responsible for waking it would need. The
    /// caller keeps IRQs masked from before this call until after the
    /// switch, and the returned pointers stay valid for that window (PCB
    /// slots are never deallocated).
    pub(crate) fn prepare_switch(&mut self) -> Option<(*mut CpuContext, *const CpuContext)> {
        self.need_resched = false;
        let current = self.table.current_pid();

        // Aging: every READY process waiting its turn becomes more
        // eligible, so no entry priority can starve it forever.
        for pcb in self.table.slots.iter_mut() {
            if pcb.state == ProcessState::Ready && pcb.pid != current && pcb.priority > 0 {
                pcb.priority -= 1;
            }
        }

        // Selection: minimum priority among READY/RUNNING, lowest slot
        // index on ties.
        let mut next: Option<Pid> = None;
        let mut best = i32::MAX;
        for pcb in self.table.slots.iter() {
            if matches!(pcb.state, ProcessState::Ready | ProcessState::Running)
                && pcb.priority < best
            {
                best = pcb.priority;
                next = Some(pcb.pid);
            }
        }

        // Nobody runnable: the idle process takes over. If it was left
        // non-runnable by some error, heal it rather than strand the CPU.
        let next = next.unwrap_or_else(|| {
            let idle = &mut self.table.slots[IDLE_PID];
            if !matches!(idle.state, ProcessState::Running | ProcessState::Ready) {
                warn!("scheduler: idle process was not runnable, recovering");
                idle.state = ProcessState::Ready;
                idle.block_reason = BlockReason::None;
            }
            IDLE_PID
        });

        // Penalty and quantum for the winner.
        {
            let pcb = &mut self.table.slots[next];
            if pcb.priority < PRIORITY_CEILING {
                pcb.priority += PRIORITY_PENALTY;
            }
            if next != IDLE_PID {
                pcb.quantum = DEFAULT_QUANTUM;
            }
        }

        if next == current {
            // Keep the RUNNING invariant intact even on the self-heal
            // path, where the re-selected process may be marked READY.
            if self.table.slots[next].state != ProcessState::Running {
                self.table.slots[next].state = ProcessState::Running;
            }
            return None;
        }

        if self.table.slots[current].state == ProcessState::Running {
            self.table.slots[current].state = ProcessState::Ready;
        }
        self.table.slots[next].state = ProcessState::Running;
        self.table.current = next;
        self.switches += 1;

        let prev_ctx = &mut self.table.slots[current].context as *mut CpuContext;
        let next_ctx = &self.table.slots[next].context as *const CpuContext;
        Some((prev_ctx, next_ctx))
    }

    /// Mark the current process asleep until `ticks` from now. The caller
    /// must follow up with a reschedule; see `sleep`.
    pub(crate) fn prepare_sleep(&mut self, ticks: u64) {
        let wake_at = self.ticks + ticks;
        let pcb = self.table.current_mut();
        pcb.wake_up_time = wake_at;
        pcb.state = ProcessState::Blocked;
        pcb.block_reason = BlockReason::Sleep;
    }

    /// Block the current process for `ticks` timer ticks and yield. The
    /// call returns only after the timer wakes the process and the
    /// scheduler selects it again.
    pub fn sleep(&mut self, ticks: u64, arch: &dyn ArchOps) {
        self.prepare_sleep(ticks);
        self.schedule(arch);
    }
}
