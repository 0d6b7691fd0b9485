// emberos: the core of a teaching kernel for a 64-bit ARM-class machine.
//
// One CPU, cooperative-preemptive multitasking: a priority/aging scheduler
// over a fixed PCB arena, counting semaphores with FIFO wait queues, and a
// memory subsystem (bitmap PMM, 3-level page tables, first-fit heap,
// demand paging). Drivers, the shell, the exception vectors and the
// syscall numbering live outside this crate and reach it through the
// narrow contracts below; everything architecture-specific goes through
// the `ArchOps` trait.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod memory;
pub mod process;
pub mod sync;

use lazy_static::lazy_static;
use log::error;
use spin::Mutex;

use arch::ArchOps;
use memory::fault::{self, FaultClass, FaultOutcome};
use memory::{MemoryError, MemoryManager, PhysAddr, VirtAddr};
use process::pcb::{Pid, ProcessEntry, ProcessError, ProcessState, IDLE_PID};
use process::scheduler::Scheduler;
use sync::Semaphore;

/// Exit code recorded for a process terminated by an unresolvable fault.
pub const FAULT_EXIT_CODE: i32 = -1;

/// Physical region and heap range handed to `Kernel::init` by the boot
/// path.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    pub phys_start: PhysAddr,
    pub phys_size: usize,
    pub heap_start: usize,
    pub heap_end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    Memory(MemoryError),
}

/// Aggregate snapshot of the system, for diagnostics and the shell's `ps`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelStats {
    pub live_processes: usize,
    pub running: usize,
    pub ready: usize,
    pub blocked: usize,
    pub zombies: usize,
    pub ticks: u64,
    pub context_switches: u64,
}

/// The kernel core: scheduler (with the process table), memory subsystem,
/// and the architecture port everything low-level is delegated to.
pub struct Kernel {
    pub sched: Scheduler,
    pub mem: MemoryManager,
    arch: &'static dyn ArchOps,
}

impl Kernel {
    pub fn new(arch: &'static dyn ArchOps) -> Self {
        Self {
            sched: Scheduler::new(),
            mem: MemoryManager::new(),
            arch,
        }
    }

    /// Boot-order initialization: memory first (process stacks come from
    /// the heap), then the process table is already seeded with the idle
    /// process by construction.
    ///
    /// # Safety
    /// See [`MemoryManager::init`] for the requirements on the ranges.
    pub unsafe fn init(&mut self, config: &KernelConfig) -> Result<(), KernelError> {
        self.mem
            .init(
                config.phys_start,
                config.phys_size,
                config.heap_start,
                config.heap_end,
            )
            .map_err(KernelError::Memory)?;
        Ok(())
    }

    pub fn arch(&self) -> &'static dyn ArchOps {
        self.arch
    }

    /// Start a new process running `entry(arg)`. Fails only when the table
    /// is full or no stack can be allocated; failure leaves no state
    /// behind.
    pub fn create_process(
        &mut self,
        entry: ProcessEntry,
        arg: usize,
        priority: i32,
        name: &str,
    ) -> Result<Pid, ProcessError> {
        self.sched
            .table
            .create(&mut self.mem.heap, self.arch, entry, arg, priority, name)
    }

    /// Terminate the calling process: mark it ZOMBIE and yield. Never
    /// returns control to the zombie; the reaper frees its stack later.
    pub fn exit_current(&mut self, exit_code: i32) {
        self.sched.table.mark_current_zombie(exit_code);
        self.sched.schedule(self.arch);
    }

    /// The reaper; called periodically from the idle loop.
    pub fn free_zombies(&mut self) -> usize {
        self.sched.table.free_zombies(&mut self.mem.heap)
    }

    pub fn sleep(&mut self, ticks: u64) {
        self.sched.sleep(ticks, self.arch);
    }

    /// Timer-interrupt entry; bookkeeping only, never switches.
    pub fn timer_tick(&mut self) {
        self.sched.timer_tick();
    }

    pub fn schedule(&mut self) {
        self.sched.schedule(self.arch);
    }

    /// Polled by the interrupt-return path; when set, it calls
    /// `schedule()` outside interrupt context.
    pub fn reschedule_pending(&self) -> bool {
        self.sched.reschedule_pending()
    }

    pub fn sem_wait(&mut self, sem: &mut Semaphore) {
        sem.wait(&mut self.sched, self.arch);
    }

    pub fn sem_signal(&mut self, sem: &mut Semaphore) {
        sem.signal(&mut self.sched, self.arch);
    }

    /// Synchronous data-abort entry. Resolves demand-paging faults; any
    /// unresolvable fault terminates the faulting process through the
    /// normal exit path. The kernel itself is never brought down here.
    pub fn handle_fault(&mut self, far: VirtAddr, class: FaultClass) -> FaultOutcome {
        match fault::handle_fault(&mut self.mem, self.arch, far, class) {
            FaultOutcome::Resolved => FaultOutcome::Resolved,
            FaultOutcome::Fatal => {
                if self.note_fatal_fault(far) {
                    self.schedule();
                }
                FaultOutcome::Fatal
            }
        }
    }

    /// Record an unresolvable fault and mark the current process ZOMBIE,
    /// unless the idle process itself faulted: slot 0 is the scheduler's
    /// fallback and must never be reaped, so it is left running and the
    /// incident is only reported.
    fn note_fatal_fault(&mut self, far: VirtAddr) -> bool {
        let pid = self.current_pid();
        if pid == IDLE_PID {
            error!("kernel: unresolved fault at {:#x} in the idle process", far);
            return false;
        }
        error!(
            "kernel: terminating pid {} after unresolved fault at {:#x}",
            pid, far
        );
        self.sched.table.mark_current_zombie(FAULT_EXIT_CODE);
        true
    }

    pub fn current_pid(&self) -> Pid {
        self.sched.table.current_pid()
    }

    pub fn process_state(&self, pid: Pid) -> Option<ProcessState> {
        self.sched.table.state_of(pid)
    }

    pub fn ticks(&self) -> u64 {
        self.sched.now()
    }

    pub fn stats(&self) -> KernelStats {
        let mut stats = KernelStats {
            live_processes: self.sched.table.live_count(),
            ticks: self.sched.now(),
            context_switches: self.sched.context_switches(),
            ..KernelStats::default()
        };
        for pid in 0..process::MAX_PROCESS {
            match self.sched.table.state_of(pid) {
                Some(ProcessState::Running) => stats.running += 1,
                Some(ProcessState::Ready) => stats.ready += 1,
                Some(ProcessState::Blocked) => stats.blocked += 1,
                Some(ProcessState::Zombie) => stats.zombies += 1,
                _ => {}
            }
        }
        stats
    }
}

lazy_static! {
    /// The system-wide kernel instance. Boot code installs the real
    /// architecture port and calls `init`; until then the inert
    /// `NullArch` is in place.
    pub static ref KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new(&arch::NULL_ARCH));
}

// Free-function surface over the global instance, for the syscall
// dispatcher and the interrupt glue.
//
// Lock discipline: every entry point that can suspend its caller updates
// the tables first, drops all spin guards, and only then performs the
// context switch. A process suspended mid-operation therefore never owns
// a lock that the context responsible for waking it would need.

/// Update-then-switch tail shared by the suspending entry points: run the
/// selection with the kernel lock held, release it, then hand the CPU
/// over. IRQs stay masked from before the table update until after the
/// switch; the resumed process restores them on its own path.
fn switch_outside_lock(mut kernel: spin::MutexGuard<'_, Kernel>) {
    let arch = kernel.arch;
    let were_enabled = arch.disable_irqs();
    let pending = kernel.sched.prepare_switch();
    drop(kernel);
    if let Some((prev, next)) = pending {
        // The contexts live in the static kernel instance, so the pointers
        // outlive the guard, and with IRQs masked nothing else mutates the
        // table on the single core.
        unsafe { arch.switch(prev, next) };
    }
    arch.restore_irqs(were_enabled);
}

pub fn create_process(
    entry: ProcessEntry,
    arg: usize,
    priority: i32,
    name: &str,
) -> Result<Pid, ProcessError> {
    KERNEL.lock().create_process(entry, arg, priority, name)
}

pub fn exit(exit_code: i32) {
    let mut kernel = KERNEL.lock();
    kernel.sched.table.mark_current_zombie(exit_code);
    switch_outside_lock(kernel);
}

pub fn free_zombie() -> usize {
    KERNEL.lock().free_zombies()
}

pub fn sleep(ticks: u64) {
    let mut kernel = KERNEL.lock();
    kernel.sched.prepare_sleep(ticks);
    switch_outside_lock(kernel);
}

pub fn timer_tick() {
    KERNEL.lock().timer_tick();
}

pub fn schedule() {
    switch_outside_lock(KERNEL.lock());
}

pub fn reschedule_pending() -> bool {
    KERNEL.lock().reschedule_pending()
}

pub fn sem_wait(sem: &Mutex<Semaphore>) {
    let mut kernel = KERNEL.lock();
    let blocked = {
        let kernel = &mut *kernel;
        sem.lock().acquire_or_enqueue(&mut kernel.sched, kernel.arch)
    };
    // The semaphore guard is gone; nothing is held once the CPU moves.
    if blocked {
        switch_outside_lock(kernel);
    }
}

pub fn sem_signal(sem: &Mutex<Semaphore>) {
    let mut kernel = KERNEL.lock();
    let kernel = &mut *kernel;
    // Signal wakes without yielding, so the guards never cross a switch.
    sem.lock().signal(&mut kernel.sched, kernel.arch);
}

pub fn handle_fault(far: VirtAddr, class: FaultClass) -> FaultOutcome {
    let mut kernel = KERNEL.lock();
    let k = &mut *kernel;
    match fault::handle_fault(&mut k.mem, k.arch, far, class) {
        FaultOutcome::Resolved => FaultOutcome::Resolved,
        FaultOutcome::Fatal => {
            if k.note_fatal_fault(far) {
                switch_outside_lock(kernel);
            }
            FaultOutcome::Fatal
        }
    }
}
