// End-to-end scenarios driven through the public kernel surface.
//
// There is no real CPU here, so the tests play the role of every process:
// after each `schedule()` the table says who owns the CPU, and the test
// performs that process's next action (take a semaphore, sleep, exit).
// The kernel cannot tell the difference.

use emberos::arch::NULL_ARCH;
use emberos::memory::fault::{FaultClass, FaultOutcome};
use emberos::memory::pmm::PAGE_SIZE;
use emberos::process::{
    BlockReason, Pid, ProcessError, ProcessState, DEFAULT_QUANTUM, IDLE_PID, MAX_PROCESS,
};
use emberos::sync::Semaphore;
use emberos::{Kernel, KernelConfig, FAULT_EXIT_CODE};

const PHYS_PAGES: usize = 64;
const HEAP_BYTES: usize = 512 * 1024;

/// Page-aligned, zeroed, intentionally leaked backing memory.
fn leak_region(bytes: usize) -> u64 {
    let layout = std::alloc::Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
    unsafe { std::alloc::alloc_zeroed(layout) as u64 }
}

fn boot_kernel() -> Kernel {
    let phys = leak_region(PHYS_PAGES * PAGE_SIZE);
    let heap = leak_region(HEAP_BYTES);
    let mut kernel = Kernel::new(&NULL_ARCH);
    let config = KernelConfig {
        phys_start: phys,
        phys_size: PHYS_PAGES * PAGE_SIZE,
        heap_start: heap as usize,
        heap_end: heap as usize + HEAP_BYTES,
    };
    unsafe { kernel.init(&config).unwrap() };
    kernel
}

extern "C" fn noop(_arg: usize) {}

/// One timer interrupt followed by the interrupt-return path's check of
/// the deferred flag.
fn run_tick(kernel: &mut Kernel) {
    kernel.timer_tick();
    if kernel.reschedule_pending() {
        kernel.schedule();
    }
}

/// Reschedule until `pid` owns the CPU; aging guarantees this converges.
fn schedule_until_current(kernel: &mut Kernel, pid: Pid) {
    for _ in 0..100 {
        if kernel.current_pid() == pid {
            return;
        }
        kernel.schedule();
    }
    panic!("pid {pid} never reached the CPU");
}

fn assert_one_running(kernel: &Kernel) {
    assert_eq!(kernel.stats().running, 1, "RUNNING must be unique");
}

fn cpu_time(kernel: &Kernel, pid: Pid) -> u64 {
    kernel.sched.table().get(pid).unwrap().cpu_time
}

#[test]
fn semaphore_holder_and_waiter() {
    let mut kernel = boot_kernel();
    let mut sem = Semaphore::new(1);

    let holder = kernel.create_process(noop, 0, 1, "holder").unwrap();
    let waiter = kernel.create_process(noop, 0, 2, "waiter").unwrap();

    // Holder claims the single unit on the fast path and goes to sleep
    // still holding it.
    schedule_until_current(&mut kernel, holder);
    kernel.sem_wait(&mut sem);
    assert_eq!(sem.count(), 0);
    assert_eq!(kernel.process_state(holder), Some(ProcessState::Running));
    kernel.sleep(10);

    // The waiter finds the semaphore empty and parks on its queue.
    schedule_until_current(&mut kernel, waiter);
    kernel.sem_wait(&mut sem);
    assert_eq!(kernel.process_state(waiter), Some(ProcessState::Blocked));
    assert_eq!(
        kernel.sched.table().get(waiter).unwrap().block_reason,
        BlockReason::Wait
    );
    assert!(sem.has_waiters());
    assert_one_running(&kernel);

    // Ticks pass; the timer wakes the sleeper but must never touch the
    // semaphore waiter.
    for _ in 0..12 {
        run_tick(&mut kernel);
        assert_eq!(kernel.process_state(waiter), Some(ProcessState::Blocked));
    }
    schedule_until_current(&mut kernel, holder);

    // Only the holder's signal releases the waiter, and the unit goes to
    // it directly instead of through the count.
    kernel.sem_signal(&mut sem);
    assert_eq!(kernel.process_state(waiter), Some(ProcessState::Ready));
    assert_eq!(
        kernel.sched.table().get(waiter).unwrap().block_reason,
        BlockReason::None
    );
    assert_eq!(sem.count(), 0);
    assert!(!sem.has_waiters());
    assert_one_running(&kernel);
}

#[test]
fn aging_shares_the_cpu_without_starvation() {
    let mut kernel = boot_kernel();

    let fast = kernel.create_process(noop, 0, 1, "fast").unwrap();
    let slow = kernel.create_process(noop, 0, 8, "slow").unwrap();

    const TICKS: u64 = 600;
    for _ in 0..TICKS {
        run_tick(&mut kernel);
        assert_one_running(&kernel);
    }

    let fast_time = cpu_time(&kernel, fast);
    let slow_time = cpu_time(&kernel, slow);

    // Every tick is charged to exactly one process.
    let total: u64 = (0..MAX_PROCESS)
        .map(|pid| cpu_time(&kernel, pid))
        .sum();
    assert_eq!(total, TICKS);
    assert_eq!(kernel.ticks(), TICKS);

    // The more urgent process gets more of the CPU, but aging keeps the
    // other one alive.
    assert!(fast_time > slow_time);
    assert!(slow_time > 0, "low-urgency process starved");
}

#[test]
fn sleep_periods_set_iteration_rates() {
    let mut kernel = boot_kernel();

    let fast = kernel.create_process(noop, 0, 5, "fast").unwrap();
    let slow = kernel.create_process(noop, 0, 5, "slow").unwrap();
    let mut fast_iters = 0u64;
    let mut slow_iters = 0u64;

    // Act out both process bodies: one unit of instant work, then back to
    // sleep for the period.
    let drain = |kernel: &mut Kernel, fast_iters: &mut u64, slow_iters: &mut u64| {
        for _ in 0..50 {
            let current = kernel.current_pid();
            if current == fast {
                *fast_iters += 1;
                kernel.sleep(10);
            } else if current == slow {
                *slow_iters += 1;
                kernel.sleep(70);
            } else if kernel.stats().ready == 0 {
                return;
            } else {
                kernel.schedule();
            }
        }
        panic!("runnable process never reached the CPU");
    };

    drain(&mut kernel, &mut fast_iters, &mut slow_iters);
    for _ in 0..700 {
        run_tick(&mut kernel);
        drain(&mut kernel, &mut fast_iters, &mut slow_iters);
        assert_one_running(&kernel);
    }

    // One initial turn each, then one per wake-up: 70 wake-ups on a
    // 10-tick period against 10 on a 70-tick period.
    assert_eq!(fast_iters, 71);
    assert_eq!(slow_iters, 11);
}

#[test]
fn cpu_bound_process_is_preempted_after_its_quantum() {
    let mut kernel = boot_kernel();
    let worker = kernel.create_process(noop, 0, 1, "worker").unwrap();

    schedule_until_current(&mut kernel, worker);
    let base = cpu_time(&kernel, worker);

    // The flag must stay clear for the whole quantum and rise exactly at
    // its end.
    for _ in 1..DEFAULT_QUANTUM {
        kernel.timer_tick();
        assert!(!kernel.reschedule_pending(), "preempted too early");
    }
    kernel.timer_tick();
    assert!(kernel.reschedule_pending());
    assert_eq!(cpu_time(&kernel, worker) - base, DEFAULT_QUANTUM as u64);

    kernel.schedule();
    assert_one_running(&kernel);

    // The preempted worker is not gone; it comes back.
    schedule_until_current(&mut kernel, worker);
    assert_eq!(kernel.process_state(worker), Some(ProcessState::Running));
}

#[test]
fn table_fills_drains_and_recycles() {
    let mut kernel = boot_kernel();

    for _ in 0..MAX_PROCESS - 1 {
        kernel.create_process(noop, 0, 1, "filler").unwrap();
    }
    assert_eq!(
        kernel.create_process(noop, 0, 1, "overflow"),
        Err(ProcessError::TableFull)
    );

    // Retire each worker as it reaches the CPU.
    for _ in 0..10_000 {
        if kernel.current_pid() != IDLE_PID {
            kernel.exit_current(0);
        } else if kernel.stats().ready == 0 {
            break;
        } else {
            kernel.schedule();
        }
    }
    assert_eq!(kernel.current_pid(), IDLE_PID);
    assert_eq!(kernel.stats().ready, 0);
    assert_eq!(kernel.stats().zombies, MAX_PROCESS - 1);

    // The idle loop reaps; every slot and stack comes back.
    assert_eq!(kernel.free_zombies(), MAX_PROCESS - 1);
    assert_eq!(kernel.stats().live_processes, 1);

    // Lowest slots are reissued first.
    for expected in 1..=3 {
        assert_eq!(
            kernel.create_process(noop, 0, 1, "reborn"),
            Ok(expected as Pid)
        );
    }
}

#[test]
fn demand_paging_backs_an_untouched_address() {
    let mut kernel = boot_kernel();
    let far: u64 = 0x4000_0040;

    // Nothing is mapped until the first touch faults it in.
    assert!(kernel.mem.translate(far).is_none());
    assert_eq!(
        kernel.handle_fault(far, FaultClass::KernelTranslation),
        FaultOutcome::Resolved
    );

    // The retry would now hit a fresh zeroed page; poke it through the
    // translation the walker reports.
    let phys = kernel.mem.translate(far).unwrap();
    unsafe {
        assert_eq!(*(phys as *const u8), 0);
        *(phys as *mut u8) = 42;
        assert_eq!(*(phys as *const u8), 42);
    }

    // A second access to the same page needs no further fault.
    assert!(kernel.mem.translate(far + 8).is_some());
}

#[test]
fn unresolvable_fault_kills_only_the_faulting_process() {
    let mut kernel = boot_kernel();
    let victim = kernel.create_process(noop, 0, 1, "victim").unwrap();

    schedule_until_current(&mut kernel, victim);
    assert_eq!(
        kernel.handle_fault(0xdead_beef, FaultClass::Protection),
        FaultOutcome::Fatal
    );

    // The faulting process is a zombie with the fault exit code; the
    // kernel itself moved on.
    assert_eq!(kernel.process_state(victim), Some(ProcessState::Zombie));
    assert_eq!(
        kernel.sched.table().get(victim).unwrap().exit_code,
        Some(FAULT_EXIT_CODE)
    );
    assert_ne!(kernel.current_pid(), victim);
    assert_one_running(&kernel);

    assert_eq!(kernel.free_zombies(), 1);
}

#[test]
fn fault_while_idle_leaves_the_idle_process_running() {
    let mut kernel = boot_kernel();
    assert_eq!(kernel.current_pid(), IDLE_PID);

    // Nothing to terminate: slot 0 is the scheduler's fallback and must
    // survive even its own unresolvable fault.
    assert_eq!(
        kernel.handle_fault(0xffff_4000, FaultClass::Protection),
        FaultOutcome::Fatal
    );
    assert_eq!(kernel.process_state(IDLE_PID), Some(ProcessState::Running));
    assert_eq!(kernel.current_pid(), IDLE_PID);
    assert_eq!(kernel.free_zombies(), 0);
    assert_one_running(&kernel);
}
