// Counting semaphore with a FIFO wait queue, built on scheduler state
// transitions instead of busy-waiting.

use crate::arch::{without_interrupts, ArchOps};
use crate::process::pcb::{BlockReason, Pid, ProcessState};
use crate::process::scheduler::Scheduler;

/// Counting semaphore. Blocked waiters form a singly linked FIFO through
/// the PCBs' intrusive `next` field: `head` is the longest waiter and the
/// next to be released.
///
/// Invariant: while the queue is non-empty, `signal` never increments
/// `count`. The unit of availability is handed directly to the woken
/// process, so count and queue occupancy can never double-grant access.
pub struct Semaphore {
    count: i32,
    head: Option<Pid>,
    tail: Option<Pid>,
}

impl Semaphore {
    pub const fn new(count: i32) -> Self {
        Self {
            count,
            head: None,
            tail: None,
        }
    }

    /// Reset to `count` with an empty queue.
    pub fn init(&mut self, count: i32) {
        self.count = count;
        self.head = None;
        self.tail = None;
    }

    pub fn count(&self) -> i32 {
        self.count
    }

    pub fn has_waiters(&self) -> bool {
        self.head.is_some()
    }

    /// P(): take one unit, blocking until one is available.
    ///
    /// Fast path: a unit is free, decrement and return. Slow path: park
    /// the calling process at the tail of the queue and yield; the call
    /// returns once a `signal` has woken it and the scheduler has
    /// selected it again. There is no timeout; an unsignaled semaphore
    /// blocks its caller indefinitely.
    pub fn wait(&mut self, sched: &mut Scheduler, arch: &dyn ArchOps) {
        if self.acquire_or_enqueue(sched, arch) {
            sched.schedule(arch);
        }
    }

    /// The mutating half of `wait`: take a unit and return `false`, or
    /// park the calling process at the tail of the queue and return
    /// `true`, leaving the actual yield to the caller.
    ///
    /// The split exists so that a caller holding a lock on this semaphore
    /// can release it between the enqueue and the yield. Giving up the CPU
    /// while still owning it would leave the queue unreachable for every
    /// other context on the single core, including the one that must
    /// eventually signal.
    pub(crate) fn acquire_or_enqueue(
        &mut self,
        sched: &mut Scheduler,
        arch: &dyn ArchOps,
    ) -> bool {
        without_interrupts(arch, || {
            if self.count > 0 {
                self.count -= 1;
                return false;
            }

            let pid = sched.table.current_pid();
            let table = &mut sched.table;
            table.slots[pid].next = None;
            match self.tail {
                Some(tail) => table.slots[tail].next = Some(pid),
                None => self.head = Some(pid),
            }
            self.tail = Some(pid);

            table.slots[pid].state = ProcessState::Blocked;
            table.slots[pid].block_reason = BlockReason::Wait;
            true
        })
    }

    /// V(): release one unit.
    ///
    /// With waiters queued, the head is dequeued and made READY and the
    /// count is left alone; the unit goes straight to that process. With
    /// an empty queue the count is incremented.
    pub fn signal(&mut self, sched: &mut Scheduler, arch: &dyn ArchOps) {
        without_interrupts(arch, || {
            if let Some(pid) = self.head {
                let table = &mut sched.table;
                self.head = table.slots[pid].next.take();
                if self.head.is_none() {
                    self.tail = None;
                }

                table.slots[pid].state = ProcessState::Ready;
                table.slots[pid].block_reason = BlockReason::None;
            } else {
                self.count += 1;
            }
        })
    }
}
