// Process management: PCBs, lifecycle, scheduling.

pub mod pcb;
pub mod scheduler;

pub use pcb::{
    BlockReason, Pcb, Pid, ProcessEntry, ProcessError, ProcessState, ProcessTable, IDLE_PID,
    MAX_PROCESS, NAME_LEN, STACK_SIZE,
};
pub use scheduler::{Scheduler, DEFAULT_QUANTUM, PRIORITY_CEILING, PRIORITY_PENALTY};
