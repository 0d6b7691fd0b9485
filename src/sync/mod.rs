// Synchronization primitives built on the scheduler.

pub mod semaphore;

pub use semaphore::Semaphore;
