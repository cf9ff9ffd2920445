//! OS-process worker pool.
//!
//! The pool is a fixed roster of slots, each holding one worker
//! subprocess. Workers coordinate through the shared state database
//! rather than pipes; the supervisor only watches liveness and refills
//! slots until the work queue drains.

pub mod proc;
pub mod slot;
pub mod supervisor;

pub use supervisor::Supervisor;
