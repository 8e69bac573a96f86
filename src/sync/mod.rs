//! Inter-process coordination around the register store.
//!
//! The store itself is plain shared memory. Cooperating processes agree on a
//! named semaphore; this endpoint holds it only while it computes a reply.
pub mod guard;
pub mod semaphore;

pub use guard::{AccessGuard, BackoffPolicy, Escalation, ACQUIRE_TIMEOUT};
pub use semaphore::{CooperativeLock, NamedSemaphore};
