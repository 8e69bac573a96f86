//! modbus-shm: a Modbus RTU/TCP endpoint whose register banks live in POSIX
//! shared memory.
//!
//! Unrelated processes read and write the four banks (`<prefix>DO`,
//! `<prefix>DI`, `<prefix>AO`, `<prefix>AI`) directly, while this process
//! answers Modbus requests against the same memory. An optional named
//! semaphore serialises the two sides.
//!
//! Layers, bottom up: [`store`] owns the shared regions, [`sync`] provides the
//! semaphore guard, [`protocol`] receives and answers requests, and [`cli`]
//! wires everything together for the binary.

#[doc(hidden)]
pub mod boot;
pub mod cli;
pub mod error;
pub mod protocol;
pub mod store;
pub mod sync;

pub use error::{BridgeError, BridgeResult, ErrorCategory};
