//! Address-space and interrupt-line arbitration for PC Card sockets.
//!
//! Client drivers compete for three scarce host resources: memory address
//! ranges, I/O port ranges, and interrupt lines. This crate owns the
//! bookkeeping only, no hardware state:
//!
//! - [`ResourcePool`]: a sorted set of free address intervals per resource
//!   class, seeded by explicit `add_range` calls and narrowed by probing
//! - [`IrqTable`]: a fixed 16-line table with exclusive and shared ownership
//!   modes
//! - [`probe_memory`]: a destructive read/write probe that weeds out memory
//!   ranges which float or alias before they are ever handed to a client
//!
//! Grants are additionally recorded against a platform-supplied
//! [`ReservationRegistry`] so unrelated host code cannot claim the same
//! physical range.

mod error;
mod irq;
mod pool;
mod probe;

pub use error::{Result, RsrcError};
pub use irq::{IrqMode, IrqTable, IRQ_LINES};
pub use pool::{Interval, NullRegistry, ReservationRegistry, ResourcePool};
pub use probe::{probe_memory, validate_region, MemoryProbe, PROBE_BOUNDARY, PROBE_CHUNK};

#[cfg(test)]
mod proptests;
