//! Card Information Structure (CIS) parsing for 16-bit PC Cards.
//!
//! A card describes itself through a chain of typed, length-prefixed tuples
//! stored in its attribute memory (and, for multi-function cards, common
//! memory). This crate provides:
//!
//! - [`TupleCursor`]: chain walking with transparent long-link, indirect, and
//!   multi-function long-link handling
//! - [`parse`]: pure decoders for the well-known tuple codes (device
//!   geometry, IDs, version strings, configuration-table entries with the
//!   mantissa/exponent power and timing encodings)
//! - [`validate_cis`]: the "is this actually a CIS or floating-bus garbage"
//!   heuristic
//!
//! All card memory access goes through [`CisAccess`], supplied per-socket by
//! the socket manager (which also owns the byte cache); the parser itself
//! never branches on the card's addressing mode.

mod access;
mod error;
mod parse;
mod tuple;
mod validate;

pub use access::{
    indirect_regs, CisAccess, CisSpace, FakeCardMemory, IndirectAccess, LinearAccess,
    RawCardMemory,
};
pub use error::{CisError, Result};
pub use parse::{
    parse, power_param, CfTableEntry, ConfigTuple, DeviceKind, DeviceRegion, FunctionKind,
    IoDescriptor, IoWindow, IrqDescriptor, MemWindow, ParsedTuple, PowerEntry, TimingInfo,
};
pub use tuple::{codes, parse_mfc_links, FunctionSelect, TupleCursor, MAX_TUPLES};
pub use validate::{validate_cis, ValidateResult, ValidationLimits};
