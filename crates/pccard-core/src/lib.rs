//! Socket lifecycle and client registry for 16-bit PC Card slots.
//!
//! The model is split along the classic lines: a machine-specific
//! [`SocketDriver`] does raw pin wiggling, this crate owns every piece of
//! policy above it: debounced insertion and removal sequences, power-up and
//! reset timing, client event fan-out with veto support, per-function
//! configuration locking, and address/IRQ grants backed by `pccard-rsrc`.
//!
//! Concurrency follows a strict split: [`CardServices::notify`] is the only
//! interrupt-safe entry point and does nothing but queue a token; all state
//! mutation happens on the deferred worker (or a manually pumped
//! [`CardServices::service_pending`] in tests) and in synchronous client
//! calls, serialized per socket by a mutex. Event callbacks always run with
//! that mutex released, so handlers may call straight back in.

mod driver;
mod error;
mod event;
mod manager;
mod socket;

pub use driver::{
    ControlFlags, SocketCapabilities, SocketDriver, SocketPower, StatusLines, IO_WINDOWS,
    MEM_WINDOWS,
};
pub use error::{CsError, Result};
pub use event::{Event, EventHandler, EventMask, EventNotice, EventPriority, Veto};
pub use manager::{CardServices, ConfigRequest, WindowRequest};
pub use socket::{
    BindFunction, ClientId, ClientState, SocketId, SocketState, SocketTiming, WindowHandle,
    WindowKind,
};

pub use pccard_cis::{CisAccess, CisSpace};
pub use pccard_rsrc::IrqMode;
