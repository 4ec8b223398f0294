use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// Raw socket status lines as reported by the low-level driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusLines: u8 {
        /// Card detect.
        const DETECT = 1 << 0;
        /// Card ready / busy#.
        const READY = 1 << 1;
        /// Battery voltage detect 1 (dead below threshold).
        const BVD1 = 1 << 2;
        /// Battery voltage detect 2 (warning below threshold).
        const BVD2 = 1 << 3;
        /// Write-protect switch.
        const WRITE_PROTECT = 1 << 4;
        /// Voltage sense: card wants 3.3 V.
        const VS_3V = 1 << 5;
        /// Voltage sense: card wants X.X V.
        const VS_X = 1 << 6;
    }
}

bitflags! {
    /// Control bits applied through [`SocketDriver::configure`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u8 {
        /// Hold the card in reset.
        const RESET = 1 << 0;
        /// Enable the card's outputs onto the bus.
        const OUTPUT_ENABLE = 1 << 1;
        /// Route the card's speaker line to the host.
        const SPEAKER_ENABLE = 1 << 2;
        /// Wire the card's interrupt through to the host controller.
        const IRQ_ENABLE = 1 << 3;
    }
}

/// Power and control state to apply to a socket.
///
/// Voltages are in tenths of a volt (33 = 3.3 V, 50 = 5 V, 0 = off).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SocketPower {
    pub vcc: u16,
    pub vpp: u16,
    pub flags: ControlFlags,
    /// Host interrupt line the card's IRQ is routed to, when IRQ_ENABLE is
    /// set.
    pub io_irq: u8,
}

/// Fixed operation table implemented by a machine-specific socket driver.
///
/// This is the entire hardware boundary: GPIO banks, companion-chip
/// registers, and board voltage rails all hide behind it. Implementations
/// must be callable from both the event worker and client threads, hence
/// `&self` with interior mutability where needed.
pub trait SocketDriver: Send + Sync {
    /// Brings the hardware up and reports how many sockets it serves.
    fn init(&self) -> Result<usize>;

    /// Final power-down of all sockets.
    fn shutdown(&self);

    /// Samples the raw status lines of one socket.
    fn read_state(&self, sock: usize) -> StatusLines;

    /// Host interrupt line wired to this socket's status-change signal.
    fn get_irq(&self, sock: usize) -> u8;

    /// Applies power and control state.
    fn configure(&self, sock: usize, power: &SocketPower) -> Result<()>;

    /// Reads card memory through the socket's CIS window. `attribute`
    /// selects the attribute plane; `offset` is a raw bus offset.
    fn read_card_memory(&self, sock: usize, attribute: bool, offset: u32, buf: &mut [u8])
        -> Result<()>;

    /// Writes card memory (used for configuration-register updates).
    fn write_card_memory(&self, sock: usize, attribute: bool, offset: u32, data: &[u8])
        -> Result<()>;
}

/// What the socket hardware can do, declared once at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketCapabilities {
    /// Address-window granularity; window sizes must be a multiple of this.
    pub page_granularity: u32,
    /// Supported Vcc levels, tenths of a volt.
    pub supports_3v: bool,
    pub supports_5v: bool,
    /// Whether I/O windows have a fixed host-to-card offset (static map) or
    /// a programmable one.
    pub static_io_map: bool,
    /// CIS reachable only through the indirect register file, not linear
    /// addressing.
    pub indirect_cis: bool,
    /// Mask of host interrupt lines the socket can route card IRQs to.
    pub irq_mask: u16,
}

impl Default for SocketCapabilities {
    fn default() -> Self {
        Self {
            page_granularity: 0x1000,
            supports_3v: true,
            supports_5v: true,
            static_io_map: false,
            indirect_cis: false,
            irq_mask: 0xdeb8, // classic ISA-style routable lines
        }
    }
}

/// Number of memory windows per socket.
pub const MEM_WINDOWS: usize = 4;
/// Number of I/O windows per socket.
pub const IO_WINDOWS: usize = 2;
