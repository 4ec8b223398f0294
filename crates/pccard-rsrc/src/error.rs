use thiserror::Error;

pub type Result<T> = std::result::Result<T, RsrcError>;

/// Errors surfaced by the resource pools and the IRQ table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RsrcError {
    /// The caller tried to manage a range that overlaps an already-managed one.
    #[error("range conflict: base={base:#x} len={len:#x}")]
    Conflict { base: u32, len: u32 },

    /// No free interval can satisfy the request.
    #[error("out of resource: len={len:#x} align={align:#x}")]
    OutOfResource { len: u32, align: u32 },

    /// Caller-supplied geometry is invalid (zero length, overflowing span,
    /// alignment that is not a power of two).
    #[error("bad arguments: {0}")]
    BadArgs(&'static str),

    /// `release` named a range that was never granted by `find`.
    #[error("not a live grant: base={base:#x} len={len:#x}")]
    NotGranted { base: u32, len: u32 },

    /// The interrupt line is already owned in an incompatible mode.
    #[error("irq line {line} in use")]
    InUse { line: u8 },

    /// Interrupt line index outside the table.
    #[error("bad irq line {line}")]
    BadLine { line: u8 },
}
