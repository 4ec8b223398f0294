use thiserror::Error;

pub type Result<T> = std::result::Result<T, CisError>;

/// Errors from CIS chain walking and tuple decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CisError {
    /// The walk reached a terminator with no further link, or the desired
    /// tuple code never appeared. The normal end-of-iteration signal, not a
    /// card fault.
    #[error("no more tuples")]
    NoMoreItems,

    /// The chain or a tuple body is malformed beyond what skipping tolerates.
    #[error("bad tuple: {0}")]
    BadTuple(&'static str),

    /// A read or write landed outside the card's address space.
    #[error("bad offset: space={space} offset={offset:#x}")]
    BadOffset { space: &'static str, offset: u32 },

    /// Recognized tuple code with no decoder. Callers skip these using the
    /// header's length field.
    #[error("unsupported tuple code {code:#04x}")]
    Unsupported { code: u8 },

    /// The underlying byte-access primitive failed.
    #[error("card memory access failed: {0}")]
    Access(&'static str),
}
