use thiserror::Error;

pub type Result<T> = std::result::Result<T, CsError>;

/// Unified error type for socket-services operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CsError {
    /// No card in the socket (or it vanished mid-operation).
    #[error("no card in socket")]
    NoCard,

    /// The socket id does not name a live socket.
    #[error("bad socket {0}")]
    BadSocket(usize),

    /// The client handle is stale or was never issued.
    #[error("bad client handle")]
    BadClient,

    /// The function's configuration is already locked by another client.
    #[error("configuration locked")]
    ConfigurationLocked,

    /// The socket or resource is busy with a conflicting operation (reset in
    /// flight, window slot occupied, client still holding grants).
    #[error("in use")]
    InUse,

    /// Allocation exhausted: intervals, window slots, or IRQ lines.
    #[error("out of resource")]
    OutOfResource,

    /// Caller-supplied arguments are invalid.
    #[error("bad arguments: {0}")]
    BadArgs(&'static str),

    /// Window or range geometry violates the socket's granularity.
    #[error("bad size: {size:#x} (granularity {granularity:#x})")]
    BadSize { size: u32, granularity: u32 },

    /// Offset outside the card's address space.
    #[error("bad offset {0:#x}")]
    BadOffset(u32),

    /// The card's CIS is malformed beyond tolerating.
    #[error("bad tuple: {0}")]
    BadTuple(&'static str),

    /// Recognized but unimplemented operation or tuple; not a card fault.
    #[error("unsupported")]
    Unsupported,

    /// The low-level socket driver reported a hardware fault.
    #[error("socket driver fault: {0}")]
    Driver(&'static str),
}

impl From<pccard_rsrc::RsrcError> for CsError {
    fn from(e: pccard_rsrc::RsrcError) -> Self {
        use pccard_rsrc::RsrcError;
        match e {
            RsrcError::OutOfResource { .. } => CsError::OutOfResource,
            RsrcError::InUse { .. } | RsrcError::Conflict { .. } => CsError::InUse,
            RsrcError::BadArgs(msg) => CsError::BadArgs(msg),
            RsrcError::NotGranted { .. } => CsError::BadArgs("not a live grant"),
            RsrcError::BadLine { .. } => CsError::BadArgs("bad irq line"),
        }
    }
}

impl From<pccard_cis::CisError> for CsError {
    fn from(e: pccard_cis::CisError) -> Self {
        use pccard_cis::CisError;
        match e {
            CisError::NoMoreItems => CsError::BadTuple("no more tuples"),
            CisError::BadTuple(msg) => CsError::BadTuple(msg),
            CisError::BadOffset { offset, .. } => CsError::BadOffset(offset),
            CisError::Unsupported { .. } => CsError::Unsupported,
            CisError::Access(msg) => CsError::Driver(msg),
        }
    }
}
