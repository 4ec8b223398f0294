use crate::access::{CisAccess, CisSpace};
use crate::error::{CisError, Result};

/// Well-known tuple codes.
pub mod codes {
    pub const NULL: u8 = 0x00;
    pub const DEVICE: u8 = 0x01;
    pub const INDIRECT: u8 = 0x03;
    pub const LONGLINK_MFC: u8 = 0x06;
    pub const CHECKSUM: u8 = 0x10;
    pub const LONGLINK_A: u8 = 0x11;
    pub const LONGLINK_C: u8 = 0x12;
    pub const LINKTARGET: u8 = 0x13;
    pub const NO_LINK: u8 = 0x14;
    pub const VERS_1: u8 = 0x15;
    pub const ALTSTR: u8 = 0x16;
    pub const DEVICE_A: u8 = 0x17;
    pub const JEDEC_C: u8 = 0x18;
    pub const JEDEC_A: u8 = 0x19;
    pub const CONFIG: u8 = 0x1a;
    pub const CFTABLE_ENTRY: u8 = 0x1b;
    pub const DEVICE_OC: u8 = 0x1c;
    pub const DEVICE_OA: u8 = 0x1d;
    pub const DEVICE_GEO: u8 = 0x1e;
    pub const DEVICE_GEO_A: u8 = 0x1f;
    pub const MANFID: u8 = 0x20;
    pub const FUNCID: u8 = 0x21;
    pub const FUNCE: u8 = 0x22;
    pub const END: u8 = 0xff;
}

/// Cap on tuples visited in one walk. Floating-bus garbage can parse as a
/// chain that loops forever; bail out instead.
pub const MAX_TUPLES: u32 = 200;

/// Which card function's chain to follow at a multi-function long-link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionSelect {
    Function(u8),
    /// Visit every function's chain in turn.
    AllFunctions,
}

/// Cursor over a CIS tuple chain.
///
/// `first_tuple` / `next_tuple` advance the cursor, transparently following
/// long-links (including into the other address space) and multi-function
/// long-links. The cursor is restartable: `first_tuple` always returns to the
/// same first tuple given unchanged card contents.
#[derive(Debug, Clone)]
pub struct TupleCursor {
    desired: Option<u8>,
    return_links: bool,
    function: FunctionSelect,
    start_space: CisSpace,

    space: CisSpace,
    offset: u32,
    data_len: u8,
    pending_link: Option<(CisSpace, u32)>,
    mfc_queue: Vec<(CisSpace, u32)>,
    started: bool,

    /// Code of the tuple the cursor currently rests on.
    pub code: u8,
}

impl TupleCursor {
    pub fn new() -> Self {
        Self {
            desired: None,
            return_links: false,
            function: FunctionSelect::Function(0),
            start_space: CisSpace::Attribute,
            space: CisSpace::Attribute,
            offset: 0,
            data_len: 0,
            pending_link: None,
            mfc_queue: Vec::new(),
            started: false,
            code: codes::NULL,
        }
    }

    /// Restricts the walk to tuples with the given code; everything else is
    /// skipped internally.
    pub fn desired(mut self, code: u8) -> Self {
        self.desired = Some(code);
        self
    }

    /// Surfaces link-control tuples (long-links, link targets, no-link) to
    /// the caller instead of consuming them silently.
    pub fn return_links(mut self) -> Self {
        self.return_links = true;
        self
    }

    pub fn for_function(mut self, function: FunctionSelect) -> Self {
        self.function = function;
        self
    }

    /// Starts the walk in common memory (cards with no attribute-space CIS).
    pub fn starting_in_common(mut self) -> Self {
        self.start_space = CisSpace::Common;
        self
    }

    /// Length of the current tuple's payload.
    pub fn data_len(&self) -> u8 {
        self.data_len
    }

    /// Space and offset of the current tuple header.
    pub fn position(&self) -> (CisSpace, u32) {
        (self.space, self.offset)
    }

    /// Rewinds to the start of the chain and advances to the first matching
    /// tuple.
    pub fn first_tuple(&mut self, access: &mut dyn CisAccess) -> Result<()> {
        self.space = self.start_space;
        self.offset = 0;
        self.data_len = 0;
        self.pending_link = None;
        self.mfc_queue.clear();
        self.started = false;
        self.code = codes::NULL;
        self.next_tuple(access)
    }

    /// Advances to the next matching tuple.
    ///
    /// Returns [`CisError::NoMoreItems`] at an unlinked terminator, when a
    /// long-link target fails verification, or once [`MAX_TUPLES`] tuples
    /// have been visited.
    pub fn next_tuple(&mut self, access: &mut dyn CisAccess) -> Result<()> {
        let mut ofs = if self.started {
            self.offset + 2 + self.data_len as u32
        } else {
            self.offset
        };
        self.started = true;

        for _ in 0..MAX_TUPLES {
            let mut hdr = [0u8; 2];
            access.read(self.space, ofs, &mut hdr)?;
            let code = hdr[0];

            if code == codes::END {
                match self.take_link() {
                    Some((space, target)) => {
                        if !verify_link_target(access, space, target)? {
                            return Err(CisError::NoMoreItems);
                        }
                        self.space = space;
                        ofs = target;
                        continue;
                    }
                    None => return Err(CisError::NoMoreItems),
                }
            }

            if code == codes::NULL {
                // One-byte filler tuple; no link field.
                ofs += 1;
                continue;
            }

            let len = hdr[1];
            self.note_link_tuple(access, code, ofs, len)?;

            let is_link = matches!(
                code,
                codes::LONGLINK_A
                    | codes::LONGLINK_C
                    | codes::LONGLINK_MFC
                    | codes::NO_LINK
                    | codes::LINKTARGET
            );
            let wanted = match self.desired {
                Some(d) => d == code,
                None => !is_link || self.return_links,
            };
            if wanted {
                self.offset = ofs;
                self.code = code;
                self.data_len = len;
                return Ok(());
            }

            ofs = ofs
                .checked_add(2 + len as u32)
                .ok_or(CisError::BadTuple("tuple offset overflow"))?;
        }

        Err(CisError::NoMoreItems)
    }

    /// Reads up to `max_len` payload bytes of the current tuple without
    /// advancing the cursor.
    pub fn read_tuple_data(&self, access: &mut dyn CisAccess, max_len: usize) -> Result<Vec<u8>> {
        let len = (self.data_len as usize).min(max_len);
        let mut buf = vec![0u8; len];
        access.read(self.space, self.offset + 2, &mut buf)?;
        Ok(buf)
    }

    fn take_link(&mut self) -> Option<(CisSpace, u32)> {
        if let Some(link) = self.pending_link.take() {
            return Some(link);
        }
        if self.mfc_queue.is_empty() {
            None
        } else {
            Some(self.mfc_queue.remove(0))
        }
    }

    fn note_link_tuple(
        &mut self,
        access: &mut dyn CisAccess,
        code: u8,
        ofs: u32,
        len: u8,
    ) -> Result<()> {
        match code {
            codes::LONGLINK_A | codes::LONGLINK_C => {
                if len < 4 {
                    return Err(CisError::BadTuple("short long-link"));
                }
                let mut raw = [0u8; 4];
                access.read(self.space, ofs + 2, &mut raw)?;
                let space = if code == codes::LONGLINK_A {
                    CisSpace::Attribute
                } else {
                    CisSpace::Common
                };
                self.pending_link = Some((space, u32::from_le_bytes(raw)));
            }
            codes::LONGLINK_MFC => {
                let mut raw = vec![0u8; len as usize];
                access.read(self.space, ofs + 2, &mut raw)?;
                let links = parse_mfc_links(&raw)?;
                match self.function {
                    FunctionSelect::Function(n) => {
                        self.pending_link = links.get(n as usize).copied();
                        if self.pending_link.is_none() {
                            return Err(CisError::BadTuple("function index beyond MFC links"));
                        }
                    }
                    FunctionSelect::AllFunctions => {
                        // Visit every function's chain; remember how many
                        // remain by keeping them queued.
                        self.mfc_queue = links;
                    }
                }
            }
            codes::NO_LINK => {
                self.pending_link = None;
            }
            _ => {}
        }
        Ok(())
    }
}

impl Default for TupleCursor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a LONGLINK_MFC payload into per-function (space, offset) pairs.
pub fn parse_mfc_links(data: &[u8]) -> Result<Vec<(CisSpace, u32)>> {
    let Some((&nfn, rest)) = data.split_first() else {
        return Err(CisError::BadTuple("empty MFC long-link"));
    };
    let nfn = nfn as usize;
    if rest.len() < nfn * 5 {
        return Err(CisError::BadTuple("truncated MFC long-link"));
    }
    let mut links = Vec::with_capacity(nfn);
    for entry in rest.chunks_exact(5).take(nfn) {
        let space = match entry[0] {
            0 => CisSpace::Attribute,
            _ => CisSpace::Common,
        };
        let offset = u32::from_le_bytes([entry[1], entry[2], entry[3], entry[4]]);
        links.push((space, offset));
    }
    Ok(links)
}

/// A long-link target must begin with a LINKTARGET tuple whose payload spells
/// "CIS"; anything else means the link points at garbage and the walk ends.
fn verify_link_target(access: &mut dyn CisAccess, space: CisSpace, target: u32) -> Result<bool> {
    let mut raw = [0u8; 5];
    access.read(space, target, &mut raw)?;
    Ok(raw[0] == codes::LINKTARGET && raw[1] >= 3 && &raw[2..5] == b"CIS")
}
