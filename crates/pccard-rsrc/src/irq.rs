use crate::error::{Result, RsrcError};

/// Number of arbitrated interrupt lines.
pub const IRQ_LINES: usize = 16;

/// How a client wants to hold an interrupt line.
///
/// The two sharing modes are distinct: everyone on a line must have asked for
/// the *same* one. `TimeShared` owners take turns (only one has the line wired
/// at a time); `DynamicShared` owners all keep a handler installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    Exclusive,
    TimeShared,
    DynamicShared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineState {
    Free,
    Reserved,
    Exclusive,
    TimeShared(u16),
    DynamicShared(u16),
}

/// Fixed-size ownership table for interrupt lines.
#[derive(Debug)]
pub struct IrqTable {
    lines: [LineState; IRQ_LINES],
}

impl IrqTable {
    pub fn new() -> Self {
        Self {
            lines: [LineState::Free; IRQ_LINES],
        }
    }

    /// Marks a line as never available (wired to something else on the board).
    pub fn reserve(&mut self, line: u8) -> Result<()> {
        let slot = self.slot_mut(line)?;
        if *slot != LineState::Free {
            return Err(RsrcError::InUse { line });
        }
        *slot = LineState::Reserved;
        Ok(())
    }

    /// Requests ownership of `line` in `mode`.
    ///
    /// Exclusive requests fail if the line is owned at all. A sharing request
    /// joins an existing owner group only when every current owner picked the
    /// same sharing mode; the group is tracked by a per-mode reference count.
    pub fn request(&mut self, line: u8, mode: IrqMode) -> Result<()> {
        let slot = self.slot_mut(line)?;
        *slot = match (*slot, mode) {
            (LineState::Free, IrqMode::Exclusive) => LineState::Exclusive,
            (LineState::Free, IrqMode::TimeShared) => LineState::TimeShared(1),
            (LineState::Free, IrqMode::DynamicShared) => LineState::DynamicShared(1),
            (LineState::TimeShared(n), IrqMode::TimeShared) => LineState::TimeShared(n + 1),
            (LineState::DynamicShared(n), IrqMode::DynamicShared) => {
                LineState::DynamicShared(n + 1)
            }
            _ => return Err(RsrcError::InUse { line }),
        };
        Ok(())
    }

    /// Drops one ownership of `line` previously granted in `mode`.
    pub fn release(&mut self, line: u8, mode: IrqMode) -> Result<()> {
        let slot = self.slot_mut(line)?;
        *slot = match (*slot, mode) {
            (LineState::Exclusive, IrqMode::Exclusive) => LineState::Free,
            (LineState::TimeShared(1), IrqMode::TimeShared) => LineState::Free,
            (LineState::TimeShared(n), IrqMode::TimeShared) => LineState::TimeShared(n - 1),
            (LineState::DynamicShared(1), IrqMode::DynamicShared) => LineState::Free,
            (LineState::DynamicShared(n), IrqMode::DynamicShared) => {
                LineState::DynamicShared(n - 1)
            }
            _ => return Err(RsrcError::NotGranted { base: line as u32, len: 0 }),
        };
        Ok(())
    }

    /// Current owner count on `line` (0 when free or reserved-out).
    pub fn owners(&self, line: u8) -> usize {
        match self.lines.get(line as usize) {
            Some(LineState::Exclusive) => 1,
            Some(LineState::TimeShared(n)) | Some(LineState::DynamicShared(n)) => *n as usize,
            _ => 0,
        }
    }

    pub fn is_free(&self, line: u8) -> bool {
        matches!(self.lines.get(line as usize), Some(LineState::Free))
    }

    /// First free line allowed by `mask` (bit N set = line N usable).
    pub fn find_free(&self, mask: u16) -> Option<u8> {
        (0..IRQ_LINES as u8).find(|&l| mask & (1 << l) != 0 && self.is_free(l))
    }

    fn slot_mut(&mut self, line: u8) -> Result<&mut LineState> {
        self.lines
            .get_mut(line as usize)
            .ok_or(RsrcError::BadLine { line })
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}
