use crate::error::{CisError, Result};

/// Which card address space a CIS byte lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CisSpace {
    /// Metadata space; on the wire, data occupies every other byte.
    Attribute,
    /// Ordinary data memory.
    Common,
}

impl CisSpace {
    pub fn name(self) -> &'static str {
        match self {
            CisSpace::Attribute => "attribute",
            CisSpace::Common => "common",
        }
    }
}

/// Raw, convention-free access to card memory.
///
/// The socket manager supplies one of these per socket (typically backed by a
/// mapped hardware window plus a byte cache). `attribute` selects the
/// attribute-memory plane; offsets are *raw* bus offsets; the every-other-byte
/// convention is applied by [`LinearAccess`], not here.
pub trait RawCardMemory {
    fn read_raw(&mut self, attribute: bool, offset: u32, buf: &mut [u8]) -> Result<()>;
    fn write_raw(&mut self, attribute: bool, offset: u32, data: &[u8]) -> Result<()>;
}

/// What the tuple walker actually consumes: logical byte access per space.
///
/// Two implementations exist: [`LinearAccess`] for cards whose CIS is plainly
/// addressable, [`IndirectAccess`] for controllers that expose it through
/// address/data registers. The walker never branches on addressing mode.
pub trait CisAccess {
    fn read(&mut self, space: CisSpace, offset: u32, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, space: CisSpace, offset: u32, data: &[u8]) -> Result<()>;
}

/// Linearly addressed CIS.
///
/// Attribute-memory data occupies even bus offsets only, so logical offset `n`
/// maps to bus offset `2n` and reads stride by two.
pub struct LinearAccess<M> {
    mem: M,
}

impl<M: RawCardMemory> LinearAccess<M> {
    pub fn new(mem: M) -> Self {
        Self { mem }
    }

    pub fn into_inner(self) -> M {
        self.mem
    }
}

impl<M: RawCardMemory> CisAccess for LinearAccess<M> {
    fn read(&mut self, space: CisSpace, offset: u32, buf: &mut [u8]) -> Result<()> {
        match space {
            CisSpace::Common => self.mem.read_raw(false, offset, buf),
            CisSpace::Attribute => {
                let mut raw = vec![0u8; buf.len() * 2];
                self.mem.read_raw(true, offset * 2, &mut raw)?;
                for (dst, pair) in buf.iter_mut().zip(raw.chunks_exact(2)) {
                    *dst = pair[0];
                }
                Ok(())
            }
        }
    }

    fn write(&mut self, space: CisSpace, offset: u32, data: &[u8]) -> Result<()> {
        match space {
            CisSpace::Common => self.mem.write_raw(false, offset, data),
            CisSpace::Attribute => {
                for (i, b) in data.iter().enumerate() {
                    self.mem
                        .write_raw(true, (offset + i as u32) * 2, &[*b])?;
                }
                Ok(())
            }
        }
    }
}

/// Register offsets for indirectly addressed CIS, in common memory.
///
/// Cards whose controller cannot expose linear CIS addressing route reads and
/// writes through a small register file: a control register, four address
/// registers, and an auto-incrementing data register.
pub mod indirect_regs {
    pub const CTRL: u32 = 0x00;
    pub const ADDR0: u32 = 0x02;
    pub const ADDR1: u32 = 0x04;
    pub const ADDR2: u32 = 0x06;
    pub const ADDR3: u32 = 0x08;
    pub const DATA: u32 = 0x0a;

    /// CTRL bit: target the common plane instead of attribute.
    pub const CTRL_COMMON: u8 = 0x01;
    /// CTRL bit: auto-increment the address on each DATA access.
    pub const CTRL_AUTOINC: u8 = 0x02;
}

/// Indirectly addressed CIS.
pub struct IndirectAccess<M> {
    mem: M,
}

impl<M: RawCardMemory> IndirectAccess<M> {
    pub fn new(mem: M) -> Self {
        Self { mem }
    }

    fn set_target(&mut self, space: CisSpace, offset: u32) -> Result<()> {
        let mut ctrl = indirect_regs::CTRL_AUTOINC;
        // Attribute bytes sit at even bus offsets even behind the register
        // file, so the bus address doubles.
        let addr = match space {
            CisSpace::Attribute => offset * 2,
            CisSpace::Common => {
                ctrl |= indirect_regs::CTRL_COMMON;
                offset
            }
        };
        self.mem.write_raw(false, indirect_regs::CTRL, &[ctrl])?;
        let bytes = addr.to_le_bytes();
        self.mem.write_raw(false, indirect_regs::ADDR0, &bytes[0..1])?;
        self.mem.write_raw(false, indirect_regs::ADDR1, &bytes[1..2])?;
        self.mem.write_raw(false, indirect_regs::ADDR2, &bytes[2..3])?;
        self.mem.write_raw(false, indirect_regs::ADDR3, &bytes[3..4])?;
        Ok(())
    }
}

impl<M: RawCardMemory> CisAccess for IndirectAccess<M> {
    fn read(&mut self, space: CisSpace, offset: u32, buf: &mut [u8]) -> Result<()> {
        self.set_target(space, offset)?;
        let stride = match space {
            CisSpace::Attribute => 2,
            CisSpace::Common => 1,
        };
        for (i, dst) in buf.iter_mut().enumerate() {
            // Auto-increment advances by one bus byte per DATA access;
            // attribute reads consume the padding byte as well.
            let mut b = [0u8; 1];
            if stride == 2 && i > 0 {
                self.mem.read_raw(false, indirect_regs::DATA, &mut b)?;
            }
            self.mem.read_raw(false, indirect_regs::DATA, &mut b)?;
            *dst = b[0];
        }
        Ok(())
    }

    fn write(&mut self, space: CisSpace, offset: u32, data: &[u8]) -> Result<()> {
        if space == CisSpace::Attribute {
            // Byte-granular writes: re-target per byte to skip padding.
            for (i, b) in data.iter().enumerate() {
                self.set_target(space, offset + i as u32)?;
                self.mem.write_raw(false, indirect_regs::DATA, &[*b])?;
            }
            Ok(())
        } else {
            self.set_target(space, offset)?;
            for b in data {
                self.mem.write_raw(false, indirect_regs::DATA, &[*b])?;
            }
            Ok(())
        }
    }
}

/// In-memory card for tests: a pre-built attribute plane and common plane.
///
/// The attribute plane is stored *logically* (no padding bytes); `read_raw`
/// materializes the every-other-byte bus layout so access adapters see what
/// real hardware would give them.
#[derive(Debug, Default, Clone)]
pub struct FakeCardMemory {
    pub attribute: Vec<u8>,
    pub common: Vec<u8>,
}

impl FakeCardMemory {
    pub fn with_attribute_cis(cis: Vec<u8>) -> Self {
        Self {
            attribute: cis,
            common: Vec::new(),
        }
    }
}

impl RawCardMemory for FakeCardMemory {
    fn read_raw(&mut self, attribute: bool, offset: u32, buf: &mut [u8]) -> Result<()> {
        if attribute {
            for (i, dst) in buf.iter_mut().enumerate() {
                let bus = offset as usize + i;
                // Odd bus offsets float; real attribute memory has no byte there.
                *dst = if bus % 2 == 0 {
                    self.attribute.get(bus / 2).copied().unwrap_or(0xff)
                } else {
                    0xff
                };
            }
        } else {
            for (i, dst) in buf.iter_mut().enumerate() {
                *dst = self
                    .common
                    .get(offset as usize + i)
                    .copied()
                    .unwrap_or(0xff);
            }
        }
        Ok(())
    }

    fn write_raw(&mut self, attribute: bool, offset: u32, data: &[u8]) -> Result<()> {
        let (plane, offset) = if attribute {
            if offset % 2 != 0 {
                return Err(CisError::BadOffset {
                    space: "attribute",
                    offset,
                });
            }
            (&mut self.attribute, offset as usize / 2)
        } else {
            (&mut self.common, offset as usize)
        };
        if plane.len() < offset + data.len() {
            plane.resize(offset + data.len(), 0xff);
        }
        plane[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_attribute_reads_skip_padding_bytes() {
        let mem = FakeCardMemory::with_attribute_cis(vec![0x01, 0x02, 0x03, 0x04]);
        let mut acc = LinearAccess::new(mem);
        let mut buf = [0u8; 3];
        acc.read(CisSpace::Attribute, 1, &mut buf).unwrap();
        assert_eq!(buf, [0x02, 0x03, 0x04]);
    }

    #[test]
    fn linear_attribute_write_round_trips() {
        let mem = FakeCardMemory::default();
        let mut acc = LinearAccess::new(mem);
        acc.write(CisSpace::Attribute, 2, &[0xaa, 0xbb]).unwrap();
        let mut buf = [0u8; 2];
        acc.read(CisSpace::Attribute, 2, &mut buf).unwrap();
        assert_eq!(buf, [0xaa, 0xbb]);
    }

    /// Register-file card: common memory holds the register window backed by
    /// a hidden byte array.
    struct IndirectCard {
        regs: [u8; 12],
        attribute: Vec<u8>,
        common: Vec<u8>,
        cursor: u32,
    }

    impl IndirectCard {
        fn addr(&self) -> u32 {
            u32::from_le_bytes([
                self.regs[indirect_regs::ADDR0 as usize],
                self.regs[indirect_regs::ADDR1 as usize],
                self.regs[indirect_regs::ADDR2 as usize],
                self.regs[indirect_regs::ADDR3 as usize],
            ])
        }
    }

    impl RawCardMemory for IndirectCard {
        fn read_raw(&mut self, attribute: bool, offset: u32, buf: &mut [u8]) -> Result<()> {
            assert!(!attribute, "indirect cards have no linear attribute plane");
            for dst in buf.iter_mut() {
                if offset == indirect_regs::DATA {
                    let common = self.regs[indirect_regs::CTRL as usize]
                        & indirect_regs::CTRL_COMMON
                        != 0;
                    let at = self.cursor as usize;
                    *dst = if common {
                        self.common.get(at).copied().unwrap_or(0xff)
                    } else if at % 2 == 0 {
                        self.attribute.get(at / 2).copied().unwrap_or(0xff)
                    } else {
                        0xff
                    };
                    self.cursor += 1;
                } else {
                    *dst = self.regs[offset as usize];
                }
            }
            Ok(())
        }

        fn write_raw(&mut self, attribute: bool, offset: u32, data: &[u8]) -> Result<()> {
            assert!(!attribute);
            for b in data {
                if offset == indirect_regs::DATA {
                    self.cursor += 1;
                } else {
                    self.regs[offset as usize] = *b;
                    if (indirect_regs::ADDR0..=indirect_regs::ADDR3).contains(&offset) {
                        self.cursor = self.addr();
                    }
                }
            }
            Ok(())
        }
    }

    #[test]
    fn indirect_attribute_reads_auto_increment_through_registers() {
        let card = IndirectCard {
            regs: [0; 12],
            attribute: vec![0x10, 0x20, 0x30],
            common: vec![],
            cursor: 0,
        };
        let mut acc = IndirectAccess::new(card);
        let mut buf = [0u8; 3];
        acc.read(CisSpace::Attribute, 0, &mut buf).unwrap();
        assert_eq!(buf, [0x10, 0x20, 0x30]);
    }
}
