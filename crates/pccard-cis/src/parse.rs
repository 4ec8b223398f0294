//! Pure decoders for well-known tuple bodies.
//!
//! `parse` never touches card memory: callers feed it the code and raw
//! payload from a [`crate::TupleCursor`]. Unknown codes come back as
//! [`CisError::Unsupported`] so callers can skip them by length.

use crate::access::CisSpace;
use crate::error::{CisError, Result};
use crate::tuple::{codes, parse_mfc_links};

/// Speed/power mantissa table, indexed by the 4-bit mantissa field.
const MANTISSA: [u32; 16] = [
    10, 12, 13, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 70, 80, 90,
];
const EXPONENT: [u32; 8] = [1, 10, 100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];

/// Extended speed byte to nanoseconds. Mantissa 0 is reserved.
fn speed_cvt(v: u8) -> Result<u32> {
    let m = (v >> 3) & 15;
    if m == 0 {
        return Err(CisError::BadTuple("reserved speed mantissa"));
    }
    Ok(MANTISSA[m as usize - 1] * EXPONENT[(v & 7) as usize] / 10)
}

/// Power byte to a value in tenth-units (10 uV or 0.1 uA depending on the
/// parameter).
fn power_cvt(v: u8) -> u32 {
    MANTISSA[((v >> 3) & 15) as usize] * EXPONENT[(v & 7) as usize] / 10
}

fn power_scale(v: u8) -> u32 {
    EXPONENT[(v & 7) as usize]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Null,
    Rom,
    Otprom,
    Eprom,
    Eeprom,
    Flash,
    Sram,
    Dram,
    FunctionSpecific,
    Extended,
    Reserved(u8),
}

impl From<u8> for DeviceKind {
    fn from(v: u8) -> Self {
        match v {
            0 => DeviceKind::Null,
            1 => DeviceKind::Rom,
            2 => DeviceKind::Otprom,
            3 => DeviceKind::Eprom,
            4 => DeviceKind::Eeprom,
            5 => DeviceKind::Flash,
            6 => DeviceKind::Sram,
            7 => DeviceKind::Dram,
            0xd => DeviceKind::FunctionSpecific,
            0xe => DeviceKind::Extended,
            other => DeviceKind::Reserved(other),
        }
    }
}

/// One region described by a DEVICE tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegion {
    pub kind: DeviceKind,
    pub write_protected: bool,
    /// Access time in nanoseconds; `None` for the null speed code.
    pub speed_ns: Option<u32>,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    MultiFunction,
    Memory,
    Serial,
    Parallel,
    FixedDisk,
    Video,
    Network,
    Aims,
    Scsi,
    Unknown(u8),
}

impl From<u8> for FunctionKind {
    fn from(v: u8) -> Self {
        match v {
            0 => FunctionKind::MultiFunction,
            1 => FunctionKind::Memory,
            2 => FunctionKind::Serial,
            3 => FunctionKind::Parallel,
            4 => FunctionKind::FixedDisk,
            5 => FunctionKind::Video,
            6 => FunctionKind::Network,
            7 => FunctionKind::Aims,
            8 => FunctionKind::Scsi,
            other => FunctionKind::Unknown(other),
        }
    }
}

/// Power description entry parameter slots.
pub mod power_param {
    pub const V_NOMINAL: usize = 0;
    pub const V_MIN: usize = 1;
    pub const V_MAX: usize = 2;
    pub const I_STATIC: usize = 3;
    pub const I_AVG: usize = 4;
    pub const I_PEAK: usize = 5;
    pub const I_POWERDOWN: usize = 6;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerEntry {
    /// Bitmask of populated `params` slots (see [`power_param`]).
    pub present: u8,
    /// Values in 10 uV (voltage slots) or 0.1 uA (current slots).
    pub params: [u32; 7],
    pub high_z_ok: bool,
    pub high_z_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingInfo {
    pub wait_ns: Option<u32>,
    pub ready_ns: Option<u32>,
    pub reserved_ns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoWindow {
    pub base: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoDescriptor {
    /// Number of decoded address lines (0 = all lines significant).
    pub address_lines: u8,
    pub supports_8bit: bool,
    pub supports_16bit: bool,
    pub windows: Vec<IoWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemWindow {
    pub len: u32,
    pub card_addr: u32,
    pub host_addr: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IrqDescriptor {
    /// Raw IRQ info byte: low nibble is a level/pulse/share descriptor, or a
    /// specific line when the mask bit is clear.
    pub info: u8,
    /// Mask of acceptable lines when the info byte says one is present.
    pub mask: Option<u16>,
}

impl IrqDescriptor {
    pub const LEVEL: u8 = 0x20;
    pub const PULSE: u8 = 0x40;
    pub const SHARE: u8 = 0x80;
    const MASK_PRESENT: u8 = 0x10;

    /// Lines this function will accept, as a bitmask.
    pub fn line_mask(&self) -> u16 {
        match self.mask {
            Some(m) => m,
            None => 1 << (self.info & 0x0f),
        }
    }
}

/// Decoded CONFIG tuple: where the function's configuration registers live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTuple {
    pub last_index: u8,
    /// Base offset of the configuration registers in attribute memory.
    pub base: u32,
    /// Presence mask for the registers (bit 0 = COR, bit 1 = CCSR, ...).
    pub rmask: u32,
}

/// Decoded configuration-table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CfTableEntry {
    pub index: u8,
    pub is_default: bool,
    /// Interface type (0 = memory, 1 = I/O), when an interface byte is
    /// present.
    pub interface: Option<u8>,
    pub vcc: Option<PowerEntry>,
    pub vpp1: Option<PowerEntry>,
    pub vpp2: Option<PowerEntry>,
    pub timing: Option<TimingInfo>,
    pub io: Option<IoDescriptor>,
    pub irq: Option<IrqDescriptor>,
    pub mem: Vec<MemWindow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTuple {
    Device(Vec<DeviceRegion>),
    Manfid { manufacturer: u16, card: u16 },
    Funcid { function: FunctionKind, sysinit: u8 },
    Vers1 { major: u8, minor: u8, strings: Vec<String> },
    Config(ConfigTuple),
    CfTableEntry(CfTableEntry),
    LongLinkA(u32),
    LongLinkC(u32),
    LongLinkMfc(Vec<(CisSpace, u32)>),
    LinkTarget,
    NoLink,
}

/// Byte-stream reader over a tuple payload.
struct Body<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Body<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    fn u8(&mut self) -> Result<u8> {
        let b = self
            .data
            .get(self.at)
            .copied()
            .ok_or(CisError::BadTuple("truncated tuple body"))?;
        self.at += 1;
        Ok(b)
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.at).copied()
    }

    fn le(&mut self, nbytes: usize) -> Result<u32> {
        let mut v = 0u32;
        for i in 0..nbytes {
            v |= (self.u8()? as u32) << (8 * i);
        }
        Ok(v)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.at
    }
}

/// Decodes `data` as the body of a tuple with the given code.
pub fn parse(code: u8, data: &[u8]) -> Result<ParsedTuple> {
    match code {
        codes::DEVICE | codes::DEVICE_A => parse_device(data).map(ParsedTuple::Device),
        codes::MANFID => {
            let mut b = Body::new(data);
            Ok(ParsedTuple::Manfid {
                manufacturer: b.le(2)? as u16,
                card: b.le(2)? as u16,
            })
        }
        codes::FUNCID => {
            let mut b = Body::new(data);
            Ok(ParsedTuple::Funcid {
                function: FunctionKind::from(b.u8()?),
                sysinit: b.u8().unwrap_or(0),
            })
        }
        codes::VERS_1 => parse_vers_1(data),
        codes::CONFIG => parse_config(data).map(ParsedTuple::Config),
        codes::CFTABLE_ENTRY => parse_cftable_entry(data).map(ParsedTuple::CfTableEntry),
        codes::LONGLINK_A => {
            let mut b = Body::new(data);
            Ok(ParsedTuple::LongLinkA(b.le(4)?))
        }
        codes::LONGLINK_C => {
            let mut b = Body::new(data);
            Ok(ParsedTuple::LongLinkC(b.le(4)?))
        }
        codes::LONGLINK_MFC => parse_mfc_links(data).map(ParsedTuple::LongLinkMfc),
        codes::LINKTARGET => {
            if data.len() >= 3 && &data[..3] == b"CIS" {
                Ok(ParsedTuple::LinkTarget)
            } else {
                Err(CisError::BadTuple("link target signature mismatch"))
            }
        }
        codes::NO_LINK => Ok(ParsedTuple::NoLink),
        _ => Err(CisError::Unsupported { code }),
    }
}

fn parse_device(data: &[u8]) -> Result<Vec<DeviceRegion>> {
    let mut b = Body::new(data);
    let mut regions = Vec::new();
    while let Some(id) = b.peek() {
        if id == 0xff {
            break;
        }
        b.u8()?;
        let kind = DeviceKind::from(id >> 4);
        let write_protected = id & 0x08 != 0;
        let speed_ns = match id & 7 {
            0 => None,
            1 => Some(250),
            2 => Some(200),
            3 => Some(150),
            4 => Some(100),
            7 => {
                // Extended speed: mantissa/exponent byte, high bit chains
                // further extension bytes (ignored).
                let mut v = b.u8()?;
                let ns = speed_cvt(v)?;
                while v & 0x80 != 0 {
                    v = b.u8()?;
                }
                Some(ns)
            }
            _ => return Err(CisError::BadTuple("reserved device speed code")),
        };
        let size_byte = b.u8()?;
        if size_byte == 0xff {
            return Err(CisError::BadTuple("device entry missing size byte"));
        }
        let scale = size_byte & 7;
        if scale == 7 {
            return Err(CisError::BadTuple("reserved device size scale"));
        }
        let size = ((size_byte >> 3) as u32 + 1) * (512u32 << (2 * scale));
        regions.push(DeviceRegion {
            kind,
            write_protected,
            speed_ns,
            size,
        });
    }
    Ok(regions)
}

fn parse_vers_1(data: &[u8]) -> Result<ParsedTuple> {
    let mut b = Body::new(data);
    let major = b.u8()?;
    let minor = b.u8()?;
    let mut strings = Vec::new();
    let mut cur = Vec::new();
    while let Some(byte) = b.peek() {
        if byte == 0xff {
            break;
        }
        b.u8()?;
        if byte == 0 {
            strings.push(String::from_utf8_lossy(&cur).into_owned());
            cur.clear();
        } else {
            cur.push(byte);
        }
    }
    if !cur.is_empty() {
        strings.push(String::from_utf8_lossy(&cur).into_owned());
    }
    Ok(ParsedTuple::Vers1 {
        major,
        minor,
        strings,
    })
}

fn parse_config(data: &[u8]) -> Result<ConfigTuple> {
    let mut b = Body::new(data);
    let sizes = b.u8()?;
    let rasz = (sizes & 3) as usize + 1;
    let rmsz = ((sizes >> 2) & 0xf) as usize + 1;
    let last_index = b.u8()? & 0x3f;
    let base = b.le(rasz)?;
    // Keep at most the first four mask bytes; the rest describe registers no
    // 16-bit card actually has.
    let rmask = b.le(rmsz.min(4))?;
    if rmsz > 4 {
        for _ in 4..rmsz {
            b.u8()?;
        }
    }
    Ok(ConfigTuple {
        last_index,
        base,
        rmask,
    })
}

fn parse_power(b: &mut Body<'_>) -> Result<PowerEntry> {
    let mut entry = PowerEntry::default();
    let select = b.u8()?;
    for slot in 0..7 {
        if select & (1 << slot) == 0 {
            continue;
        }
        let first = b.u8()?;
        entry.present |= 1 << slot;
        entry.params[slot] = power_cvt(first);
        let mut byte = first;
        while byte & 0x80 != 0 {
            byte = b.u8()?;
            match byte & 0x7f {
                ext if ext < 100 => {
                    // Extension digits refine the mantissa.
                    entry.params[slot] += ext as u32 * power_scale(first) / 100;
                }
                0x7d => entry.high_z_ok = true,
                0x7e => entry.params[slot] = 0,
                0x7f => entry.high_z_required = true,
                _ => return Err(CisError::BadTuple("reserved power extension")),
            }
        }
    }
    Ok(entry)
}

fn parse_timing(b: &mut Body<'_>) -> Result<TimingInfo> {
    let mut t = TimingInfo::default();
    let scale = b.u8()?;
    if scale & 3 != 3 {
        t.wait_ns = Some(speed_cvt(b.u8()?)? * EXPONENT[(scale & 3) as usize]);
    }
    if (scale >> 2) & 7 != 7 {
        t.ready_ns = Some(speed_cvt(b.u8()?)? * EXPONENT[((scale >> 2) & 7) as usize]);
    }
    if (scale >> 5) != 7 {
        t.reserved_ns = Some(speed_cvt(b.u8()?)? * EXPONENT[(scale >> 5) as usize]);
    }
    Ok(t)
}

fn parse_io(b: &mut Body<'_>) -> Result<IoDescriptor> {
    let flags = b.u8()?;
    let mut io = IoDescriptor {
        address_lines: flags & 0x1f,
        supports_8bit: flags & 0x20 != 0,
        supports_16bit: flags & 0x40 != 0,
        windows: Vec::new(),
    };
    if flags & 0x80 == 0 {
        // No range descriptors: the function decodes 2^lines ports from base 0.
        io.windows.push(IoWindow {
            base: 0,
            len: if io.address_lines > 0 {
                1 << io.address_lines
            } else {
                0
            },
        });
        return Ok(io);
    }
    let fmt = b.u8()?;
    let nwin = (fmt & 0x0f) as usize + 1;
    let mut base_sz = ((fmt >> 4) & 3) as usize;
    if base_sz == 3 {
        base_sz += 1;
    }
    let mut len_sz = ((fmt >> 6) & 3) as usize;
    if len_sz == 3 {
        len_sz += 1;
    }
    for _ in 0..nwin {
        let base = b.le(base_sz)?;
        let len = if len_sz > 0 { b.le(len_sz)? + 1 } else { 0 };
        io.windows.push(IoWindow { base, len });
    }
    Ok(io)
}

fn parse_irq(b: &mut Body<'_>) -> Result<IrqDescriptor> {
    let info = b.u8()?;
    let mask = if info & IrqDescriptor::MASK_PRESENT != 0 {
        Some(b.le(2)? as u16)
    } else {
        None
    };
    Ok(IrqDescriptor { info, mask })
}

fn parse_mem_descriptors(b: &mut Body<'_>) -> Result<Vec<MemWindow>> {
    let fmt = b.u8()?;
    let nwin = (fmt & 7) as usize + 1;
    let len_sz = ((fmt >> 3) & 3) as usize;
    let addr_sz = ((fmt >> 5) & 3) as usize;
    let has_host_addr = fmt & 0x80 != 0;
    let mut wins = Vec::with_capacity(nwin);
    for _ in 0..nwin {
        // Lengths and addresses are in 256-byte units.
        let len = b.le(len_sz)? << 8;
        let card_addr = b.le(addr_sz)? << 8;
        let host_addr = if has_host_addr {
            Some(b.le(addr_sz)? << 8)
        } else {
            None
        };
        wins.push(MemWindow {
            len,
            card_addr,
            host_addr,
        });
    }
    Ok(wins)
}

fn parse_cftable_entry(data: &[u8]) -> Result<CfTableEntry> {
    let mut b = Body::new(data);
    let index_byte = b.u8()?;
    let mut entry = CfTableEntry {
        index: index_byte & 0x3f,
        is_default: index_byte & 0x40 != 0,
        ..Default::default()
    };
    if index_byte & 0x80 != 0 {
        entry.interface = Some(b.u8()? & 0x0f);
    }

    let features = b.u8()?;
    let power_entries = features & 3;
    if power_entries > 0 {
        entry.vcc = Some(parse_power(&mut b)?);
    }
    if power_entries > 1 {
        entry.vpp1 = Some(parse_power(&mut b)?);
    }
    if power_entries > 2 {
        entry.vpp2 = Some(parse_power(&mut b)?);
    }
    if features & 0x04 != 0 {
        entry.timing = Some(parse_timing(&mut b)?);
    }
    if features & 0x08 != 0 {
        entry.io = Some(parse_io(&mut b)?);
    }
    if features & 0x10 != 0 {
        entry.irq = Some(parse_irq(&mut b)?);
    }
    match (features >> 5) & 3 {
        0 => {}
        1 => {
            let len = b.le(2)? << 8;
            entry.mem.push(MemWindow {
                len,
                card_addr: 0,
                host_addr: None,
            });
        }
        2 => {
            let len = b.le(2)? << 8;
            let card_addr = b.le(2)? << 8;
            entry.mem.push(MemWindow {
                len,
                card_addr,
                host_addr: None,
            });
        }
        _ => entry.mem = parse_mem_descriptors(&mut b)?,
    }
    if features & 0x80 != 0 {
        // Misc features: consume the chained bytes, nothing in them matters
        // for resource negotiation.
        while b.remaining() > 0 && b.u8()? & 0x80 != 0 {}
    }
    Ok(entry)
}
