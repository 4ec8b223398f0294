use tracing::debug;

use crate::access::CisAccess;
use crate::error::{CisError, Result};
use crate::tuple::{codes, TupleCursor};

/// Tunables for the "is this actually a CIS" heuristic.
///
/// The thresholds are inherited folklore with no stated derivation; they are
/// carried as configuration rather than re-derived so existing behavior can
/// be reproduced exactly.
#[derive(Debug, Clone, Copy)]
pub struct ValidationLimits {
    /// More reserved-range codes than this means garbage.
    pub max_reserved: u32,
    /// A chain longer than this with no identification tuple means garbage.
    pub unidentified_chain_limit: u32,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_reserved: 5,
            unidentified_chain_limit: 10,
        }
    }
}

/// Outcome of a CIS sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidateResult {
    /// Tuples seen before the terminator (0 when judged corrupt).
    pub count: u32,
    pub corrupt: bool,
}

fn is_reserved_code(code: u8) -> bool {
    (0x24..0x40).contains(&code) || (0x48..0x80).contains(&code) || (0x91..0xff).contains(&code)
}

/// Walks the whole chain and judges whether it is plausibly a real CIS.
///
/// Attribute memory on a bad or absent card reads back as floating-bus
/// garbage that often parses as a plausible-looking tuple stream, so
/// structural validity is not enough: require a DEVICE-family tuple or a
/// configuration tuple, plus a MANFID or VERS_1, and distrust chains stuffed
/// with reserved codes.
pub fn validate_cis(
    access: &mut dyn CisAccess,
    limits: &ValidationLimits,
) -> Result<ValidateResult> {
    let mut cursor = TupleCursor::new().return_links();
    let mut count = 0u32;
    let mut reserved = 0u32;
    let mut dev_ok = false;
    let mut ident_ok = false;

    let mut step = cursor.first_tuple(access);
    while let Ok(()) = step {
        count += 1;
        match cursor.code {
            codes::DEVICE
            | codes::DEVICE_A
            | codes::DEVICE_OC
            | codes::DEVICE_OA
            | codes::CONFIG
            | codes::CFTABLE_ENTRY => dev_ok = true,
            codes::MANFID | codes::VERS_1 => ident_ok = true,
            code if is_reserved_code(code) => reserved += 1,
            _ => {}
        }
        step = cursor.next_tuple(access);
    }
    match step {
        Ok(()) | Err(CisError::NoMoreItems) => {}
        Err(e) => return Err(e),
    }

    let corrupt = reserved > limits.max_reserved
        || ((!dev_ok || !ident_ok) && count > limits.unidentified_chain_limit);
    if corrupt {
        debug!(count, reserved, dev_ok, ident_ok, "CIS judged corrupt");
    }
    Ok(ValidateResult {
        count: if corrupt { 0 } else { count },
        corrupt,
    })
}
