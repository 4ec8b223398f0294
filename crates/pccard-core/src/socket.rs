use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

use pccard_cis::{CisAccess, CisError, CisSpace, IndirectAccess, LinearAccess, RawCardMemory};

use crate::driver::{
    ControlFlags, SocketCapabilities, SocketDriver, SocketPower, StatusLines, IO_WINDOWS,
    MEM_WINDOWS,
};
use crate::error::{CsError, Result};
use crate::event::{EventHandler, EventMask};

/// Handle for one physical card slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub(crate) usize);

impl SocketId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socket{}", self.0)
    }
}

/// Handle for one (socket, function) driver binding.
///
/// The sequence number makes handles single-use: a slot recycled for a new
/// client invalidates outstanding handles to the old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    pub(crate) socket: SocketId,
    pub(crate) slot: usize,
    pub(crate) seq: u32,
}

impl ClientId {
    pub fn socket(&self) -> SocketId {
        self.socket
    }
}

/// Handle for an open address window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle {
    pub(crate) socket: SocketId,
    pub(crate) kind: WindowKind,
    pub(crate) slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Memory,
    Io,
}

bitflags! {
    /// Per-socket lifecycle flags. The effective phase is a combination of
    /// these, not a single enum.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SocketState: u16 {
        /// A card is present and usable.
        const PRESENT = 1 << 0;
        /// Insertion sequence scheduled or running.
        const SETUP_PENDING = 1 << 1;
        /// Removal teardown scheduled or running.
        const SHUTDOWN_PENDING = 1 << 2;
        /// A reset pulse is in flight; READY glitches are expected and
        /// suppressed.
        const RESET_PENDING = 1 << 3;
        /// Powered down for power management.
        const SUSPENDED = 1 << 4;
    }
}

bitflags! {
    /// Per-client state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ClientState: u8 {
        const IRQ_REQUESTED = 1 << 0;
        const IO_REQUESTED = 1 << 1;
        const CONFIG_LOCKED = 1 << 2;
        /// Deregistered but not yet reaped.
        const UNBOUND = 1 << 3;
        /// Card was removed; grants may be force-released at any time.
        const STALE = 1 << 4;
    }
}

/// Which card function a client is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFunction {
    Function(u8),
    AllFunctions,
}

/// Hardware settle times and retry budgets for one socket.
///
/// Defaults reflect conservative hardware of the era; tests use
/// [`SocketTiming::instant`] so sequences run without real sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketTiming {
    /// Settle time after a detect transition before trusting status.
    pub debounce: Duration,
    /// Vcc ramp time before the card may be accessed.
    pub vcc_settle: Duration,
    /// Width of the reset pulse.
    pub reset_pulse: Duration,
    /// Quiet time after deasserting reset.
    pub unreset_delay: Duration,
    /// Poll interval while waiting for READY.
    pub ready_poll: Duration,
    /// Bounded retry budget for the READY wait.
    pub ready_retries: u32,
    /// Grace period between removal broadcast and force-release.
    pub shutdown_delay: Duration,
}

impl Default for SocketTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            vcc_settle: Duration::from_millis(400),
            reset_pulse: Duration::from_millis(10),
            unreset_delay: Duration::from_millis(100),
            ready_poll: Duration::from_millis(100),
            ready_retries: 30,
            shutdown_delay: Duration::from_millis(30),
        }
    }
}

impl SocketTiming {
    /// Zero delays, small retry budget. For tests and simulated hardware.
    pub fn instant() -> Self {
        Self {
            debounce: Duration::ZERO,
            vcc_settle: Duration::ZERO,
            reset_pulse: Duration::ZERO,
            unreset_delay: Duration::ZERO,
            ready_poll: Duration::ZERO,
            ready_retries: 3,
            shutdown_delay: Duration::ZERO,
        }
    }
}

/// One bound client driver.
pub(crate) struct Client {
    pub(crate) seq: u32,
    pub(crate) function: BindFunction,
    pub(crate) event_mask: EventMask,
    /// Events that fired while masked out; retrievable by the client.
    pub(crate) pending: EventMask,
    pub(crate) state: ClientState,
    /// Shared so events can be delivered without holding the socket lock.
    pub(crate) handler: Arc<Mutex<EventHandler>>,
    /// Granted I/O port ranges.
    pub(crate) io_grants: Vec<(u32, u32)>,
    /// Granted interrupt line and sharing mode.
    pub(crate) irq_grant: Option<(u8, pccard_rsrc::IrqMode)>,
}

/// A locked (or lockable) per-function configuration.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) function: u8,
    pub(crate) locked: bool,
    pub(crate) vcc: u16,
    pub(crate) vpp: u16,
    /// Base offset of the function's configuration registers in attribute
    /// memory.
    pub(crate) reg_base: u32,
    pub(crate) io_ranges: Vec<(u32, u32)>,
    pub(crate) irq_line: Option<u8>,
    /// Whether the configuration routed its interrupt to the host.
    pub(crate) irq_enabled: bool,
    /// Option-register byte programmed at lock time, replayed on resume.
    pub(crate) cor: u8,
}

/// An open address window.
#[derive(Debug, Clone)]
pub(crate) struct Window {
    pub(crate) owner: ClientId,
    pub(crate) base: u32,
    pub(crate) size: u32,
    pub(crate) card_offset: u32,
    /// I/O windows may be shared by multiple functions; the window is only
    /// torn down when the last sharer releases it.
    pub(crate) shares: u32,
    /// Whether the host range came from the window's own pool allocation.
    /// Configuration-mapped windows wrap an existing I/O grant, which keeps
    /// its own pool bookkeeping.
    pub(crate) pool_backed: bool,
}

/// Per-socket state. All mutation happens under the owning mutex in
/// [`crate::CardServices`].
pub(crate) struct Socket {
    pub(crate) id: SocketId,
    /// Driver-local socket number.
    pub(crate) nr: usize,
    pub(crate) driver: Arc<dyn SocketDriver>,
    pub(crate) caps: SocketCapabilities,
    pub(crate) timing: SocketTiming,
    pub(crate) state: SocketState,
    /// Last raw status snapshot.
    pub(crate) status: StatusLines,
    /// Power/control state currently applied to the hardware.
    pub(crate) power: SocketPower,
    pub(crate) clients: Vec<Option<Client>>,
    pub(crate) next_seq: u32,
    pub(crate) configs: HashMap<u8, Config>,
    pub(crate) mem_windows: [Option<Window>; MEM_WINDOWS],
    pub(crate) io_windows: [Option<Window>; IO_WINDOWS],
    /// CIS span cache keyed by (space, logical offset, length). Attribute
    /// memory is slow and gets re-walked by every probing client.
    pub(crate) cis_cache: HashMap<(CisSpace, u32, usize), Vec<u8>>,
    /// Replacement CIS for cards with defective on-card data. Shadows all
    /// attribute reads when present.
    pub(crate) replacement_cis: Option<Vec<u8>>,
}

impl Socket {
    pub(crate) fn new(
        id: SocketId,
        nr: usize,
        driver: Arc<dyn SocketDriver>,
        caps: SocketCapabilities,
        timing: SocketTiming,
    ) -> Self {
        Self {
            id,
            nr,
            driver,
            caps,
            timing,
            state: SocketState::empty(),
            status: StatusLines::empty(),
            power: SocketPower::default(),
            clients: Vec::new(),
            next_seq: 1,
            configs: HashMap::new(),
            mem_windows: Default::default(),
            io_windows: Default::default(),
            cis_cache: HashMap::new(),
            replacement_cis: None,
        }
    }

    pub(crate) fn client(&self, id: ClientId) -> Result<&Client> {
        self.clients
            .get(id.slot)
            .and_then(|c| c.as_ref())
            .filter(|c| c.seq == id.seq)
            .ok_or(CsError::BadClient)
    }

    pub(crate) fn client_mut(&mut self, id: ClientId) -> Result<&mut Client> {
        self.clients
            .get_mut(id.slot)
            .and_then(|c| c.as_mut())
            .filter(|c| c.seq == id.seq)
            .ok_or(CsError::BadClient)
    }

    pub(crate) fn apply_power(&mut self, power: SocketPower) -> Result<()> {
        self.driver.configure(self.nr, &power)?;
        self.power = power;
        Ok(())
    }

    /// Drops everything back to the all-off state.
    pub(crate) fn quiesce(&mut self) {
        if let Err(e) = self.apply_power(SocketPower::default()) {
            warn!(socket = %self.id, error = %e, "quiesce failed");
        }
    }

    /// Vcc level appropriate for the sensed voltage pins, or `None` when the
    /// card wants a voltage this socket cannot supply.
    pub(crate) fn pick_vcc(&self, status: StatusLines) -> Option<u16> {
        if status.contains(StatusLines::VS_X) {
            // X.V cards are rare and unsupported here; refuse power.
            None
        } else if status.contains(StatusLines::VS_3V) {
            self.caps.supports_3v.then_some(33)
        } else {
            self.caps.supports_5v.then_some(50)
        }
    }

    /// Powers the card up, pulses reset, and waits (bounded) for READY.
    ///
    /// Runs in the deferred event context; the sleeps here are cooperative
    /// waits, never inside the interrupt path. Returns `false` when the card
    /// never came ready; the caller treats it as absent.
    pub(crate) fn power_up_sequence(&mut self) -> Result<bool> {
        let status = self.driver.read_state(self.nr);
        let Some(vcc) = self.pick_vcc(status) else {
            warn!(socket = %self.id, "unsupported card voltage, leaving unpowered");
            return Ok(false);
        };

        self.apply_power(SocketPower {
            vcc,
            vpp: 0,
            flags: ControlFlags::RESET,
            io_irq: 0,
        })?;
        std::thread::sleep(self.timing.vcc_settle);
        std::thread::sleep(self.timing.reset_pulse);

        self.apply_power(SocketPower {
            vcc,
            vpp: 0,
            flags: ControlFlags::OUTPUT_ENABLE,
            io_irq: 0,
        })?;
        std::thread::sleep(self.timing.unreset_delay);

        Ok(self.wait_ready())
    }

    /// Bounded READY poll. Exceeding the retry budget logs and reports
    /// not-ready instead of hanging; a user yanking the card mid-sequence is
    /// normal, not exceptional.
    pub(crate) fn wait_ready(&mut self) -> bool {
        for _ in 0..self.timing.ready_retries {
            let status = self.driver.read_state(self.nr);
            if !status.contains(StatusLines::DETECT) {
                debug!(socket = %self.id, "card vanished during ready wait");
                return false;
            }
            if status.contains(StatusLines::READY) {
                return true;
            }
            std::thread::sleep(self.timing.ready_poll);
        }
        warn!(socket = %self.id, retries = self.timing.ready_retries, "ready wait timed out");
        false
    }

    pub(crate) fn invalidate_cis_cache(&mut self) {
        self.cis_cache.clear();
    }

    /// Re-reads every cached CIS span from hardware and compares. A mismatch
    /// means the card was swapped while we were not looking.
    pub(crate) fn cis_cache_matches_hardware(&self) -> bool {
        if self.replacement_cis.is_some() {
            // A replacement CIS never goes stale; trust presence alone.
            return true;
        }
        let mut access = self.raw_cis_access();
        for ((space, offset, len), cached) in &self.cis_cache {
            let mut fresh = vec![0u8; *len];
            if access.read(*space, *offset, &mut fresh).is_err() {
                return false;
            }
            if &fresh != cached {
                return false;
            }
        }
        true
    }

    /// Adapter for this socket's CIS addressing mode, straight to the
    /// hardware with no caching.
    pub(crate) fn raw_cis_access(&self) -> Box<dyn CisAccess> {
        let mem = SocketCardMemory {
            driver: Arc::clone(&self.driver),
            nr: self.nr,
        };
        if self.caps.indirect_cis {
            Box::new(IndirectAccess::new(mem))
        } else {
            Box::new(LinearAccess::new(mem))
        }
    }

    pub(crate) fn has_locked_config(&self) -> bool {
        self.configs.values().any(|c| c.locked)
    }

    pub(crate) fn open_window_count(&self) -> usize {
        self.mem_windows.iter().flatten().count() + self.io_windows.iter().flatten().count()
    }
}

/// Raw card-memory bridge from the CIS adapters to the socket driver.
pub(crate) struct SocketCardMemory {
    driver: Arc<dyn SocketDriver>,
    nr: usize,
}

impl RawCardMemory for SocketCardMemory {
    fn read_raw(&mut self, attribute: bool, offset: u32, buf: &mut [u8]) -> pccard_cis::Result<()> {
        self.driver
            .read_card_memory(self.nr, attribute, offset, buf)
            .map_err(|_| CisError::Access("card memory read failed"))
    }

    fn write_raw(&mut self, attribute: bool, offset: u32, data: &[u8]) -> pccard_cis::Result<()> {
        self.driver
            .write_card_memory(self.nr, attribute, offset, data)
            .map_err(|_| CisError::Access("card memory write failed"))
    }
}

/// Logical CIS access for one socket: replacement CIS first, then the span
/// cache, then the addressing-mode adapter.
///
/// The cache sits *above* the adapter. Indirect addressing funnels every
/// byte through the same data register, so caching raw register traffic
/// would replay the first byte forever; logical spans are safe to replay
/// in both modes.
pub(crate) struct CachedCisAccess<'a> {
    inner: Box<dyn CisAccess>,
    cache: &'a mut HashMap<(CisSpace, u32, usize), Vec<u8>>,
    replacement: Option<&'a [u8]>,
}

impl CisAccess for CachedCisAccess<'_> {
    fn read(&mut self, space: CisSpace, offset: u32, buf: &mut [u8]) -> pccard_cis::Result<()> {
        if space == CisSpace::Attribute {
            if let Some(cis) = self.replacement {
                for (i, dst) in buf.iter_mut().enumerate() {
                    *dst = cis.get(offset as usize + i).copied().unwrap_or(0xff);
                }
                return Ok(());
            }
        }
        let key = (space, offset, buf.len());
        if let Some(cached) = self.cache.get(&key) {
            buf.copy_from_slice(cached);
            return Ok(());
        }
        self.inner.read(space, offset, buf)?;
        self.cache.insert(key, buf.to_vec());
        Ok(())
    }

    fn write(&mut self, space: CisSpace, offset: u32, data: &[u8]) -> pccard_cis::Result<()> {
        if space == CisSpace::Attribute && self.replacement.is_some() {
            return Err(CisError::Access("replacement CIS is read-only"));
        }
        self.inner.write(space, offset, data)?;
        // Cheap correctness: drop the whole cache rather than tracking which
        // spans the write touched.
        self.cache.clear();
        Ok(())
    }
}

/// Builds the socket's cached CIS access. Addressing mode is a socket
/// capability, so no caller ever branches on it.
pub(crate) fn cis_access(socket: &mut Socket) -> CachedCisAccess<'_> {
    let inner = socket.raw_cis_access();
    CachedCisAccess {
        inner,
        cache: &mut socket.cis_cache,
        replacement: socket.replacement_cis.as_deref(),
    }
}
