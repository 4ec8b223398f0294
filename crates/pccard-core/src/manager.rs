use std::fmt::Write as _;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use pccard_cis::{validate_cis, CisAccess, ValidateResult, ValidationLimits};
use pccard_rsrc::{IrqMode, IrqTable, ResourcePool, IRQ_LINES};

use crate::driver::{ControlFlags, SocketCapabilities, SocketDriver, StatusLines};
use crate::error::{CsError, Result};
use crate::event::{Event, EventHandler, EventMask, EventNotice, EventPriority};
use crate::socket::{
    cis_access, BindFunction, Client, ClientId, ClientState, Config, Socket, SocketId, SocketState,
    SocketTiming, Window, WindowHandle, WindowKind,
};

/// Per-function configuration request.
#[derive(Debug, Clone)]
pub struct ConfigRequest {
    /// Index to program into the configuration option register.
    pub index: u8,
    pub vcc: u16,
    pub vpp: u16,
    /// Base offset of the configuration registers in attribute memory
    /// (logical bytes, from the CONFIG tuple).
    pub reg_base: u32,
    /// Route the previously granted interrupt line to the card.
    pub enable_irq: bool,
    /// Level-mode (vs pulse-mode) interrupts.
    pub irq_level: bool,
}

/// Address-window request.
#[derive(Debug, Clone, Copy)]
pub struct WindowRequest {
    pub kind: WindowKind,
    /// Preferred host base, 0 for don't-care.
    pub base: u32,
    pub size: u32,
    /// Card-side offset the window maps to.
    pub card_offset: u32,
}

struct Pools {
    mem: ResourcePool,
    io: ResourcePool,
    irq: IrqTable,
}

/// The socket-services registry: socket map, resource pools, and the deferred
/// event channel. One instance per system; everything hangs off it rather
/// than off process globals.
///
/// Locking is two-level and ordered: a socket's mutex is always taken before
/// the pool mutex, and event callbacks are always invoked with both released.
pub struct CardServices {
    sockets: Mutex<Vec<Option<Arc<Mutex<Socket>>>>>,
    pools: Mutex<Pools>,
    tx: Sender<SocketId>,
    rx: Mutex<Receiver<SocketId>>,
    limits: ValidationLimits,
}

impl CardServices {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            sockets: Mutex::new(Vec::new()),
            pools: Mutex::new(Pools {
                mem: ResourcePool::new(),
                io: ResourcePool::new(),
                irq: IrqTable::new(),
            }),
            tx,
            rx: Mutex::new(rx),
            limits: ValidationLimits::default(),
        }
    }

    // ---- resource database ------------------------------------------------

    pub fn add_memory_range(&self, base: u32, len: u32) -> Result<()> {
        Ok(self.pools.lock().unwrap().mem.add_range(base, len)?)
    }

    pub fn add_io_range(&self, base: u32, len: u32) -> Result<()> {
        Ok(self.pools.lock().unwrap().io.add_range(base, len)?)
    }

    pub fn remove_memory_range(&self, base: u32, len: u32) -> Result<()> {
        Ok(self.pools.lock().unwrap().mem.remove_range(base, len)?)
    }

    pub fn remove_io_range(&self, base: u32, len: u32) -> Result<()> {
        Ok(self.pools.lock().unwrap().io.remove_range(base, len)?)
    }

    /// Pins an interrupt line so it is never handed to a card.
    pub fn reserve_irq(&self, line: u8) -> Result<()> {
        Ok(self.pools.lock().unwrap().irq.reserve(line)?)
    }

    /// Weeds out unusable memory ranges with a destructive probe.
    pub fn probe_memory(&self, probe: &mut dyn pccard_rsrc::MemoryProbe) -> Result<()> {
        Ok(pccard_rsrc::probe_memory(&mut self.pools.lock().unwrap().mem, probe)?)
    }

    // ---- socket attach/detach --------------------------------------------

    /// Registers a socket driver and creates one socket per slot it serves.
    /// Slots with a card already seated get their setup sequence queued.
    pub fn attach(
        &self,
        driver: Arc<dyn SocketDriver>,
        caps: SocketCapabilities,
        timing: SocketTiming,
    ) -> Result<Vec<SocketId>> {
        let count = driver.init()?;
        let mut ids = Vec::with_capacity(count);
        let mut sockets = self.sockets.lock().unwrap();
        for nr in 0..count {
            let id = SocketId(sockets.len());
            let socket = Socket::new(id, nr, Arc::clone(&driver), caps, timing);
            sockets.push(Some(Arc::new(Mutex::new(socket))));
            info!(socket = %id, "socket attached");
            ids.push(id);
            // Seed the status diff so a seated card looks like an insertion.
            let _ = self.tx.send(id);
        }
        Ok(ids)
    }

    /// Removes a socket. A present card gets the full removal treatment
    /// (removal broadcast, force-release) before the slot is dropped.
    /// Dropping the last socket a driver serves also shuts the driver down.
    pub fn detach(&self, id: SocketId) -> Result<()> {
        let arc = self.socket_arc(id)?;
        {
            let socket = arc.lock().unwrap();
            if socket.state.contains(SocketState::PRESENT) {
                drop(socket);
                self.run_removal(&arc);
            }
        }
        let mut socket = arc.lock().unwrap();
        socket.quiesce();
        socket.clients.clear();
        socket.invalidate_cis_cache();
        let driver = Arc::clone(&socket.driver);
        drop(socket);
        let last_for_driver = {
            let mut sockets = self.sockets.lock().unwrap();
            sockets[id.0] = None;
            !sockets
                .iter()
                .flatten()
                .any(|s| Arc::ptr_eq(&s.lock().unwrap().driver, &driver))
        };
        if last_for_driver {
            // No socket left on this driver: final hardware power-down.
            driver.shutdown();
        }
        info!(socket = %id, "socket detached");
        Ok(())
    }

    // ---- interrupt-side entry point and the worker ------------------------

    /// The one entry point safe to call from interrupt context: records that
    /// the socket's status lines changed and returns. All actual work happens
    /// in [`service_pending`](Self::service_pending) or the worker thread.
    pub fn notify(&self, id: SocketId) {
        let _ = self.tx.send(id);
    }

    /// Drains queued status changes and runs the resulting sequences.
    /// Returns how many notifications were handled. Tests pump this by hand;
    /// production uses [`spawn_worker`](Self::spawn_worker).
    pub fn service_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let id = match self.rx.lock().unwrap().try_recv() {
                Ok(id) => id,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            };
            self.service_socket(id);
            handled += 1;
        }
        handled
    }

    /// Spawns the deferred-work thread. It exits when `self` is dropped
    /// (channel disconnect).
    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let services = Arc::clone(self);
        std::thread::Builder::new()
            .name("pccard-events".into())
            .spawn(move || loop {
                let id = {
                    let rx = services.rx.lock().unwrap();
                    match rx.recv() {
                        Ok(id) => id,
                        Err(_) => break,
                    }
                };
                services.service_socket(id);
            })
            .unwrap_or_else(|e| panic!("failed to spawn event worker: {e}"))
    }

    fn service_socket(&self, id: SocketId) {
        let Ok(arc) = self.socket_arc(id) else {
            debug!(socket = %id, "notification for dead socket");
            return;
        };

        let (old, new, suspended) = {
            let mut socket = arc.lock().unwrap();
            let new = socket.driver.read_state(socket.nr);
            let old = socket.status;
            socket.status = new;
            (old, new, socket.state.contains(SocketState::SUSPENDED))
        };
        let changed = old ^ new;

        if suspended {
            // Everything but removal waits for resume.
            if !new.contains(StatusLines::DETECT) {
                self.run_removal(&arc);
            }
            return;
        }

        let present = arc.lock().unwrap().state.contains(SocketState::PRESENT);

        if new.contains(StatusLines::DETECT) && !present {
            self.run_insertion(&arc);
            return;
        }
        if !new.contains(StatusLines::DETECT) && present {
            self.run_removal(&arc);
            return;
        }

        if !present {
            return;
        }

        if changed.intersects(StatusLines::VS_3V | StatusLines::VS_X) {
            // Voltage sense moved under a seated card: it was swapped for a
            // different card without a clean detect transition.
            self.run_removal(&arc);
            let _ = self.tx.send(id);
            return;
        }

        if changed.contains(StatusLines::READY) {
            let suppress = arc.lock().unwrap().state.contains(SocketState::RESET_PENDING);
            if !suppress {
                self.broadcast(&arc, Event::ReadyChange(new.contains(StatusLines::READY)));
            }
        }
        if changed.contains(StatusLines::BVD1) && !new.contains(StatusLines::BVD1) {
            self.broadcast(&arc, Event::BatteryDead);
        } else if changed.contains(StatusLines::BVD2) && !new.contains(StatusLines::BVD2) {
            self.broadcast(&arc, Event::BatteryLow);
        }
        if changed.intersects(StatusLines::WRITE_PROTECT) {
            self.broadcast(&arc, Event::StatusChange);
        }
    }

    // ---- insertion / removal sequences ------------------------------------

    fn run_insertion(&self, arc: &Arc<Mutex<Socket>>) {
        {
            let mut socket = arc.lock().unwrap();
            if socket
                .state
                .intersects(SocketState::PRESENT | SocketState::SETUP_PENDING)
            {
                return;
            }
            socket.state.insert(SocketState::SETUP_PENDING);
            std::thread::sleep(socket.timing.debounce);

            // Re-sample after debounce; contact bounce shows up as a detect
            // glitch that has already cleared.
            let status = socket.driver.read_state(socket.nr);
            socket.status = status;
            if !status.contains(StatusLines::DETECT) {
                debug!(socket = %socket.id, "detect bounced away");
                socket.state.remove(SocketState::SETUP_PENDING);
                return;
            }

            let ready = match socket.power_up_sequence() {
                Ok(ready) => ready,
                Err(e) => {
                    warn!(socket = %socket.id, error = %e, "power-up failed");
                    false
                }
            };
            socket.state.remove(SocketState::SETUP_PENDING);
            if !ready {
                socket.quiesce();
                return;
            }

            socket.invalidate_cis_cache();
            socket.state.insert(SocketState::PRESENT);
            for client in socket.clients.iter_mut().flatten() {
                client.state.remove(ClientState::STALE);
            }
            info!(socket = %socket.id, "card present");
        }
        self.broadcast(arc, Event::CardInsertion);
    }

    fn run_removal(&self, arc: &Arc<Mutex<Socket>>) {
        // Removal delivery happens before any teardown so clients always see
        // "card gone" while their grants are still nominally alive.
        {
            let mut socket = arc.lock().unwrap();
            if !socket.state.contains(SocketState::PRESENT) {
                socket.state.remove(SocketState::SETUP_PENDING);
                return;
            }
            socket.state.insert(SocketState::SHUTDOWN_PENDING);
            for client in socket.clients.iter_mut().flatten() {
                client.state.insert(ClientState::STALE);
            }
        }
        self.broadcast_priority(arc, Event::CardRemoval, EventPriority::High);

        let mut socket = arc.lock().unwrap();
        std::thread::sleep(socket.timing.shutdown_delay);
        self.force_release_locked(&mut socket);
        socket.invalidate_cis_cache();
        socket.replacement_cis = None;
        socket
            .state
            .remove(SocketState::PRESENT | SocketState::SHUTDOWN_PENDING | SocketState::RESET_PENDING);
        socket.quiesce();
        info!(socket = %socket.id, "card removed");
    }

    /// Returns every grant on this socket to the pools. Called with the
    /// socket lock held; takes the pool lock second, per the lock order.
    fn force_release_locked(&self, socket: &mut Socket) {
        let mut pools = self.pools.lock().unwrap();
        for client in socket.clients.iter_mut().flatten() {
            for (base, len) in client.io_grants.drain(..) {
                if let Err(e) = pools.io.release(base, len) {
                    warn!(base, len, error = %e, "io force-release failed");
                }
            }
            if let Some((line, mode)) = client.irq_grant.take() {
                if let Err(e) = pools.irq.release(line, mode) {
                    warn!(line, error = %e, "irq force-release failed");
                }
            }
            client
                .state
                .remove(ClientState::IO_REQUESTED | ClientState::IRQ_REQUESTED | ClientState::CONFIG_LOCKED);
        }
        for slot in socket.mem_windows.iter_mut() {
            if let Some(w) = slot.take() {
                if !w.pool_backed {
                    continue;
                }
                if let Err(e) = pools.mem.release(w.base, w.size) {
                    warn!(base = w.base, error = %e, "memory window force-release failed");
                }
            }
        }
        for slot in socket.io_windows.iter_mut() {
            if let Some(w) = slot.take() {
                if !w.pool_backed {
                    continue;
                }
                if let Err(e) = pools.io.release(w.base, w.size) {
                    warn!(base = w.base, error = %e, "io window force-release failed");
                }
            }
        }
        socket.configs.clear();
    }

    // ---- event delivery ----------------------------------------------------

    fn broadcast(&self, arc: &Arc<Mutex<Socket>>, event: Event) -> bool {
        self.broadcast_priority(arc, event, EventPriority::Low)
    }

    /// Delivers `event` to every subscribed client. Handlers run with the
    /// socket lock released so they may call back into `CardServices`.
    /// Returns true when a vetoable event was vetoed.
    fn broadcast_priority(
        &self,
        arc: &Arc<Mutex<Socket>>,
        event: Event,
        priority: EventPriority,
    ) -> bool {
        let bit = event.mask_bit();
        let (id, handlers) = {
            let mut socket = arc.lock().unwrap();
            let id = socket.id;
            let mut handlers: Vec<Arc<Mutex<EventHandler>>> = Vec::new();
            for client in socket.clients.iter_mut().flatten() {
                if client.state.contains(ClientState::UNBOUND) {
                    continue;
                }
                if client.event_mask.contains(bit) {
                    handlers.push(Arc::clone(&client.handler));
                } else {
                    client.pending.insert(bit);
                }
            }
            (id, handlers)
        };

        let notice = EventNotice {
            socket: id,
            event,
            priority,
        };
        let mut vetoed = false;
        for handler in handlers {
            let mut callback = handler.lock().unwrap();
            let result = (*callback)(&notice);
            if event.is_vetoable() && result.is_err() {
                vetoed = true;
            }
        }
        vetoed
    }

    // ---- client registry ---------------------------------------------------

    /// Binds a client driver to a socket function. Binding to an empty socket
    /// is allowed; the client simply waits for CardInsertion. If a card is
    /// already present the insertion event is delivered immediately.
    pub fn bind_client(
        &self,
        id: SocketId,
        function: BindFunction,
        event_mask: EventMask,
        handler: EventHandler,
    ) -> Result<ClientId> {
        let arc = self.socket_arc(id)?;
        let (client_id, present) = {
            let mut socket = arc.lock().unwrap();
            let seq = socket.next_seq;
            socket.next_seq += 1;
            let client = Client {
                seq,
                function,
                event_mask,
                pending: EventMask::empty(),
                state: ClientState::empty(),
                handler: Arc::new(Mutex::new(handler)),
                io_grants: Vec::new(),
                irq_grant: None,
            };
            let slot = match socket.clients.iter().position(Option::is_none) {
                Some(slot) => {
                    socket.clients[slot] = Some(client);
                    slot
                }
                None => {
                    socket.clients.push(Some(client));
                    socket.clients.len() - 1
                }
            };
            let present = socket.state.contains(SocketState::PRESENT);
            (
                ClientId {
                    socket: id,
                    slot,
                    seq,
                },
                present,
            )
        };

        self.deliver_to(&arc, client_id, Event::RegistrationComplete);
        if present {
            self.deliver_to(&arc, client_id, Event::CardInsertion);
        } else {
            // A seated but never-set-up card (no clients until now) should
            // start its setup when the first interested driver arrives.
            let status = {
                let socket = arc.lock().unwrap();
                socket.driver.read_state(socket.nr)
            };
            if status.contains(StatusLines::DETECT) {
                let _ = self.tx.send(id);
            }
        }
        Ok(client_id)
    }

    /// Delivers one event to a single client, respecting its mask.
    fn deliver_to(&self, arc: &Arc<Mutex<Socket>>, id: ClientId, event: Event) {
        let bit = event.mask_bit();
        let handler = {
            let mut socket = arc.lock().unwrap();
            let Ok(client) = socket.client_mut(id) else {
                return;
            };
            if client.event_mask.contains(bit) {
                Some(Arc::clone(&client.handler))
            } else {
                client.pending.insert(bit);
                None
            }
        };
        if let Some(handler) = handler {
            let notice = EventNotice {
                socket: id.socket,
                event,
                priority: EventPriority::Low,
            };
            let mut callback = handler.lock().unwrap();
            let _ = (*callback)(&notice);
        }
    }

    /// Unbinds a client. Fails while the client still holds grants, except
    /// for stale clients (card already gone) whose grants were force-released.
    pub fn deregister_client(&self, id: ClientId) -> Result<()> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        let client = socket.client(id)?;
        let stale = client.state.contains(ClientState::STALE);
        let live_grants = !client.io_grants.is_empty()
            || client.irq_grant.is_some()
            || client.state.contains(ClientState::CONFIG_LOCKED);
        if live_grants && !stale {
            return Err(CsError::InUse);
        }
        let owns_window = socket
            .mem_windows
            .iter()
            .chain(socket.io_windows.iter())
            .flatten()
            .any(|w| w.owner == id);
        if owns_window && !stale {
            return Err(CsError::InUse);
        }
        socket.clients[id.slot] = None;
        Ok(())
    }

    /// Replaces the client's subscription mask, returning events that fired
    /// while masked out.
    pub fn set_event_mask(&self, id: ClientId, mask: EventMask) -> Result<EventMask> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        let client = socket.client_mut(id)?;
        client.event_mask = mask;
        Ok(std::mem::take(&mut client.pending))
    }

    // ---- status -----------------------------------------------------------

    /// Current status lines and lifecycle flags for one socket.
    pub fn get_status(&self, id: SocketId) -> Result<(StatusLines, SocketState)> {
        let arc = self.socket_arc(id)?;
        let socket = arc.lock().unwrap();
        let status = socket.driver.read_state(socket.nr);
        Ok((status, socket.state))
    }

    /// Human-readable dump of one socket, for diagnostics.
    pub fn status_report(&self, id: SocketId) -> Result<String> {
        let arc = self.socket_arc(id)?;
        let socket = arc.lock().unwrap();
        let mut out = String::new();
        let _ = writeln!(out, "{}: state {:?}, status {:?}", socket.id, socket.state, socket.status);
        let _ = writeln!(
            out,
            "  power: vcc {}.{} V, vpp {}.{} V, flags {:?}",
            socket.power.vcc / 10,
            socket.power.vcc % 10,
            socket.power.vpp / 10,
            socket.power.vpp % 10,
            socket.power.flags
        );
        for (i, client) in socket.clients.iter().enumerate() {
            if let Some(c) = client {
                let io: Vec<String> = c
                    .io_grants
                    .iter()
                    .map(|(base, len)| format!("{base:#x}+{len:#x}"))
                    .collect();
                let _ = writeln!(
                    out,
                    "  client {}: fn {:?}, state {:?}, io [{}], irq {:?}",
                    i,
                    c.function,
                    c.state,
                    io.join(", "),
                    c.irq_grant
                );
            }
        }
        for config in socket.configs.values() {
            let _ = writeln!(
                out,
                "  config fn {}: locked {}, reg_base {:#x}, irq {:?}",
                config.function, config.locked, config.reg_base, config.irq_line
            );
        }
        for (i, w) in socket.mem_windows.iter().enumerate() {
            if let Some(w) = w {
                let _ = writeln!(
                    out,
                    "  mem window {}: {:#x}+{:#x} -> card {:#x}",
                    i, w.base, w.size, w.card_offset
                );
            }
        }
        for (i, w) in socket.io_windows.iter().enumerate() {
            if let Some(w) = w {
                let _ = writeln!(
                    out,
                    "  io window {}: {:#x}+{:#x} shares {}",
                    i, w.base, w.size, w.shares
                );
            }
        }
        Ok(out)
    }

    // ---- resource grants ---------------------------------------------------

    /// Grants an I/O port range to a client. `align == 0` with a nonzero base
    /// requests that exact base.
    pub fn request_io(&self, id: ClientId, base: u32, len: u32, align: u32) -> Result<u32> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        self.require_card(&socket)?;
        socket.client(id)?;
        let granted = self.pools.lock().unwrap().io.find(base, len, align)?;
        let client = socket.client_mut(id)?;
        client.io_grants.push((granted, len));
        client.state.insert(ClientState::IO_REQUESTED);
        Ok(granted)
    }

    pub fn release_io(&self, id: ClientId, base: u32, len: u32) -> Result<()> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        let client = socket.client_mut(id)?;
        let pos = client
            .io_grants
            .iter()
            .position(|g| *g == (base, len))
            .ok_or(CsError::BadArgs("not a live grant"))?;
        client.io_grants.remove(pos);
        if client.io_grants.is_empty() {
            client.state.remove(ClientState::IO_REQUESTED);
        }
        self.pools.lock().unwrap().io.release(base, len)?;
        Ok(())
    }

    /// Grants an interrupt line. `preferred` pins a specific line; otherwise
    /// the first free line in the socket's routing mask wins.
    pub fn request_irq(&self, id: ClientId, mode: IrqMode, preferred: Option<u8>) -> Result<u8> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        self.require_card(&socket)?;
        if socket.client(id)?.irq_grant.is_some() {
            return Err(CsError::InUse);
        }
        let mask = socket.caps.irq_mask;
        let line = {
            let mut pools = self.pools.lock().unwrap();
            match preferred {
                Some(line) => {
                    if line as usize >= IRQ_LINES || mask & (1 << line) == 0 {
                        return Err(CsError::BadArgs("line not routable on this socket"));
                    }
                    pools.irq.request(line, mode)?;
                    line
                }
                None => {
                    let line = pools.irq.find_free(mask).ok_or(CsError::OutOfResource)?;
                    pools.irq.request(line, mode)?;
                    line
                }
            }
        };
        let client = socket.client_mut(id)?;
        client.irq_grant = Some((line, mode));
        client.state.insert(ClientState::IRQ_REQUESTED);
        Ok(line)
    }

    pub fn release_irq(&self, id: ClientId) -> Result<()> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        let client = socket.client_mut(id)?;
        let (line, mode) = client.irq_grant.take().ok_or(CsError::BadArgs("no irq granted"))?;
        client.state.remove(ClientState::IRQ_REQUESTED);
        self.pools.lock().unwrap().irq.release(line, mode)?;
        Ok(())
    }

    /// Opens an address window. Size must honor the socket's granularity for
    /// memory windows; I/O windows on a static map reuse an existing window
    /// covering the same range instead of burning a slot.
    pub fn request_window(&self, id: ClientId, req: &WindowRequest) -> Result<WindowHandle> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        self.require_card(&socket)?;
        socket.client(id)?;

        if req.size == 0 {
            return Err(CsError::BadArgs("zero-size window"));
        }
        if req.kind == WindowKind::Memory {
            let gran = socket.caps.page_granularity;
            if req.size % gran != 0 || req.base % gran != 0 {
                return Err(CsError::BadSize {
                    size: req.size,
                    granularity: gran,
                });
            }
        }

        if req.kind == WindowKind::Io && req.base != 0 {
            for (slot, entry) in socket.io_windows.iter_mut().enumerate() {
                if let Some(w) = entry {
                    if w.base == req.base && w.size == req.size {
                        w.shares += 1;
                        return Ok(WindowHandle {
                            socket: id.socket,
                            kind: WindowKind::Io,
                            slot,
                        });
                    }
                }
            }
        }

        let free_slot = match req.kind {
            WindowKind::Memory => socket.mem_windows.iter().position(Option::is_none),
            WindowKind::Io => socket.io_windows.iter().position(Option::is_none),
        };
        let slot = free_slot.ok_or(CsError::OutOfResource)?;

        // A stated base is binding; otherwise memory windows float on page
        // boundaries and I/O windows take the first fit.
        let align = if req.base != 0 {
            0
        } else if req.kind == WindowKind::Memory {
            socket.caps.page_granularity
        } else {
            1
        };
        let base = {
            let mut pools = self.pools.lock().unwrap();
            let pool = match req.kind {
                WindowKind::Memory => &mut pools.mem,
                WindowKind::Io => &mut pools.io,
            };
            pool.find(req.base, req.size, align)?
        };

        let window = Window {
            owner: id,
            base,
            size: req.size,
            card_offset: req.card_offset,
            shares: 1,
            pool_backed: true,
        };
        match req.kind {
            WindowKind::Memory => socket.mem_windows[slot] = Some(window),
            WindowKind::Io => socket.io_windows[slot] = Some(window),
        }
        Ok(WindowHandle {
            socket: id.socket,
            kind: req.kind,
            slot,
        })
    }

    pub fn release_window(&self, handle: WindowHandle) -> Result<()> {
        let arc = self.socket_arc(handle.socket)?;
        let mut socket = arc.lock().unwrap();
        let slot = match handle.kind {
            WindowKind::Memory => socket
                .mem_windows
                .get_mut(handle.slot)
                .ok_or(CsError::BadArgs("bad window slot"))?,
            WindowKind::Io => socket
                .io_windows
                .get_mut(handle.slot)
                .ok_or(CsError::BadArgs("bad window slot"))?,
        };
        let w = slot.as_mut().ok_or(CsError::BadArgs("window not open"))?;
        if w.shares > 1 {
            w.shares -= 1;
            return Ok(());
        }
        let (base, size, pool_backed) = (w.base, w.size, w.pool_backed);
        *slot = None;
        if pool_backed {
            let mut pools = self.pools.lock().unwrap();
            let pool = match handle.kind {
                WindowKind::Memory => &mut pools.mem,
                WindowKind::Io => &mut pools.io,
            };
            pool.release(base, size)?;
        }
        Ok(())
    }

    // ---- configuration ----------------------------------------------------

    /// Locks a function configuration and programs the card's configuration
    /// option register. The grant is built completely before anything is
    /// committed; a failure leaves the socket untouched.
    pub fn request_configuration(&self, id: ClientId, req: &ConfigRequest) -> Result<()> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        self.require_card(&socket)?;
        let client = socket.client(id)?;
        if client.state.contains(ClientState::STALE) {
            return Err(CsError::NoCard);
        }
        let function = match client.function {
            BindFunction::Function(f) => f,
            BindFunction::AllFunctions => 0,
        };
        if socket.configs.get(&function).is_some_and(|c| c.locked) {
            return Err(CsError::ConfigurationLocked);
        }
        if req.enable_irq && client.irq_grant.is_none() {
            return Err(CsError::BadArgs("irq enable without a granted line"));
        }

        // COR: configuration index, plus level-mode interrupt select.
        let mut cor = req.index & 0x3f;
        if req.irq_level {
            cor |= 0x40;
        }

        let irq_line = client.irq_grant.map(|(line, _)| line);
        let io_ranges = client.io_grants.clone();
        let config = Config {
            function,
            locked: true,
            vcc: req.vcc,
            vpp: req.vpp,
            reg_base: req.reg_base,
            io_ranges: io_ranges.clone(),
            irq_line,
            irq_enabled: req.enable_irq,
            cor,
        };

        // Plan the I/O window map before touching anything: each granted
        // range either joins an identical existing window or needs a free
        // slot. Running out of slots must not leave a half-applied config.
        let mut joins: Vec<usize> = Vec::new();
        let mut fresh: Vec<(u32, u32)> = Vec::new();
        for &(base, len) in &io_ranges {
            match socket
                .io_windows
                .iter()
                .position(|w| matches!(w, Some(w) if w.base == base && w.size == len))
            {
                Some(slot) => joins.push(slot),
                None => fresh.push((base, len)),
            }
        }
        let free_slots: Vec<usize> = socket
            .io_windows
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        if fresh.len() > free_slots.len() {
            return Err(CsError::OutOfResource);
        }

        // Commit point: power first, then the card register, then our state.
        // A failed register write rolls the power back so an aborted request
        // leaves the socket exactly as it found it.
        let prior_power = socket.power;
        let mut power = prior_power;
        power.vcc = req.vcc;
        power.vpp = req.vpp;
        power.flags.insert(ControlFlags::OUTPUT_ENABLE);
        if req.enable_irq {
            power.flags.insert(ControlFlags::IRQ_ENABLE);
            power.io_irq = irq_line.unwrap_or(0);
        }
        socket.apply_power(power)?;

        let reg_base = req.reg_base;
        let cor_write = {
            let mut access = cis_access(&mut socket);
            access.write(pccard_cis::CisSpace::Attribute, reg_base, &[cor])
        };
        if let Err(e) = cor_write {
            if let Err(pe) = socket.apply_power(prior_power) {
                warn!(socket = %id.socket, error = %pe, "power rollback failed");
            }
            return Err(e.into());
        }

        for slot in joins {
            if let Some(w) = socket.io_windows[slot].as_mut() {
                w.shares += 1;
            }
        }
        for ((base, len), slot) in fresh.into_iter().zip(free_slots) {
            socket.io_windows[slot] = Some(Window {
                owner: id,
                base,
                size: len,
                card_offset: 0,
                shares: 1,
                pool_backed: false,
            });
        }

        socket.configs.insert(function, config);
        let client = socket.client_mut(id)?;
        client.state.insert(ClientState::CONFIG_LOCKED);
        debug!(socket = %id.socket, function, index = req.index, "configuration locked");
        Ok(())
    }

    /// Unlocks a client's configuration. Dropping the last lock on a socket
    /// also drops Vpp and stops routing the card interrupt.
    pub fn release_configuration(&self, id: ClientId) -> Result<()> {
        let arc = self.socket_arc(id.socket)?;
        let mut socket = arc.lock().unwrap();
        let client = socket.client_mut(id)?;
        if !client.state.contains(ClientState::CONFIG_LOCKED) {
            return Err(CsError::BadArgs("no configuration locked"));
        }
        client.state.remove(ClientState::CONFIG_LOCKED);
        let function = match client.function {
            BindFunction::Function(f) => f,
            BindFunction::AllFunctions => 0,
        };
        if let Some(config) = socket.configs.get_mut(&function) {
            config.locked = false;
        }

        // Unmap this configuration's share of the I/O windows; a window stays
        // up while another function still references it.
        let ranges = socket
            .configs
            .get(&function)
            .map(|c| c.io_ranges.clone())
            .unwrap_or_default();
        for idx in 0..socket.io_windows.len() {
            let Some(w) = socket.io_windows[idx].as_mut() else {
                continue;
            };
            if w.pool_backed || !ranges.contains(&(w.base, w.size)) {
                continue;
            }
            if w.shares > 1 {
                w.shares -= 1;
            } else {
                socket.io_windows[idx] = None;
            }
        }

        if !socket.has_locked_config() && socket.state.contains(SocketState::PRESENT) {
            let mut power = socket.power;
            power.vpp = 0;
            power.flags.remove(ControlFlags::IRQ_ENABLE);
            power.io_irq = 0;
            socket.apply_power(power)?;
        }
        Ok(())
    }

    // ---- reset / power management -----------------------------------------

    /// Resets the card. Any subscriber may veto; a vetoed reset changes
    /// nothing and reports `ResetComplete { ok: false }`. Returns whether the
    /// pulse was driven and the card came back ready; a card that never
    /// comes back ready is torn down as if it had been removed.
    pub fn reset(&self, id: SocketId) -> Result<bool> {
        let arc = self.socket_arc(id)?;
        {
            let socket = arc.lock().unwrap();
            self.require_card(&socket)?;
            if socket
                .state
                .intersects(SocketState::RESET_PENDING | SocketState::SHUTDOWN_PENDING)
            {
                return Err(CsError::InUse);
            }
        }

        if self.broadcast(&arc, Event::ResetRequest) {
            debug!(socket = %id, "reset vetoed");
            self.broadcast(&arc, Event::ResetComplete { ok: false });
            return Ok(false);
        }

        arc.lock().unwrap().state.insert(SocketState::RESET_PENDING);
        self.broadcast(&arc, Event::ResetPhysical);

        let ok = {
            let mut socket = arc.lock().unwrap();
            let mut power = socket.power;
            power.flags.insert(ControlFlags::RESET);
            let pulsed = socket.apply_power(power).is_ok();
            std::thread::sleep(socket.timing.reset_pulse);
            power.flags.remove(ControlFlags::RESET);
            let released = socket.apply_power(power).is_ok();
            std::thread::sleep(socket.timing.unreset_delay);
            let ok = pulsed && released && socket.wait_ready();
            socket.state.remove(SocketState::RESET_PENDING);
            if ok {
                socket.invalidate_cis_cache();
            }
            ok
        };
        self.broadcast(&arc, Event::ResetComplete { ok });
        if !ok {
            // The card never came back; treat it like a yank so clients do
            // not keep talking to a wedged card.
            warn!(socket = %id, "card not ready after reset, forcing removal");
            self.run_removal(&arc);
        }
        Ok(ok)
    }

    /// Powers the socket down for system suspend. Grants stay recorded; the
    /// card keeps nothing.
    pub fn suspend(&self, id: SocketId) -> Result<()> {
        let arc = self.socket_arc(id)?;
        {
            let mut socket = arc.lock().unwrap();
            self.require_card(&socket)?;
            if socket.state.contains(SocketState::SUSPENDED) {
                return Ok(());
            }
            socket.state.insert(SocketState::SUSPENDED);
        }
        self.broadcast(&arc, Event::PmSuspend);
        let mut socket = arc.lock().unwrap();
        socket.quiesce();
        Ok(())
    }

    /// Restores power after suspend. The cached CIS is checked against fresh
    /// hardware reads; a mismatch means a card swap happened while asleep, so
    /// the socket goes through a full removal + insertion instead. The same
    /// card gets its locked configurations reprogrammed (Vpp, interrupt
    /// routing, option register), since the card lost them while unpowered.
    pub fn resume(&self, id: SocketId) -> Result<()> {
        let arc = self.socket_arc(id)?;
        let swapped = {
            let mut socket = arc.lock().unwrap();
            if !socket.state.contains(SocketState::SUSPENDED) {
                return Ok(());
            }
            socket.state.remove(SocketState::SUSPENDED);
            let status = socket.driver.read_state(socket.nr);
            socket.status = status;
            if !status.contains(StatusLines::DETECT) {
                drop(socket);
                self.run_removal(&arc);
                return Ok(());
            }
            let ready = socket.power_up_sequence()?;
            if !ready {
                drop(socket);
                self.run_removal(&arc);
                return Ok(());
            }
            let swapped = !socket.cis_cache_matches_hardware();
            if !swapped {
                if let Err(e) = self.restore_configurations(&mut socket) {
                    warn!(socket = %id, error = %e, "configuration restore failed");
                    drop(socket);
                    self.run_removal(&arc);
                    return Ok(());
                }
            }
            swapped
        };
        if swapped {
            info!(socket = %id, "card changed during suspend");
            self.run_removal(&arc);
            let _ = self.tx.send(id);
        } else {
            self.broadcast(&arc, Event::PmResume);
        }
        Ok(())
    }

    /// Reapplies every locked configuration to a freshly repowered card.
    fn restore_configurations(&self, socket: &mut Socket) -> Result<()> {
        let locked: Vec<Config> = socket.configs.values().filter(|c| c.locked).cloned().collect();
        if locked.is_empty() {
            return Ok(());
        }
        let mut power = socket.power;
        power.flags.insert(ControlFlags::OUTPUT_ENABLE);
        for config in &locked {
            power.vcc = config.vcc;
            power.vpp = config.vpp;
            if config.irq_enabled {
                if let Some(line) = config.irq_line {
                    power.flags.insert(ControlFlags::IRQ_ENABLE);
                    power.io_irq = line;
                }
            }
        }
        socket.apply_power(power)?;
        for config in &locked {
            let mut access = cis_access(socket);
            access.write(
                pccard_cis::CisSpace::Attribute,
                config.reg_base,
                &[config.cor],
            )?;
        }
        debug!(socket = %socket.id, count = locked.len(), "configurations restored after resume");
        Ok(())
    }

    // ---- CIS surface -------------------------------------------------------

    /// Runs `f` with logical CIS access to the socket's card (cached,
    /// replacement-aware, in the socket's addressing mode).
    pub fn with_cis_access<R>(
        &self,
        id: SocketId,
        f: impl FnOnce(&mut dyn CisAccess) -> R,
    ) -> Result<R> {
        let arc = self.socket_arc(id)?;
        let mut socket = arc.lock().unwrap();
        self.require_card(&socket)?;
        let mut access = cis_access(&mut socket);
        Ok(f(&mut access))
    }

    /// Judges whether the card's CIS is plausible.
    pub fn validate(&self, id: SocketId) -> Result<ValidateResult> {
        let limits = self.limits;
        self.with_cis_access(id, |access| validate_cis(access, &limits))?
            .map_err(Into::into)
    }

    /// Installs a replacement CIS that shadows all attribute reads, for cards
    /// shipped with broken on-card data. Takes logical bytes.
    pub fn replace_cis(&self, id: SocketId, cis: Vec<u8>) -> Result<()> {
        if cis.is_empty() || cis.len() > 0x1000 {
            return Err(CsError::BadArgs("replacement CIS size"));
        }
        let arc = self.socket_arc(id)?;
        let mut socket = arc.lock().unwrap();
        socket.invalidate_cis_cache();
        socket.replacement_cis = Some(cis);
        Ok(())
    }

    // ---- internals ---------------------------------------------------------

    fn socket_arc(&self, id: SocketId) -> Result<Arc<Mutex<Socket>>> {
        self.sockets
            .lock()
            .unwrap()
            .get(id.0)
            .and_then(|s| s.clone())
            .ok_or(CsError::BadSocket(id.0))
    }

    fn require_card(&self, socket: &Socket) -> Result<()> {
        if !socket.state.contains(SocketState::PRESENT) {
            return Err(CsError::NoCard);
        }
        Ok(())
    }
}

impl Default for CardServices {
    fn default() -> Self {
        Self::new()
    }
}
