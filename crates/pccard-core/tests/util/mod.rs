#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use pccard_core::{
    CardServices, Event, EventHandler, SocketCapabilities, SocketDriver, SocketId, SocketPower,
    SocketTiming, StatusLines,
};

/// Simulated socket hardware: one slot, a logical attribute-memory CIS, and a
/// log of every power/control write.
pub struct FakeSocket {
    pub inner: Mutex<FakeInner>,
}

pub struct FakeInner {
    pub detect: bool,
    pub battery_ok: bool,
    /// READY stays low no matter what, as on a wedged card.
    pub ready_stuck: bool,
    /// Attribute-memory writes fail, as behind a broken window.
    pub fail_attribute_writes: bool,
    /// Logical CIS bytes; the bus exposes them at even offsets only.
    pub cis: Vec<u8>,
    pub power: SocketPower,
    pub configure_log: Vec<SocketPower>,
    pub shutdown_calls: u32,
}

impl FakeSocket {
    pub fn new(cis: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeInner {
                detect: false,
                battery_ok: true,
                ready_stuck: false,
                fail_attribute_writes: false,
                cis,
                power: SocketPower::default(),
                configure_log: Vec::new(),
                shutdown_calls: 0,
            }),
        })
    }

    pub fn set_detect(&self, detect: bool) {
        self.inner.lock().unwrap().detect = detect;
    }

    pub fn set_ready_stuck(&self, stuck: bool) {
        self.inner.lock().unwrap().ready_stuck = stuck;
    }

    pub fn fail_attribute_writes(&self, fail: bool) {
        self.inner.lock().unwrap().fail_attribute_writes = fail;
    }

    pub fn shutdown_count(&self) -> u32 {
        self.inner.lock().unwrap().shutdown_calls
    }

    pub fn power(&self) -> SocketPower {
        self.inner.lock().unwrap().power
    }

    pub fn cis_byte(&self, logical: usize) -> u8 {
        self.inner
            .lock()
            .unwrap()
            .cis
            .get(logical)
            .copied()
            .unwrap_or(0xff)
    }

    pub fn set_cis(&self, cis: Vec<u8>) {
        self.inner.lock().unwrap().cis = cis;
    }
}

impl SocketDriver for FakeSocket {
    fn init(&self) -> pccard_core::Result<usize> {
        Ok(1)
    }

    fn shutdown(&self) {
        self.inner.lock().unwrap().shutdown_calls += 1;
    }

    fn read_state(&self, _sock: usize) -> StatusLines {
        let inner = self.inner.lock().unwrap();
        let mut lines = StatusLines::empty();
        if inner.detect {
            lines |= StatusLines::DETECT;
            if inner.battery_ok {
                lines |= StatusLines::BVD1 | StatusLines::BVD2;
            }
            // Ready once powered and out of reset.
            if inner.power.vcc > 0
                && !inner.power.flags.contains(pccard_core::ControlFlags::RESET)
                && !inner.ready_stuck
            {
                lines |= StatusLines::READY;
            }
        }
        lines
    }

    fn get_irq(&self, _sock: usize) -> u8 {
        11
    }

    fn configure(&self, _sock: usize, power: &SocketPower) -> pccard_core::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.power = *power;
        inner.configure_log.push(*power);
        Ok(())
    }

    fn read_card_memory(
        &self,
        _sock: usize,
        attribute: bool,
        offset: u32,
        buf: &mut [u8],
    ) -> pccard_core::Result<()> {
        let inner = self.inner.lock().unwrap();
        for (i, dst) in buf.iter_mut().enumerate() {
            let bus = offset as usize + i;
            *dst = if attribute && bus % 2 == 0 {
                inner.cis.get(bus / 2).copied().unwrap_or(0xff)
            } else {
                0xff
            };
        }
        Ok(())
    }

    fn write_card_memory(
        &self,
        _sock: usize,
        attribute: bool,
        offset: u32,
        data: &[u8],
    ) -> pccard_core::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if attribute && inner.fail_attribute_writes {
            return Err(pccard_core::CsError::Driver("attribute write refused"));
        }
        for (i, b) in data.iter().enumerate() {
            let bus = offset as usize + i;
            if attribute && bus % 2 == 0 {
                let logical = bus / 2;
                if inner.cis.len() <= logical {
                    inner.cis.resize(logical + 1, 0xff);
                }
                inner.cis[logical] = *b;
            }
        }
        Ok(())
    }
}

/// Simulated socket whose CIS is reachable only through the indirect
/// register file in common memory: control at 0x00, address registers at
/// 0x02..0x08, auto-incrementing data at 0x0a. There is no linear
/// attribute plane at all.
pub struct FakeIndirectSocket {
    inner: Mutex<IndirectInner>,
}

struct IndirectInner {
    detect: bool,
    /// Logical CIS bytes, at even addresses behind the register file.
    cis: Vec<u8>,
    regs: [u8; 12],
    cursor: u32,
    power: SocketPower,
}

impl FakeIndirectSocket {
    pub fn new(cis: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(IndirectInner {
                detect: false,
                cis,
                regs: [0; 12],
                cursor: 0,
                power: SocketPower::default(),
            }),
        })
    }

    pub fn set_detect(&self, detect: bool) {
        self.inner.lock().unwrap().detect = detect;
    }
}

impl SocketDriver for FakeIndirectSocket {
    fn init(&self) -> pccard_core::Result<usize> {
        Ok(1)
    }

    fn shutdown(&self) {}

    fn read_state(&self, _sock: usize) -> StatusLines {
        let inner = self.inner.lock().unwrap();
        let mut lines = StatusLines::empty();
        if inner.detect {
            lines |= StatusLines::DETECT | StatusLines::BVD1 | StatusLines::BVD2;
            if inner.power.vcc > 0 && !inner.power.flags.contains(pccard_core::ControlFlags::RESET)
            {
                lines |= StatusLines::READY;
            }
        }
        lines
    }

    fn get_irq(&self, _sock: usize) -> u8 {
        11
    }

    fn configure(&self, _sock: usize, power: &SocketPower) -> pccard_core::Result<()> {
        self.inner.lock().unwrap().power = *power;
        Ok(())
    }

    fn read_card_memory(
        &self,
        _sock: usize,
        attribute: bool,
        offset: u32,
        buf: &mut [u8],
    ) -> pccard_core::Result<()> {
        if attribute {
            buf.fill(0xff);
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        for dst in buf.iter_mut() {
            if offset == 0x0a {
                // Data register: serve the plane selected by CTRL bit 0 at
                // the cursor, then advance.
                let common = inner.regs[0] & 0x01 != 0;
                let at = inner.cursor as usize;
                *dst = if common || at % 2 != 0 {
                    0xff
                } else {
                    inner.cis.get(at / 2).copied().unwrap_or(0xff)
                };
                inner.cursor += 1;
            } else {
                *dst = inner.regs.get(offset as usize).copied().unwrap_or(0xff);
            }
        }
        Ok(())
    }

    fn write_card_memory(
        &self,
        _sock: usize,
        attribute: bool,
        offset: u32,
        data: &[u8],
    ) -> pccard_core::Result<()> {
        if attribute {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        for b in data {
            if offset == 0x0a {
                inner.cursor += 1;
            } else if (offset as usize) < inner.regs.len() {
                inner.regs[offset as usize] = *b;
                if (0x02..=0x08).contains(&offset) {
                    inner.cursor = u32::from_le_bytes([
                        inner.regs[2],
                        inner.regs[4],
                        inner.regs[6],
                        inner.regs[8],
                    ]);
                }
            }
        }
        Ok(())
    }
}

/// A minimal but structurally sound CIS: device info, version string,
/// configuration tuple, terminator.
pub fn sample_cis() -> Vec<u8> {
    vec![
        0x01, 0x03, 0x61, 0x78, 0xff, // DEVICE: 250 ns SRAM, 8 KiB
        0x15, 0x08, 0x04, 0x01, b'A', b'c', b'e', 0x00, b'X', 0x00, // VERS_1
        0x1a, 0x05, 0x01, 0x03, 0x00, 0x02, 0x0f, // CONFIG: regs at 0x200
        0xff, // END
    ]
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn recorder(log: &EventLog) -> EventHandler {
    let log = Arc::clone(log);
    Box::new(move |notice| {
        log.lock().unwrap().push(notice.event);
        Ok(())
    })
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Services with one fake socket attached and sensible resource ranges.
pub fn setup(cis: Vec<u8>) -> (Arc<CardServices>, Arc<FakeSocket>, SocketId) {
    init_tracing();
    let services = Arc::new(CardServices::new());
    services.add_io_range(0x300, 0x200).unwrap();
    services.add_memory_range(0xd_0000, 0x1_0000).unwrap();
    let fake = FakeSocket::new(cis);
    let driver: Arc<dyn SocketDriver> = fake.clone();
    let ids = services
        .attach(driver, SocketCapabilities::default(), SocketTiming::instant())
        .unwrap();
    // Drain the attach-time notification for the empty slot.
    services.service_pending();
    (services, fake, ids[0])
}

/// Services with one indirect-CIS socket attached.
pub fn setup_indirect(cis: Vec<u8>) -> (Arc<CardServices>, Arc<FakeIndirectSocket>, SocketId) {
    init_tracing();
    let services = Arc::new(CardServices::new());
    services.add_io_range(0x300, 0x200).unwrap();
    let fake = FakeIndirectSocket::new(cis);
    let driver: Arc<dyn SocketDriver> = fake.clone();
    let caps = SocketCapabilities {
        indirect_cis: true,
        ..SocketCapabilities::default()
    };
    let ids = services
        .attach(driver, caps, SocketTiming::instant())
        .unwrap();
    services.service_pending();
    (services, fake, ids[0])
}

/// Seats the card and pumps the deferred worker until the insertion lands.
pub fn insert_card(services: &CardServices, fake: &FakeSocket, id: SocketId) {
    fake.set_detect(true);
    services.notify(id);
    services.service_pending();
}

pub fn remove_card(services: &CardServices, fake: &FakeSocket, id: SocketId) {
    fake.set_detect(false);
    services.notify(id);
    services.service_pending();
}

pub fn insert_indirect_card(services: &CardServices, fake: &FakeIndirectSocket, id: SocketId) {
    fake.set_detect(true);
    services.notify(id);
    services.service_pending();
}
