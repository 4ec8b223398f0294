use bitflags::bitflags;

use crate::socket::SocketId;

/// Lifecycle events fanned out to bound clients. The set is closed; drivers
/// match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    CardInsertion,
    CardRemoval,
    BatteryDead,
    BatteryLow,
    /// Ready line changed; payload is the new level.
    ReadyChange(bool),
    StatusChange,
    RegistrationComplete,
    /// A reset has been requested; subscribers may veto.
    ResetRequest,
    /// The physical reset pulse is about to be driven.
    ResetPhysical,
    /// Reset finished; `ok` is false when it was vetoed or the card never
    /// came back ready.
    ResetComplete { ok: bool },
    PmSuspend,
    PmResume,
}

bitflags! {
    /// Subscription mask; one bit per event kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventMask: u16 {
        const CARD_INSERTION = 1 << 0;
        const CARD_REMOVAL = 1 << 1;
        const BATTERY_DEAD = 1 << 2;
        const BATTERY_LOW = 1 << 3;
        const READY_CHANGE = 1 << 4;
        const STATUS_CHANGE = 1 << 5;
        const REGISTRATION_COMPLETE = 1 << 6;
        const RESET_REQUEST = 1 << 7;
        const RESET_PHYSICAL = 1 << 8;
        const RESET_COMPLETE = 1 << 9;
        const PM_SUSPEND = 1 << 10;
        const PM_RESUME = 1 << 11;
    }
}

impl Event {
    pub fn mask_bit(&self) -> EventMask {
        match self {
            Event::CardInsertion => EventMask::CARD_INSERTION,
            Event::CardRemoval => EventMask::CARD_REMOVAL,
            Event::BatteryDead => EventMask::BATTERY_DEAD,
            Event::BatteryLow => EventMask::BATTERY_LOW,
            Event::ReadyChange(_) => EventMask::READY_CHANGE,
            Event::StatusChange => EventMask::STATUS_CHANGE,
            Event::RegistrationComplete => EventMask::REGISTRATION_COMPLETE,
            Event::ResetRequest => EventMask::RESET_REQUEST,
            Event::ResetPhysical => EventMask::RESET_PHYSICAL,
            Event::ResetComplete { .. } => EventMask::RESET_COMPLETE,
            Event::PmSuspend => EventMask::PM_SUSPEND,
            Event::PmResume => EventMask::PM_RESUME,
        }
    }

    /// Whether subscribers may cancel this event by returning a veto.
    pub fn is_vetoable(&self) -> bool {
        matches!(self, Event::ResetRequest)
    }
}

/// Delivery priority. High-priority events (removal) are delivered ahead of
/// resource teardown so clients always observe "card gone" before "resources
/// gone".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Low,
    High,
}

/// One delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventNotice {
    pub socket: SocketId,
    pub event: Event,
    pub priority: EventPriority,
}

/// A subscriber's refusal of a vetoable event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Veto;

/// Client event callback. Returning `Err(Veto)` on a vetoable event cancels
/// the pending action; the return value is ignored for all other events.
pub type EventHandler = Box<dyn FnMut(&EventNotice) -> std::result::Result<(), Veto> + Send>;
