use std::sync::{Arc, Mutex};

use pccard_core::{
    BindFunction, CsError, Event, EventMask, EventNotice, IrqMode, SocketState, Veto,
};

mod util;
use util::{insert_card, recorder, remove_card, sample_cis, setup, EventLog};

#[test]
fn insertion_then_removal_round_trip() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let client = srv
        .bind_client(
            sock,
            BindFunction::Function(0),
            EventMask::CARD_INSERTION | EventMask::CARD_REMOVAL,
            recorder(&log),
        )
        .unwrap();

    // Nothing seated yet: grants refused, no events.
    assert_eq!(srv.request_io(client, 0, 8, 8), Err(CsError::NoCard));
    assert!(log.lock().unwrap().is_empty());

    insert_card(&srv, &fake, sock);
    let (_, state) = srv.get_status(sock).unwrap();
    assert!(state.contains(SocketState::PRESENT));
    assert_eq!(log.lock().unwrap().as_slice(), &[Event::CardInsertion]);
    assert!(fake.power().vcc > 0);

    let base = srv.request_io(client, 0x3f8, 8, 0).unwrap();
    assert_eq!(base, 0x3f8);

    remove_card(&srv, &fake, sock);
    let (_, state) = srv.get_status(sock).unwrap();
    assert!(!state.contains(SocketState::PRESENT));
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Event::CardInsertion, Event::CardRemoval]
    );
    // Socket power dropped with the card.
    assert_eq!(fake.power().vcc, 0);

    // The grant was force-released: the same ports are free to the next card.
    insert_card(&srv, &fake, sock);
    assert_eq!(srv.request_io(client, 0x3f8, 8, 0).unwrap(), 0x3f8);
}

#[test]
fn removal_is_delivered_before_teardown() {
    let (srv, fake, sock) = setup(sample_cis());
    let seen_present = Arc::new(Mutex::new(None::<bool>));

    let srv_in_handler = Arc::clone(&srv);
    let seen = Arc::clone(&seen_present);
    let handler = Box::new(move |notice: &EventNotice| {
        if notice.event == Event::CardRemoval {
            // Called back with no locks held, so this re-entry is fine.
            let (_, state) = srv_in_handler.get_status(notice.socket).unwrap();
            *seen.lock().unwrap() = Some(state.contains(SocketState::PRESENT));
        }
        Ok(())
    });
    let client = srv
        .bind_client(sock, BindFunction::Function(0), EventMask::CARD_REMOVAL, handler)
        .unwrap();

    insert_card(&srv, &fake, sock);
    srv.request_io(client, 0, 16, 16).unwrap();
    remove_card(&srv, &fake, sock);

    // Removal notification observed the card still nominally present.
    assert_eq!(*seen_present.lock().unwrap(), Some(true));
}

#[test]
fn bind_to_empty_socket_waits_for_card() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    srv.bind_client(
        sock,
        BindFunction::Function(0),
        EventMask::CARD_INSERTION | EventMask::REGISTRATION_COMPLETE,
        recorder(&log),
    )
    .unwrap();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Event::RegistrationComplete]
    );

    insert_card(&srv, &fake, sock);
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Event::RegistrationComplete, Event::CardInsertion]
    );
}

#[test]
fn late_binder_gets_an_immediate_insertion() {
    let (srv, fake, sock) = setup(sample_cis());
    insert_card(&srv, &fake, sock);

    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    srv.bind_client(
        sock,
        BindFunction::Function(0),
        EventMask::CARD_INSERTION,
        recorder(&log),
    )
    .unwrap();
    assert_eq!(log.lock().unwrap().as_slice(), &[Event::CardInsertion]);
}

#[test]
fn masked_events_accumulate_as_pending() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let client = srv
        .bind_client(sock, BindFunction::Function(0), EventMask::empty(), recorder(&log))
        .unwrap();

    insert_card(&srv, &fake, sock);
    assert!(log.lock().unwrap().is_empty());

    let pending = srv.set_event_mask(client, EventMask::CARD_INSERTION).unwrap();
    assert!(pending.contains(EventMask::CARD_INSERTION));
    assert!(pending.contains(EventMask::REGISTRATION_COMPLETE));
}

#[test]
fn vetoed_reset_changes_nothing() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));

    // Veto exactly the first reset request.
    let inner_log = Arc::clone(&log);
    let mut vetoed_once = false;
    let handler = Box::new(move |notice: &EventNotice| {
        inner_log.lock().unwrap().push(notice.event);
        if notice.event == Event::ResetRequest && !vetoed_once {
            vetoed_once = true;
            return Err(Veto);
        }
        Ok(())
    });
    srv.bind_client(
        sock,
        BindFunction::Function(0),
        EventMask::RESET_REQUEST | EventMask::RESET_PHYSICAL | EventMask::RESET_COMPLETE,
        handler,
    )
    .unwrap();
    insert_card(&srv, &fake, sock);

    assert_eq!(srv.reset(sock), Ok(false));
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Event::ResetRequest, Event::ResetComplete { ok: false }]
    );
    let (_, state) = srv.get_status(sock).unwrap();
    assert!(state.contains(SocketState::PRESENT));
    assert!(!state.contains(SocketState::RESET_PENDING));

    log.lock().unwrap().clear();
    assert_eq!(srv.reset(sock), Ok(true));
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            Event::ResetRequest,
            Event::ResetPhysical,
            Event::ResetComplete { ok: true }
        ]
    );
}

#[test]
fn failed_reset_downgrades_to_removal() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    srv.bind_client(
        sock,
        BindFunction::Function(0),
        EventMask::CARD_INSERTION
            | EventMask::CARD_REMOVAL
            | EventMask::RESET_REQUEST
            | EventMask::RESET_PHYSICAL
            | EventMask::RESET_COMPLETE,
        recorder(&log),
    )
    .unwrap();
    insert_card(&srv, &fake, sock);

    // The card wedges: READY never comes back after the pulse.
    fake.set_ready_stuck(true);
    assert_eq!(srv.reset(sock), Ok(false));

    // Not just a failed reset: the socket fell all the way back to empty.
    let (_, state) = srv.get_status(sock).unwrap();
    assert!(!state.contains(SocketState::PRESENT));
    assert_eq!(fake.power().vcc, 0);
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            Event::CardInsertion,
            Event::ResetRequest,
            Event::ResetPhysical,
            Event::ResetComplete { ok: false },
            Event::CardRemoval
        ]
    );
}

#[test]
fn detaching_the_last_socket_shuts_down_the_driver() {
    let (srv, fake, sock) = setup(sample_cis());
    insert_card(&srv, &fake, sock);
    assert_eq!(fake.shutdown_count(), 0);

    srv.detach(sock).unwrap();
    assert_eq!(fake.shutdown_count(), 1);
    assert!(matches!(srv.get_status(sock), Err(CsError::BadSocket(_))));
}

#[test]
fn suspend_and_resume_keep_the_card() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    srv.bind_client(
        sock,
        BindFunction::Function(0),
        EventMask::PM_SUSPEND | EventMask::PM_RESUME | EventMask::CARD_REMOVAL
            | EventMask::CARD_INSERTION,
        recorder(&log),
    )
    .unwrap();
    insert_card(&srv, &fake, sock);
    // Populate the CIS cache so resume has something to re-check.
    let check = srv.validate(sock).unwrap();
    assert!(!check.corrupt);

    srv.suspend(sock).unwrap();
    assert_eq!(fake.power().vcc, 0);

    srv.resume(sock).unwrap();
    assert!(fake.power().vcc > 0);
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Event::CardInsertion, Event::PmSuspend, Event::PmResume]
    );
}

#[test]
fn card_swap_during_suspend_reinserts() {
    let (srv, fake, sock) = setup(sample_cis());
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    srv.bind_client(
        sock,
        BindFunction::Function(0),
        EventMask::PM_RESUME | EventMask::CARD_REMOVAL | EventMask::CARD_INSERTION,
        recorder(&log),
    )
    .unwrap();
    insert_card(&srv, &fake, sock);
    srv.validate(sock).unwrap();

    srv.suspend(sock).unwrap();
    let mut swapped = sample_cis();
    swapped[2] ^= 0xff; // different device byte
    fake.set_cis(swapped);
    srv.resume(sock).unwrap();
    srv.service_pending();

    // No PmResume: the swap is reported as removal plus fresh insertion.
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[Event::CardInsertion, Event::CardRemoval, Event::CardInsertion]
    );
}

#[test]
fn deregister_refused_while_grants_live() {
    let (srv, fake, sock) = setup(sample_cis());
    let client = srv
        .bind_client(
            sock,
            BindFunction::Function(0),
            EventMask::empty(),
            Box::new(|_| Ok(())),
        )
        .unwrap();
    insert_card(&srv, &fake, sock);

    let base = srv.request_io(client, 0, 32, 32).unwrap();
    srv.request_irq(client, IrqMode::Exclusive, None).unwrap();
    assert_eq!(srv.deregister_client(client), Err(CsError::InUse));

    srv.release_io(client, base, 32).unwrap();
    srv.release_irq(client).unwrap();
    srv.deregister_client(client).unwrap();

    // Handle is dead now.
    assert_eq!(srv.release_irq(client), Err(CsError::BadClient));
}

#[test]
fn stale_client_can_always_deregister() {
    let (srv, fake, sock) = setup(sample_cis());
    let client = srv
        .bind_client(
            sock,
            BindFunction::Function(0),
            EventMask::empty(),
            Box::new(|_| Ok(())),
        )
        .unwrap();
    insert_card(&srv, &fake, sock);
    srv.request_io(client, 0, 32, 32).unwrap();

    remove_card(&srv, &fake, sock);
    srv.deregister_client(client).unwrap();
}
