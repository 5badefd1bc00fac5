//! Integration coverage for the concrete scenarios in the testable
//! properties: coalescing, block-then-unblock ordering, and contention from
//! genuine concurrent producer threads (see §5's "test tooling
//! implication").

use std::sync::Arc;
use std::time::Duration;

use guestcore::config::Limits;
use guestcore::signal::hook::test_double::RecordingControl;
use guestcore::signal::{Disposition, Handler, MaskHow, SigInfo, SigSet, SignalController};

fn wait_for(mut predicate: impl FnMut() -> bool) {
    for _ in 0..400 {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition never became true within the test timeout");
}

/// Scenario 2: signal 10 sent three times in rapid succession while
/// deliverable must invoke the handler exactly once.
#[test]
fn burst_of_identical_signals_delivers_once() {
    let guest = Arc::new(RecordingControl::new());
    let controller = SignalController::new(guest.clone(), Limits::default());
    controller
        .set_disposition(
            10,
            Some(Disposition {
                handler: Handler::User(0x4000),
                ..Default::default()
            }),
        )
        .unwrap();

    for _ in 0..3 {
        controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();
    }

    wait_for(|| *guest.suspend_count.lock().unwrap() >= 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*guest.suspend_count.lock().unwrap(), 1);
    assert_eq!(*guest.resume_count.lock().unwrap(), 1);
    controller.shutdown();
}

/// Scenario 3: blocking signal 10, sending it, then unblocking must
/// deliver exactly once, driven by the mask-change rearm check rather than
/// a second explicit kill.
#[test]
fn unblocking_a_pending_signal_rearms_delivery() {
    let guest = Arc::new(RecordingControl::new());
    let controller = SignalController::new(guest.clone(), Limits::default());
    controller
        .set_disposition(
            10,
            Some(Disposition {
                handler: Handler::User(0x4000),
                ..Default::default()
            }),
        )
        .unwrap();

    let mut blocked = SigSet::EMPTY;
    blocked.insert(10);
    controller.set_mask(MaskHow::Block, Some(blocked)).unwrap();
    controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(*guest.suspend_count.lock().unwrap(), 0, "must stay pending while masked");

    controller.set_mask(MaskHow::Unblock, Some(blocked)).unwrap();
    wait_for(|| *guest.suspend_count.lock().unwrap() == 1);
    controller.shutdown();
}

/// §5's concurrency expansion: many real producer threads racing to send
/// the same masked signal number must still coalesce to one delivery once
/// unblocked, not one per producer.
#[test]
fn concurrent_producers_coalesce_under_real_contention() {
    let guest = Arc::new(RecordingControl::new());
    let controller = SignalController::new(guest.clone(), Limits::default());
    controller
        .set_disposition(
            10,
            Some(Disposition {
                handler: Handler::User(0x4000),
                ..Default::default()
            }),
        )
        .unwrap();

    let mut blocked = SigSet::EMPTY;
    blocked.insert(10);
    controller.set_mask(MaskHow::Block, Some(blocked)).unwrap();

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let _ = controller.kill(std::process::id(), SigInfo::simple(10));
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    controller.set_mask(MaskHow::Unblock, Some(blocked)).unwrap();
    wait_for(|| *guest.suspend_count.lock().unwrap() == 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*guest.suspend_count.lock().unwrap(), 1);
    controller.shutdown();
}

/// Mask-safety property: while a handler for S runs, S and the
/// disposition's additional mask are blocked — checked by inspecting the
/// controller's mask immediately after the suspend/resume sequence fires.
#[test]
fn handler_entry_blocks_its_own_signal_and_its_extra_mask() {
    let guest = Arc::new(RecordingControl::new());
    let controller = SignalController::new(guest.clone(), Limits::default());
    let mut extra = SigSet::EMPTY;
    extra.insert(12);
    controller
        .set_disposition(
            10,
            Some(Disposition {
                handler: Handler::User(0x4000),
                mask: extra,
                ..Default::default()
            }),
        )
        .unwrap();

    controller.kill(std::process::id(), SigInfo::simple(10)).unwrap();
    wait_for(|| *guest.suspend_count.lock().unwrap() == 1);

    let mask = controller.set_mask(MaskHow::Block, Some(SigSet::EMPTY)).unwrap();
    assert!(mask.contains(10));
    assert!(mask.contains(12));
    controller.shutdown();
}
