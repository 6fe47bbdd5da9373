//! Connection timers against a manual clock.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{memory_manager, poll_n, Recorder};
use keel_core::event::Event;
use keel_core::handler::handler_fn;
use keel_core::options::ManagerOptions;

#[test]
fn test_timer_fires_once_when_due() {
    let (mut mgr, clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    let id = mgr.bind("tcp://127.0.0.1:8000", rec.clone()).unwrap();

    let deadline = mgr.now() + Duration::from_secs(5);
    assert_eq!(mgr.set_timer(id, Some(deadline)).unwrap(), None);

    poll_n(&mut mgr, 2);
    assert_eq!(rec.count("TIMER"), 0);

    clock.advance(Duration::from_secs(5));
    poll_n(&mut mgr, 1);
    assert_eq!(rec.count("TIMER"), 1);
    assert_eq!(mgr.conn(id).unwrap().timer(), None);

    clock.advance(Duration::from_secs(60));
    poll_n(&mut mgr, 2);
    assert_eq!(rec.count("TIMER"), 1);
}

#[test]
fn test_timer_rearmed_from_handler() {
    let (mut mgr, clock, _) = memory_manager(ManagerOptions::default());
    let fired: Rc<RefCell<Vec<Instant>>> = Rc::default();
    let seen = fired.clone();
    let id = mgr
        .bind(
            "tcp://127.0.0.1:8001",
            handler_fn(move |conn, ev| {
                if let Event::Timer(at) = ev {
                    seen.borrow_mut().push(*at);
                    let next = conn.now() + Duration::from_secs(1);
                    assert_eq!(conn.set_timer(Some(next)), None);
                }
            }),
        )
        .unwrap();

    let start = mgr.now();
    mgr.set_timer(id, Some(start + Duration::from_secs(1))).unwrap();
    for _ in 0..3 {
        clock.advance(Duration::from_secs(1));
        poll_n(&mut mgr, 1);
    }

    let fired = fired.borrow();
    assert_eq!(fired.len(), 3);
    assert_eq!(fired[0], start + Duration::from_secs(1));
    assert_eq!(fired[2], start + Duration::from_secs(3));
}

#[test]
fn test_set_timer_returns_previous() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let id = mgr.bind("tcp://127.0.0.1:8002", Recorder::new()).unwrap();
    let a = mgr.now() + Duration::from_secs(1);
    let b = mgr.now() + Duration::from_secs(2);

    assert_eq!(mgr.set_timer(id, Some(a)).unwrap(), None);
    assert_eq!(mgr.set_timer(id, Some(b)).unwrap(), Some(a));
    assert_eq!(mgr.set_timer(id, None).unwrap(), Some(b));
}

#[test]
fn test_poll_reports_clock_time() {
    let (mut mgr, clock, _) = memory_manager(ManagerOptions::default());
    clock.advance(Duration::from_millis(250));
    let now = mgr.poll(Duration::ZERO).unwrap();
    assert_eq!(now, mgr.now());
    assert_eq!(now, keel_core::clock::Clock::now(&clock));
}
