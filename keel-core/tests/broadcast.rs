//! Broadcasts posted from other threads.

mod common;

use common::{memory_manager, poll_n, Recorder};
use keel_core::error::KeelError;
use keel_core::options::ManagerOptions;

#[test]
fn test_broadcast_reaches_every_connection() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    mgr.bind("tcp://127.0.0.1:8100", rec.clone()).unwrap();
    mgr.bind("udp://127.0.0.1:8100", rec.clone()).unwrap();
    mgr.connect("tcp://127.0.0.1:8100", rec.clone()).unwrap();
    poll_n(&mut mgr, 2);

    let tx = mgr.broadcaster();
    std::thread::spawn(move || tx.send(b"news").unwrap())
        .join()
        .unwrap();
    poll_n(&mut mgr, 1);

    assert_eq!(mgr.len(), 4);
    assert_eq!(rec.count("BROADCAST news"), 4);
}

#[test]
fn test_broadcast_size_limit() {
    let (mgr, _clock, _) =
        memory_manager(ManagerOptions::default().with_max_broadcast_size(4));
    let tx = mgr.broadcaster();
    assert_eq!(tx.max_size(), 4);
    assert!(matches!(
        tx.send(b"too long"),
        Err(KeelError::MessageTooLarge { size: 8, max: 4 })
    ));
}

#[test]
fn test_broadcast_after_manager_dropped() {
    let (mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let tx = mgr.broadcaster();
    drop(mgr);
    assert!(matches!(tx.send(b"late"), Err(KeelError::ChannelClosed)));
}
