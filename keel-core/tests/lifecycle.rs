//! Connection lifecycle over the in-memory interface.

mod common;

use common::{memory_manager, poll_n, Echo, Recorder};
use keel_core::conn::{Conn, ConnState};
use keel_core::event::Event;
use keel_core::handler::{handler_fn, EventHandler, NoopHandler};
use keel_core::options::ManagerOptions;

#[derive(Clone)]
struct Greeter {
    rec: Recorder,
}

impl EventHandler for Greeter {
    fn handle(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        if let Event::Connect(Ok(())) = event {
            conn.send(b"hello");
        }
        self.rec.handle(conn, event);
    }
}

#[test]
fn test_echo_roundtrip() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let listener = mgr.bind("tcp://127.0.0.1:7000", Echo).unwrap();
    assert_eq!(mgr.state(listener), Some(ConnState::Established));
    assert_eq!(mgr.local_addr(listener), Some("127.0.0.1:7000".parse().unwrap()));

    let rec = Recorder::new();
    let client = mgr
        .connect("tcp://127.0.0.1:7000", Greeter { rec: rec.clone() })
        .unwrap();
    assert_eq!(mgr.state(client), Some(ConnState::Connecting));

    poll_n(&mut mgr, 4);

    assert_eq!(rec.events_for(client), vec!["CONNECT", "SEND", "RECV 5"]);
    let echoed = mgr.conn(client).unwrap().recv_buf().to_vec();
    assert_eq!(echoed, b"hello");
    assert_eq!(mgr.len(), 3);
}

#[test]
fn test_accepted_conn_knows_listener_and_peer() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    let listener = mgr.bind("tcp://127.0.0.1:7001", rec.clone()).unwrap();
    let client = mgr.connect("tcp://127.0.0.1:7001", NoopHandler).unwrap();
    poll_n(&mut mgr, 1);

    let accepted = mgr
        .connections()
        .into_iter()
        .find(|id| *id != listener && *id != client)
        .unwrap();
    assert_eq!(rec.events_for(accepted), vec!["ACCEPT"]);
    assert_eq!(mgr.conn(accepted).unwrap().listener(), Some(listener));
    assert_eq!(mgr.peer_addr(accepted), mgr.local_addr(client));
}

#[test]
fn test_connect_refused() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    let client = mgr.connect("tcp://127.0.0.1:9", rec.clone()).unwrap();
    poll_n(&mut mgr, 2);

    assert_eq!(rec.events_for(client), vec!["CONNECT_ERR", "CLOSE"]);
    assert!(!mgr.contains(client));
}

#[test]
fn test_hostname_connect_needs_resolver() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let err = mgr.connect("tcp://example.com:80", NoopHandler).unwrap_err();
    assert!(err.to_string().contains("example.com"));
    assert!(mgr.is_empty());
}

#[test]
fn test_close_twice_single_close_event() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    let id = mgr.bind("tcp://127.0.0.1:7002", rec.clone()).unwrap();

    mgr.close(id);
    mgr.close(id);
    assert_eq!(mgr.state(id), Some(ConnState::Closing));
    poll_n(&mut mgr, 3);
    mgr.close(id);

    assert_eq!(rec.count("CLOSE"), 1);
    assert!(!mgr.contains(id));
}

#[test]
fn test_stale_id_does_not_alias_reused_slot() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let old = mgr.bind("tcp://127.0.0.1:7003", NoopHandler).unwrap();
    mgr.close(old);
    poll_n(&mut mgr, 1);

    let new = mgr.bind("tcp://127.0.0.1:7003", NoopHandler).unwrap();
    assert_eq!(old.index(), new.index());
    assert_ne!(old, new);
    assert!(!mgr.contains(old));
    assert!(mgr.send(old, b"x").is_err());
}

#[test]
fn test_drop_closes_each_connection_once() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    mgr.bind("tcp://127.0.0.1:7004", rec.clone()).unwrap();
    mgr.connect("tcp://127.0.0.1:7004", rec.clone()).unwrap();
    poll_n(&mut mgr, 2);
    assert_eq!(mgr.len(), 3);

    drop(mgr);
    assert_eq!(rec.count("CLOSE"), 3);
}

#[test]
fn test_shutdown_from_handler_closes_at_end_of_iteration() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let rec = Recorder::new();
    mgr.bind("tcp://127.0.0.1:7005", rec.clone()).unwrap();
    mgr.bind(
        "tcp://127.0.0.1:7006",
        handler_fn(|conn, ev| {
            if let Event::Poll = ev {
                conn.manager().shutdown();
            }
        }),
    )
    .unwrap();

    poll_n(&mut mgr, 1);
    assert!(mgr.is_empty());
    assert_eq!(rec.count("CLOSE"), 1);
    assert!(mgr.bind("tcp://127.0.0.1:7007", NoopHandler).is_err());
}

#[test]
fn test_close_after_send_drains_first() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    mgr.bind(
        "tcp://127.0.0.1:7008",
        handler_fn(|conn, ev| {
            if let Event::Accept(_) = ev {
                conn.send(b"bye");
                conn.close_after_send();
            }
        }),
    )
    .unwrap();

    let rec = Recorder::new();
    let client = mgr.connect("tcp://127.0.0.1:7008", rec.clone()).unwrap();
    poll_n(&mut mgr, 4);

    assert_eq!(rec.events_for(client), vec!["CONNECT", "RECV 3", "CLOSE"]);
    assert_eq!(mgr.len(), 1);
}

#[test]
fn test_peer_close_propagates() {
    let (mut mgr, _clock, _) = memory_manager(ManagerOptions::default());
    let server = Recorder::new();
    let listener = mgr.bind("tcp://127.0.0.1:7009", server.clone()).unwrap();
    let client = mgr.connect("tcp://127.0.0.1:7009", NoopHandler).unwrap();
    poll_n(&mut mgr, 1);

    mgr.close(client);
    poll_n(&mut mgr, 3);

    assert_eq!(server.events(), vec!["ACCEPT", "CLOSE"]);
    assert_eq!(mgr.connections(), vec![listener]);
}

#[test]
fn test_udp_listener_creates_child_per_peer() {
    let (mut mgr, _clock, journal) = memory_manager(ManagerOptions::default());
    let server = Recorder::new();
    let srv = server.clone();
    let listener = mgr
        .bind(
            "udp://127.0.0.1:5353",
            handler_fn(move |conn, ev| {
                let mut rec = srv.clone();
                rec.handle(conn, ev);
                if let Event::Recv(_) = ev {
                    let data = conn.recv_buf_mut().take(usize::MAX);
                    conn.send(&data);
                }
            }),
        )
        .unwrap();

    let client = Recorder::new();
    let a = mgr.connect("udp://127.0.0.1:5353", client.clone()).unwrap();
    let b = mgr.connect("udp://127.0.0.1:5353", client.clone()).unwrap();
    poll_n(&mut mgr, 1);
    mgr.send(a, b"one").unwrap();
    mgr.send(b, b"two").unwrap();
    mgr.send(a, b"three").unwrap();
    poll_n(&mut mgr, 3);

    assert_eq!(server.count("ACCEPT"), 2);
    assert_eq!(client.events_for(a), vec!["CONNECT", "SEND", "RECV 8"]);
    assert_eq!(client.events_for(b), vec!["CONNECT", "SEND", "RECV 3"]);

    // one datagram per flush: "one" and "three" went out together
    let to_server = journal.sent_to("127.0.0.1:5353".parse().unwrap());
    assert_eq!(to_server.len(), 2);
    assert!(to_server.iter().all(|d| d.delivered));

    // children die with their listener
    mgr.close(listener);
    poll_n(&mut mgr, 2);
    assert_eq!(server.count("CLOSE"), 3);
}

#[test]
fn test_unroutable_datagram_is_dropped() {
    let (mut mgr, _clock, journal) = memory_manager(ManagerOptions::default());
    let id = mgr.connect("udp://127.0.0.1:9999", NoopHandler).unwrap();
    poll_n(&mut mgr, 1);
    mgr.send(id, b"lost").unwrap();
    poll_n(&mut mgr, 1);

    let sent = journal.datagrams();
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].delivered);
    assert_eq!(&sent[0].payload[..], b"lost");
    assert!(mgr.contains(id));
}
