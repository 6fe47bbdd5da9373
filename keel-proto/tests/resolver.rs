//! Resolver behavior against a scripted nameserver on the in-memory interface.

mod common;

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use common::{memory_manager, poll_n, stalled_manager};
use keel_core::conn::ConnId;
use keel_core::event::Event;
use keel_core::handler::{handler_fn, NoopHandler};
use keel_core::manager::Manager;
use keel_core::options::ManagerOptions;
use keel_proto::dns::codec::CLASS_IN;
use keel_proto::dns::{
    connect_host, resolve_async, DnsMessage, DnsResolver, RecordData, RecordType, ResolveError, ResolveOpts,
    ResourceRecord,
};

const NAMESERVER: &str = "10.0.0.53:53";

type Outcomes = Rc<RefCell<Vec<Result<DnsMessage, ResolveError>>>>;

#[derive(Clone, Copy)]
enum Reply {
    Answer(Ipv4Addr),
    Empty,
    WrongId,
}

fn nameserver() -> SocketAddr {
    NAMESERVER.parse().unwrap()
}

fn manager() -> (Manager, keel_core::clock::ManualClock, keel_core::memory::Journal) {
    memory_manager(ManagerOptions::default().with_nameserver(nameserver()))
}

/// Bind a UDP nameserver that answers every query according to `reply`.
fn dns_server(mgr: &mut Manager, reply: Reply) -> Rc<Cell<usize>> {
    let hits = Rc::new(Cell::new(0));
    let seen = hits.clone();
    mgr.bind(
        &format!("udp://{NAMESERVER}"),
        handler_fn(move |conn, ev| {
            let Event::Recv(_) = ev else {
                return;
            };
            let data = conn.recv_buf_mut().take(usize::MAX);
            let query = DnsMessage::parse(&data).expect("query");
            seen.set(seen.get() + 1);
            let response = match reply {
                Reply::Answer(ip) => query.reply(vec![ResourceRecord {
                    name: query.questions[0].name.clone(),
                    rtype: RecordType::A,
                    class: CLASS_IN,
                    ttl: 60,
                    data: RecordData::A(ip),
                }]),
                Reply::Empty => query.reply(Vec::new()),
                Reply::WrongId => {
                    let mut other = query.reply(Vec::new());
                    other.id = query.id.wrapping_add(1);
                    other
                }
            };
            conn.send(&response.encode().expect("encode"));
        }),
    )
    .expect("bind nameserver");
    hits
}

fn start(mgr: &mut Manager, name: &str, opts: &ResolveOpts) -> (Option<ConnId>, Outcomes) {
    let outcomes: Outcomes = Rc::default();
    let sink = outcomes.clone();
    let conn = resolve_async(mgr, name, RecordType::A, opts, move |_, result| {
        sink.borrow_mut().push(result);
    })
    .expect("resolve_async");
    (conn, outcomes)
}

#[test]
fn test_unanswered_query_is_retried_then_fails_once() {
    let (mut mgr, clock, journal) = manager();
    let opts = ResolveOpts::default()
        .with_max_retries(2)
        .with_timeout(Duration::from_secs(5));
    let (conn, outcomes) = start(&mut mgr, "example.com", &opts);
    assert!(conn.is_some());

    poll_n(&mut mgr, 2);
    assert_eq!(journal.sent_to(nameserver()).len(), 1);

    for sent in 2..=3 {
        clock.advance(Duration::from_secs(5));
        poll_n(&mut mgr, 2);
        assert_eq!(journal.sent_to(nameserver()).len(), sent);
        assert!(outcomes.borrow().is_empty());
    }

    clock.advance(Duration::from_secs(5));
    poll_n(&mut mgr, 3);
    assert_eq!(*outcomes.borrow(), vec![Err(ResolveError::ExceededRetryCount)]);
    assert_eq!(journal.sent_to(nameserver()).len(), 3);

    clock.advance(Duration::from_secs(30));
    poll_n(&mut mgr, 3);
    assert_eq!(outcomes.borrow().len(), 1);
    assert!(!mgr.contains(conn.unwrap()));
}

#[test]
fn test_retry_does_not_stack_a_queued_query() {
    let (mut mgr, clock, journal, frozen) =
        stalled_manager(ManagerOptions::default().with_nameserver(nameserver()));
    frozen.set(true);
    let (conn, outcomes) = start(&mut mgr, "example.com", &ResolveOpts::default());
    let id = conn.unwrap();

    poll_n(&mut mgr, 2);
    let queued = mgr.conn(id).unwrap().send_buf().len();
    assert!(queued > 0);

    clock.advance(Duration::from_secs(5));
    poll_n(&mut mgr, 2);
    assert_eq!(mgr.conn(id).unwrap().send_buf().len(), queued);

    frozen.set(false);
    poll_n(&mut mgr, 2);
    let sent = journal.sent_to(nameserver());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), queued);
    assert!(DnsMessage::parse(&sent[0].payload).is_ok());
    assert!(outcomes.borrow().is_empty());
}

#[test]
fn test_every_query_carries_the_same_question() {
    let (mut mgr, clock, journal) = manager();
    let opts = ResolveOpts::default().with_max_retries(1);
    start(&mut mgr, "Example.COM.", &opts);
    poll_n(&mut mgr, 2);
    clock.advance(Duration::from_secs(5));
    poll_n(&mut mgr, 2);

    let sent = journal.sent_to(nameserver());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].payload, sent[1].payload);
    let query = DnsMessage::parse(&sent[0].payload).unwrap();
    assert!(!query.is_response());
    assert_eq!(query.questions[0].name, "Example.COM");
    assert_eq!(query.questions[0].qtype, RecordType::A);
}

#[test]
fn test_literal_completes_without_io() {
    let (mut mgr, _clock, journal) = manager();
    let opts = ResolveOpts::default().with_accept_literal(true);
    let (conn, outcomes) = start(&mut mgr, "192.0.2.7", &opts);
    assert_eq!(conn, None);
    let msg = outcomes.borrow_mut().pop().unwrap().unwrap();
    assert_eq!(msg.first_addr(), Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))));

    poll_n(&mut mgr, 2);
    assert!(journal.is_empty());
    assert!(mgr.is_empty());
}

#[test]
fn test_only_literal_refuses_names() {
    let (mut mgr, _clock, journal) = manager();
    let opts = ResolveOpts::default().with_only_literal(true);
    let (conn, outcomes) = start(&mut mgr, "example.com", &opts);
    assert_eq!(conn, None);
    assert_eq!(*outcomes.borrow(), vec![Err(ResolveError::NoAnswers)]);

    let (_, literal) = start(&mut mgr, "::1", &opts);
    let msg = literal.borrow_mut().pop().unwrap().unwrap();
    assert_eq!(msg.first_addr(), Some("::1".parse().unwrap()));
    assert!(journal.is_empty());
}

#[test]
fn test_answer_from_nameserver() {
    let (mut mgr, _clock, _journal) = manager();
    let hits = dns_server(&mut mgr, Reply::Answer(Ipv4Addr::new(93, 184, 216, 34)));
    let (_, outcomes) = start(&mut mgr, "example.com", &ResolveOpts::default());

    poll_n(&mut mgr, 5);
    assert_eq!(hits.get(), 1);
    let outcomes = outcomes.borrow();
    assert_eq!(outcomes.len(), 1);
    let msg = outcomes[0].as_ref().unwrap();
    assert!(msg.is_response());
    assert_eq!(msg.first_addr(), Some(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
}

#[test]
fn test_response_without_answers() {
    let (mut mgr, _clock, _journal) = manager();
    dns_server(&mut mgr, Reply::Empty);
    let (_, outcomes) = start(&mut mgr, "nothing.example", &ResolveOpts::default());
    poll_n(&mut mgr, 5);
    assert_eq!(*outcomes.borrow(), vec![Err(ResolveError::NoAnswers)]);
}

#[test]
fn test_mismatched_transaction_id_is_ignored() {
    let (mut mgr, clock, _journal) = manager();
    let hits = dns_server(&mut mgr, Reply::WrongId);
    let opts = ResolveOpts::default().with_max_retries(1);
    let (_, outcomes) = start(&mut mgr, "example.com", &opts);

    poll_n(&mut mgr, 5);
    assert_eq!(hits.get(), 1);
    assert!(outcomes.borrow().is_empty());

    clock.advance(Duration::from_secs(5));
    poll_n(&mut mgr, 5);
    assert_eq!(hits.get(), 2);
    assert!(outcomes.borrow().is_empty());

    clock.advance(Duration::from_secs(5));
    poll_n(&mut mgr, 2);
    assert_eq!(*outcomes.borrow(), vec![Err(ResolveError::ExceededRetryCount)]);
}

#[test]
fn test_closing_the_lookup_reports_timeout() {
    let (mut mgr, _clock, _journal) = manager();
    let (conn, outcomes) = start(&mut mgr, "example.com", &ResolveOpts::default());
    poll_n(&mut mgr, 1);
    mgr.close(conn.unwrap());
    poll_n(&mut mgr, 2);
    assert_eq!(*outcomes.borrow(), vec![Err(ResolveError::Timeout)]);
}

#[test]
fn test_hosts_file_answers_before_network() {
    let path = std::env::temp_dir().join(format!("keel-hosts-{}", std::process::id()));
    std::fs::write(&path, "10.1.2.3 broker.lan\n").unwrap();

    let (mut mgr, _clock, journal) = manager();
    let opts = ResolveOpts::default().with_hosts_file(&path);
    let (conn, outcomes) = start(&mut mgr, "BROKER.lan", &opts);
    assert_eq!(conn, None);
    let msg = outcomes.borrow_mut().pop().unwrap().unwrap();
    assert_eq!(msg.first_addr(), Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));

    // not in the file: falls through to the nameserver
    let (conn, _) = start(&mut mgr, "other.lan", &opts);
    assert!(conn.is_some());
    poll_n(&mut mgr, 2);
    assert_eq!(journal.sent_to(nameserver()).len(), 1);

    std::fs::remove_file(&path).unwrap();
}

#[test]
fn test_connect_by_name_with_installed_resolver() {
    let (mut mgr, _clock, _journal) = manager();
    dns_server(&mut mgr, Reply::Answer(Ipv4Addr::new(10, 0, 0, 7)));
    mgr.bind("tcp://10.0.0.7:1883", NoopHandler).unwrap();
    DnsResolver::install(&mut mgr, ResolveOpts::default());

    let connected = Rc::new(RefCell::new(Vec::new()));
    let log = connected.clone();
    let id = mgr
        .connect(
            "tcp://broker.lan:1883",
            handler_fn(move |conn, ev| {
                if let Event::Connect(result) = ev {
                    log.borrow_mut().push((result.is_ok(), conn.peer_addr()));
                }
            }),
        )
        .unwrap();

    poll_n(&mut mgr, 8);
    assert_eq!(
        *connected.borrow(),
        vec![(true, Some("10.0.0.7:1883".parse().unwrap()))]
    );
    assert!(mgr.contains(id));
}

#[test]
fn test_connect_host_failure_raises_connect_error() {
    let (mut mgr, _clock, _journal) = manager();
    dns_server(&mut mgr, Reply::Empty);

    let results = Rc::new(RefCell::new(Vec::new()));
    let log = results.clone();
    let handler = handler_fn(move |_conn, ev| match ev {
        Event::Connect(result) => log.borrow_mut().push(if result.is_ok() { "ok" } else { "err" }),
        Event::Close => log.borrow_mut().push("close"),
        _ => {}
    });
    connect_host(&mut mgr, "tcp://missing.lan:80", handler, &ResolveOpts::default()).unwrap();

    poll_n(&mut mgr, 8);
    assert_eq!(*results.borrow(), vec!["err", "close"]);
}

#[test]
fn test_connect_host_with_literal_skips_lookup() {
    let (mut mgr, _clock, journal) = manager();
    mgr.bind("tcp://127.0.0.1:8080", NoopHandler).unwrap();
    let ok = Rc::new(Cell::new(false));
    let flag = ok.clone();
    connect_host(
        &mut mgr,
        "tcp://127.0.0.1:8080",
        handler_fn(move |_conn, ev| {
            if let Event::Connect(Ok(())) = ev {
                flag.set(true);
            }
        }),
        &ResolveOpts::default(),
    )
    .unwrap();
    poll_n(&mut mgr, 2);
    assert!(ok.get());
    assert!(journal.is_empty());
}
