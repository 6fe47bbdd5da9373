//! Embedded MQTT broker.
//!
//! One [`Session`] per connected client, created by an accepted CONNECT and
//! removed when the connection closes. Publishing walks every session's
//! subscription list, so fan-out costs sessions × subscriptions. A session
//! receives a message at most once, at the lower of the publish QoS and the
//! QoS granted to its first matching filter.
//!
//! QoS 1 and 2 are acknowledged hop by hop; nothing is persisted or
//! retransmitted.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bytes::Bytes;
use hashbrown::HashMap;
use keel_core::conn::{Conn, ConnId};
use keel_core::error::Result;
use keel_core::event::Event;
use keel_core::manager::Manager;
use tracing::{debug, trace, warn};

use super::codec::{ConnectCode, Connect, Packet, Publish, QoS, SubAck, SUBACK_FAILURE};
use super::layer::{MqttEvent, MqttHandler, MqttLayer};
use super::topic::{is_valid_filter, is_valid_topic, topic_matches};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Filters one session may hold
    ///
    /// - Default: 512
    pub max_subscriptions: usize,

    /// Keep `$`-topics away from filters that start with a wildcard
    ///
    /// - Default: false
    pub hide_system_topics: bool,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            max_subscriptions: 512,
            hide_system_topics: false,
        }
    }
}

impl BrokerOptions {
    #[must_use]
    pub fn with_max_subscriptions(mut self, max: usize) -> Self {
        self.max_subscriptions = max;
        self
    }

    #[must_use]
    pub fn with_hide_system_topics(mut self, hide: bool) -> Self {
        self.hide_system_topics = hide;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// Broker-side state of one client.
pub struct Session {
    conn: ConnId,
    client_id: String,
    subscriptions: Vec<Subscription>,
    next_packet_id: u16,
    user_data: Option<Box<dyn Any>>,
}

impl Session {
    fn new(conn: ConnId, client_id: String) -> Self {
        Self {
            conn,
            client_id,
            subscriptions: Vec::new(),
            next_packet_id: 1,
            user_data: None,
        }
    }

    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn user_data<T: Any>(&mut self) -> Option<&mut T> {
        self.user_data.as_mut()?.downcast_mut()
    }

    pub fn set_user_data<T: Any>(&mut self, data: T) {
        self.user_data = Some(Box::new(data));
    }

    /// QoS this session gets `topic` at, if any of its filters match.
    fn delivery_qos(&self, topic: &str, qos: QoS, hide_system: bool) -> Option<QoS> {
        let system = hide_system && topic.starts_with('$');
        self.subscriptions
            .iter()
            .filter(|s| !(system && s.filter.starts_with(['+', '#'])))
            .find(|s| topic_matches(&s.filter, topic))
            .map(|s| s.qos.min(qos))
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("conn", &self.conn)
            .field("client_id", &self.client_id)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    opts: BrokerOptions,
    sessions: HashMap<ConnId, Session>,
}

/// Application hooks for a broker connection.
pub trait BrokerHooks: 'static {
    /// Decide on a CONNECT with a supported protocol version.
    fn on_connect(&mut self, _conn: &mut Conn<'_>, _connect: &Connect) -> ConnectCode {
        ConnectCode::Accepted
    }

    /// A client published, before the message is fanned out.
    fn on_publish(&mut self, _conn: &mut Conn<'_>, _publish: &Publish) {}

    /// The session of `conn` is about to be removed.
    fn on_disconnect(&mut self, _session: &mut Session) {}
}

impl BrokerHooks for () {}

/// Shared handle to the broker state.
///
/// Clones refer to the same sessions. The broker lives on the manager's
/// thread.
#[derive(Debug, Clone, Default)]
pub struct Broker {
    state: Rc<RefCell<BrokerState>>,
}

impl Broker {
    #[must_use]
    pub fn new(opts: BrokerOptions) -> Self {
        Self {
            state: Rc::new(RefCell::new(BrokerState {
                opts,
                sessions: HashMap::new(),
            })),
        }
    }

    /// Accept MQTT clients on `addr`.
    pub fn listen(&self, mgr: &mut Manager, addr: &str) -> Result<ConnId> {
        self.listen_with(mgr, addr, ())
    }

    pub fn listen_with<H>(&self, mgr: &mut Manager, addr: &str, hooks: H) -> Result<ConnId>
    where
        H: BrokerHooks + Clone,
    {
        let id = mgr.bind(addr, self.handler(hooks))?;
        debug!(conn = %id, addr, "mqtt broker listening");
        Ok(id)
    }

    /// Connection handler serving this broker, for use with `bind_opt`.
    #[must_use]
    pub fn handler<H: BrokerHooks>(&self, hooks: H) -> MqttLayer<BrokerHandler<H>> {
        MqttLayer::new(BrokerHandler {
            broker: self.clone(),
            hooks,
        })
    }

    /// Forward a PUBLISH to every session with a matching filter.
    ///
    /// Returns the number of sessions the message was queued for.
    pub fn publish(&self, mgr: &mut Manager, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> usize {
        let payload = payload.into();
        let mut out = Vec::new();
        {
            let mut state = self.state.borrow_mut();
            let hide_system = state.opts.hide_system_topics;
            for session in state.sessions.values_mut() {
                let Some(granted) = session.delivery_qos(topic, qos, hide_system) else {
                    continue;
                };
                let packet_id = if granted == QoS::AtMostOnce {
                    0
                } else {
                    session.take_packet_id()
                };
                let publish = Publish::new(topic, payload.clone()).with_qos(granted, packet_id);
                match Packet::Publish(publish).to_vec() {
                    Ok(frame) => out.push((session.conn, frame)),
                    Err(e) => {
                        warn!(topic, error = %e, "cannot encode publish");
                        return 0;
                    }
                }
            }
        }

        let mut delivered = 0;
        for (conn, frame) in out {
            match mgr.send(conn, &frame) {
                Ok(n) if n == frame.len() => delivered += 1,
                Ok(_) => debug!(%conn, topic, "send buffer full, publish dropped"),
                Err(e) => trace!(%conn, error = %e, "session connection gone"),
            }
        }
        trace!(topic, ?qos, delivered, "published");
        delivered
    }

    /// Add filters to the session of `conn`.
    ///
    /// Returns one SUBACK code per filter: the granted QoS, or
    /// [`SUBACK_FAILURE`] for invalid filters and filters past the
    /// subscription limit. Re-subscribing to a held filter only updates its
    /// QoS. Without a session every filter fails.
    pub fn subscribe(&self, conn: ConnId, filters: &[(String, QoS)]) -> Vec<u8> {
        let mut state = self.state.borrow_mut();
        let max = state.opts.max_subscriptions;
        let Some(session) = state.sessions.get_mut(&conn) else {
            return vec![SUBACK_FAILURE; filters.len()];
        };
        filters
            .iter()
            .map(|(filter, qos)| {
                if !is_valid_filter(filter) {
                    debug!(%conn, filter, "invalid topic filter");
                    return SUBACK_FAILURE;
                }
                if let Some(existing) = session.subscriptions.iter_mut().find(|s| &s.filter == filter) {
                    existing.qos = *qos;
                } else if session.subscriptions.len() >= max {
                    debug!(%conn, filter, max, "subscription limit reached");
                    return SUBACK_FAILURE;
                } else {
                    session.subscriptions.push(Subscription {
                        filter: filter.clone(),
                        qos: *qos,
                    });
                }
                *qos as u8
            })
            .collect()
    }

    /// Remove filters from the session of `conn`.
    pub fn unsubscribe(&self, conn: ConnId, filters: &[String]) {
        if let Some(session) = self.state.borrow_mut().sessions.get_mut(&conn) {
            session.subscriptions.retain(|s| !filters.contains(&s.filter));
        }
    }

    /// Connections that currently hold a session.
    #[must_use]
    pub fn sessions(&self) -> Vec<ConnId> {
        self.state.borrow().sessions.keys().copied().collect()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    #[must_use]
    pub fn has_session(&self, conn: ConnId) -> bool {
        self.state.borrow().sessions.contains_key(&conn)
    }

    /// Run `f` on the session of `conn`.
    ///
    /// `f` must not call back into this broker.
    pub fn with_session<R>(&self, conn: ConnId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.state.borrow_mut().sessions.get_mut(&conn).map(f)
    }

    fn register(&self, conn: ConnId, client_id: &str) {
        self.state
            .borrow_mut()
            .sessions
            .insert(conn, Session::new(conn, client_id.to_string()));
    }

    fn remove(&self, conn: ConnId) -> Option<Session> {
        self.state.borrow_mut().sessions.remove(&conn)
    }
}

/// [`MqttHandler`] that runs the broker protocol on one connection.
#[derive(Debug, Clone)]
pub struct BrokerHandler<H> {
    broker: Broker,
    hooks: H,
}

impl<H: BrokerHooks> BrokerHandler<H> {
    fn reply(conn: &mut Conn<'_>, packet: &Packet) {
        if let Ok(frame) = packet.to_vec() {
            conn.send(&frame);
        }
    }

    fn on_connect(&mut self, conn: &mut Conn<'_>, connect: &Connect) {
        if self.broker.has_session(conn.id()) {
            warn!(conn = %conn.id(), "second CONNECT, closing");
            conn.close();
            return;
        }
        let code = if connect.is_supported_protocol() {
            self.hooks.on_connect(conn, connect)
        } else {
            ConnectCode::UnacceptableProtocol
        };
        Self::reply(
            conn,
            &Packet::ConnAck {
                session_present: false,
                code,
            },
        );
        if code == ConnectCode::Accepted {
            self.broker.register(conn.id(), &connect.client_id);
            debug!(conn = %conn.id(), client_id = %connect.client_id, "mqtt session started");
        } else {
            debug!(conn = %conn.id(), ?code, "mqtt connect refused");
            conn.close_after_send();
        }
    }

    fn on_publish(&mut self, conn: &mut Conn<'_>, publish: &Publish) {
        if !is_valid_topic(&publish.topic) {
            warn!(conn = %conn.id(), topic = %publish.topic, "invalid publish topic, closing");
            conn.close();
            return;
        }
        self.hooks.on_publish(conn, publish);
        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(id)) => Self::reply(conn, &Packet::PubAck(id)),
            (QoS::ExactlyOnce, Some(id)) => Self::reply(conn, &Packet::PubRec(id)),
            _ => {}
        }
        self.broker
            .publish(conn.manager(), &publish.topic, publish.payload.clone(), publish.qos);
    }

    fn on_packet(&mut self, conn: &mut Conn<'_>, packet: &Packet) {
        if let Packet::Connect(connect) = packet {
            self.on_connect(conn, connect);
            return;
        }
        if !self.broker.has_session(conn.id()) {
            warn!(conn = %conn.id(), packet = packet.name(), "packet before CONNECT, closing");
            conn.close();
            return;
        }
        match packet {
            Packet::Publish(publish) => self.on_publish(conn, publish),
            Packet::PubRel(id) => Self::reply(conn, &Packet::PubComp(*id)),
            Packet::PubRec(id) => Self::reply(conn, &Packet::PubRel(*id)),
            Packet::PubAck(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(sub) => {
                let return_codes = self.broker.subscribe(conn.id(), &sub.filters);
                Self::reply(
                    conn,
                    &Packet::SubAck(SubAck {
                        packet_id: sub.packet_id,
                        return_codes,
                    }),
                );
            }
            Packet::Unsubscribe(unsub) => {
                self.broker.unsubscribe(conn.id(), &unsub.filters);
                Self::reply(conn, &Packet::UnsubAck(unsub.packet_id));
            }
            Packet::PingReq => Self::reply(conn, &Packet::PingResp),
            Packet::Disconnect => {
                debug!(conn = %conn.id(), "client disconnected");
                conn.close();
            }
            other => {
                warn!(conn = %conn.id(), packet = other.name(), "unexpected packet from client, closing");
                conn.close();
            }
        }
    }
}

impl<H: BrokerHooks> MqttHandler for BrokerHandler<H> {
    fn on_event(&mut self, conn: &mut Conn<'_>, event: &Event<'_>) {
        if let Event::Close = event {
            if let Some(mut session) = self.broker.remove(conn.id()) {
                debug!(conn = %conn.id(), client_id = %session.client_id, "mqtt session ended");
                self.hooks.on_disconnect(&mut session);
            }
        }
    }

    fn on_mqtt(&mut self, conn: &mut Conn<'_>, event: &MqttEvent<'_>) {
        match event {
            MqttEvent::Packet(packet) => self.on_packet(conn, packet),
            MqttEvent::Malformed(e) => debug!(conn = %conn.id(), error = %e, "malformed packet from client"),
        }
    }
}
