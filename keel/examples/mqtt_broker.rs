//! Standalone MQTT broker.
//!
//! ```text
//! cargo run --example mqtt_broker --features mqtt -- 0.0.0.0:1883
//! mosquitto_sub -t 'sensors/#' &
//! mosquitto_pub -t sensors/hall/temp -m 21
//! ```
//!
//! Every ten seconds the broker itself publishes the session count on
//! `$SYS/broker/clients`.

use std::time::{Duration, Instant};

use keel::conn::Conn;
use keel::mqtt::{Broker, BrokerHooks, BrokerOptions, Connect, ConnectCode, Publish, QoS, Session};
use keel::prelude::*;
use tracing::info;

#[derive(Clone)]
struct Logger;

impl BrokerHooks for Logger {
    fn on_connect(&mut self, conn: &mut Conn<'_>, connect: &Connect) -> ConnectCode {
        info!(conn = %conn.id(), client_id = %connect.client_id, keep_alive = connect.keep_alive, "client connected");
        ConnectCode::Accepted
    }

    fn on_publish(&mut self, conn: &mut Conn<'_>, publish: &Publish) {
        info!(conn = %conn.id(), topic = %publish.topic, bytes = publish.payload.len(), qos = ?publish.qos, "publish");
    }

    fn on_disconnect(&mut self, session: &mut Session) {
        info!(client_id = session.client_id(), subscriptions = session.subscriptions().len(), "client gone");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let addr = std::env::args().nth(1).unwrap_or_else(|| "0.0.0.0:1883".to_string());
    let mut mgr = Manager::new(ManagerOptions::default())?;
    let broker = Broker::new(BrokerOptions::default());
    broker.listen_with(&mut mgr, &format!("tcp://{addr}"), Logger)?;
    info!(%addr, "mqtt broker listening");

    let mut next_report = Instant::now() + Duration::from_secs(10);
    loop {
        let now = mgr.poll(Duration::from_secs(1))?;
        if now >= next_report {
            let clients = broker.session_count().to_string();
            broker.publish(&mut mgr, "$SYS/broker/clients", clients.into_bytes(), QoS::AtMostOnce);
            next_report = now + Duration::from_secs(10);
        }
    }
}
