//! MQTT 3.1.1: packet codec, protocol layer, client helpers and an embedded
//! broker.
//!
//! ```no_run
//! use keel_core::manager::Manager;
//! use keel_core::options::ManagerOptions;
//! use keel_proto::mqtt::Broker;
//!
//! # fn main() -> keel_core::error::Result<()> {
//! let mut mgr = Manager::new(ManagerOptions::default())?;
//! let broker = Broker::default();
//! broker.listen(&mut mgr, "tcp://0.0.0.0:1883")?;
//! loop {
//!     mgr.poll(std::time::Duration::from_secs(1))?;
//! }
//! # }
//! ```

pub mod broker;
pub mod client;
pub mod codec;
pub mod layer;
pub mod topic;

pub use broker::{Broker, BrokerHandler, BrokerHooks, BrokerOptions, Session, Subscription};
pub use codec::{
    ConnectCode, Connect, LastWill, MqttError, Packet, Publish, QoS, SubAck, Subscribe, Unsubscribe,
    MAX_REMAINING_LENGTH, SUBACK_FAILURE,
};
pub use layer::{mqtt, proto_data, MqttEvent, MqttHandler, MqttLayer, MqttProtoData};
pub use topic::{is_valid_filter, is_valid_topic, topic_matches};
