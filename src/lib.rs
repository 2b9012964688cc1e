//! relaymq - one-directional MQTT relay
//!
//! Keeps independent client connections to an upstream and a downstream
//! broker, subscribes to a topic filter upstream and republishes every
//! received message unchanged downstream. Each leg reconnects on its own
//! so a flaky network on one side never stalls the other.

pub mod bridge;
pub mod codec;
pub mod config;
pub mod connection;
pub mod message;
pub mod protocol;
pub mod topic;
pub mod transport;

pub use bridge::{Bridge, BridgeError, BridgeSettings, Leg, RelayEvent, StartupReport};
pub use config::Config;
pub use connection::{BrokerConnection, ConnectionState};
pub use message::Message;
pub use protocol::{ProtocolVersion, QoS};
pub use transport::{MqttTransport, Transport};
