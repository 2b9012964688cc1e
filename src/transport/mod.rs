//! Transport Layer
//!
//! The pub/sub client capability a broker connection is built on. A
//! [`Transport`] dials a broker and completes the protocol handshake; the
//! resulting [`Session`] exposes a non-blocking command handle and a stream
//! of inbound events driven by the transport's own task.

mod mqtt;
#[cfg(test)]
pub(crate) mod testing;

pub use mqtt::MqttTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::message::Message;
use crate::protocol::{ConnectReturnCode, ProtocolVersion, QoS};

/// Capacity of a session's command queue
pub const COMMAND_CAPACITY: usize = 1024;

/// Capacity of a session's inbound event queue
pub const EVENT_CAPACITY: usize = 1024;

/// Everything needed to open a session with one broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// Start without a persisted broker-side session
    pub clean_session: bool,
    /// Keep alive interval, zero disables pings
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            clean_session: false,
            keepalive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            protocol_version: ProtocolVersion::V311,
            username: None,
            password: None,
        }
    }

    /// Address in `host:port` form
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject options no connection attempt could succeed with
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "broker host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::InvalidConfig(
                "broker port cannot be 0".to_string(),
            ));
        }
        if self.keepalive.as_secs() > u16::MAX as u64 {
            return Err(TransportError::InvalidConfig(format!(
                "keepalive must not exceed {} seconds",
                u16::MAX
            )));
        }
        Ok(())
    }
}

/// Error type for transport operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the CONNECT
    Rejected(ConnectReturnCode),
    /// Operation timed out
    Timeout,
    /// Session command queue is full
    QueueFull,
    /// Invalid configuration
    InvalidConfig(String),
    /// Broker violated the protocol
    Protocol(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            TransportError::Rejected(code) => write!(f, "Connection refused: {}", code),
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::QueueFull => write!(f, "Session queue full"),
            TransportError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            TransportError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Operation queued on a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Publish(Message),
    Subscribe { filter: String, qos: QoS },
    /// Send DISCONNECT and end the session
    Disconnect,
}

/// Something the broker did on a live session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Inbound application message
    Message(Message),
    /// The session ended; `None` for a clean local close
    Closed(Option<String>),
}

/// Cloneable, non-blocking handle used to issue commands on a session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    fn enqueue(&self, command: SessionCommand) -> Result<(), TransportError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                TransportError::ConnectionLost("session closed".to_string())
            }
        })
    }

    /// Queue a message for publication
    pub fn publish(&self, message: Message) -> Result<(), TransportError> {
        self.enqueue(SessionCommand::Publish(message))
    }

    /// Queue a subscription request
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.enqueue(SessionCommand::Subscribe {
            filter: filter.to_string(),
            qos,
        })
    }

    /// Ask the session to disconnect; never fails
    pub fn close(&self) {
        let _ = self.commands.try_send(SessionCommand::Disconnect);
    }

    /// Check if the session task has gone away
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// An established session with a broker
#[derive(Debug)]
pub struct Session {
    pub handle: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
    /// Broker resumed a persisted session
    pub session_present: bool,
}

/// The transport side of a session: consumes commands, produces events
#[derive(Debug)]
pub struct SessionDriver {
    pub commands: mpsc::Receiver<SessionCommand>,
    pub events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Create a connected session / driver pair
    pub fn pair(session_present: bool) -> (Session, SessionDriver) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);
        (
            Session {
                handle: SessionHandle {
                    commands: command_tx,
                },
                events: event_rx,
                session_present,
            },
            SessionDriver {
                commands: command_rx,
                events: event_tx,
            },
        )
    }
}

/// Pub/sub client transport
///
/// Implemented by:
/// - `MqttTransport`: MQTT over TCP
/// - test doubles that script connection outcomes in memory
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial the broker and complete the CONNECT handshake
    ///
    /// A refused CONNECT is `TransportError::Rejected`; everything after a
    /// successful return is reported through the session's event stream.
    async fn connect(&self, options: &ConnectOptions) -> Result<Session, TransportError>;
}
