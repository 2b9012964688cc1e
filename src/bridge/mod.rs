//! Relay Bridge
//!
//! Owns the upstream and downstream [`BrokerConnection`]s, wires the
//! upstream message handler to republish onto downstream, and supervises
//! both legs so the relay heals itself after network failures.
//!
//! # Lifecycle
//!
//! 1. [`Bridge::start`] connects both legs concurrently and waits a bounded
//!    time for them to come up. Missing the deadline is reported, not fatal.
//! 2. [`Bridge::run`] subscribes upstream on every new connection and
//!    retries downed legs on the poll interval until shutdown.
//! 3. [`Bridge::shutdown`] disconnects both legs. Calling it again is a no-op.
//!
//! # Example Configuration
//!
//! ```toml
//! [upstream]
//! address = "172.24.131.97:1883"
//!
//! [downstream]
//! address = "localhost:1883"
//!
//! [relay]
//! topic_filter = "sensors/#"
//! poll_interval = "5s"
//! ```

mod events;
mod forward;
mod stats;
mod supervisor;


pub use events::{log_events, DropReason, Leg, RelayEvent};
pub use stats::{RelayStats, StatsSnapshot};
pub use supervisor::ReconnectPolicy;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::{Config, ConfigError, RelayConfig};
use crate::connection::{BrokerConnection, ConnectionError, ConnectionEvent, ConnectionState};
use crate::protocol::QoS;
use crate::topic::subscription_filter;
use crate::transport::Transport;
use supervisor::LegSupervision;

/// Capacity of the relay event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Relay behaviour independent of the two broker endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub topic_filter: String,
    pub subscribe_qos: QoS,
    /// Subscribe as `$share/<group>/<topic_filter>` when set
    pub shared_group: Option<String>,
    pub poll_interval: Duration,
    pub startup_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            topic_filter: "sensors/#".to_string(),
            subscribe_qos: QoS::AtLeastOnce,
            shared_group: None,
            poll_interval: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(3),
            reconnect: ReconnectPolicy::Fixed,
        }
    }
}

impl BridgeSettings {
    /// The filter actually sent in SUBSCRIBE
    pub fn subscription_filter(&self) -> String {
        subscription_filter(&self.topic_filter, self.shared_group.as_deref())
    }
}

impl From<&RelayConfig> for BridgeSettings {
    fn from(relay: &RelayConfig) -> Self {
        Self {
            topic_filter: relay.topic_filter.clone(),
            subscribe_qos: relay.qos(),
            shared_group: relay.shared_group(),
            poll_interval: relay.poll_interval,
            startup_timeout: relay.startup_timeout,
            reconnect: relay.reconnect_policy(),
        }
    }
}

/// Which legs came up before the startup deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupReport {
    pub upstream_up: bool,
    pub downstream_up: bool,
}

impl StartupReport {
    pub fn is_complete(&self) -> bool {
        self.upstream_up && self.downstream_up
    }
}

/// Bridge error types
#[derive(Debug)]
pub enum BridgeError {
    /// Invalid configuration
    Config(ConfigError),
    /// A leg could not start connecting
    Connection(ConnectionError),
    /// A connection's event receiver was already taken
    EventsUnavailable(Leg),
    /// `run` called before `start`
    NotStarted,
    /// `start` called twice
    AlreadyStarted,
    /// Operation after shutdown
    Stopped,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(e) => write!(f, "{}", e),
            BridgeError::Connection(e) => write!(f, "Connection error: {}", e),
            BridgeError::EventsUnavailable(leg) => {
                write!(f, "{} connection events already taken", leg)
            }
            BridgeError::NotStarted => write!(f, "Bridge not started"),
            BridgeError::AlreadyStarted => write!(f, "Bridge already started"),
            BridgeError::Stopped => write!(f, "Bridge stopped"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<ConfigError> for BridgeError {
    fn from(e: ConfigError) -> Self {
        BridgeError::Config(e)
    }
}

impl From<ConnectionError> for BridgeError {
    fn from(e: ConnectionError) -> Self {
        BridgeError::Connection(e)
    }
}

/// One-directional relay between two brokers
pub struct Bridge {
    settings: BridgeSettings,
    upstream: Arc<BrokerConnection>,
    downstream: Arc<BrokerConnection>,
    upstream_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    downstream_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    legs: [LegSupervision; 2],
    events: broadcast::Sender<RelayEvent>,
    stats: Arc<RelayStats>,
    started: bool,
    running: AtomicBool,
    stopped: AtomicBool,
}

impl Bridge {
    pub fn new(
        settings: BridgeSettings,
        upstream: BrokerConnection,
        downstream: BrokerConnection,
    ) -> Result<Self, BridgeError> {
        let upstream_events = upstream
            .take_events()
            .ok_or(BridgeError::EventsUnavailable(Leg::Upstream))?;
        let downstream_events = downstream
            .take_events()
            .ok_or(BridgeError::EventsUnavailable(Leg::Downstream))?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let legs = [
            LegSupervision::new(settings.poll_interval),
            LegSupervision::new(settings.poll_interval),
        ];

        Ok(Self {
            settings,
            upstream: Arc::new(upstream),
            downstream: Arc::new(downstream),
            upstream_events,
            downstream_events,
            legs,
            events,
            stats: Arc::new(RelayStats::new()),
            started: false,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Build both legs from a validated configuration
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Result<Self, BridgeError> {
        let upstream = BrokerConnection::new(
            Leg::Upstream.to_string(),
            config.upstream.connect_options()?,
            Arc::clone(&transport),
        );
        let downstream = BrokerConnection::new(
            Leg::Downstream.to_string(),
            config.downstream.connect_options()?,
            transport,
        );
        Self::new(BridgeSettings::from(&config.relay), upstream, downstream)
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn upstream(&self) -> &Arc<BrokerConnection> {
        &self.upstream
    }

    pub fn downstream(&self) -> &Arc<BrokerConnection> {
        &self.downstream
    }

    pub(crate) fn connection(&self, leg: Leg) -> &Arc<BrokerConnection> {
        match leg {
            Leg::Upstream => &self.upstream,
            Leg::Downstream => &self.downstream,
        }
    }

    pub fn leg_state(&self, leg: Leg) -> ConnectionState {
        self.connection(leg).state()
    }

    /// Check if the supervisor has seen `leg` come up and not go down since
    pub fn is_up(&self, leg: Leg) -> bool {
        self.legs[leg.index()].up
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.stats)
    }

    /// Subscribe to relay events
    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Wire forwarding, connect both legs and wait for them to come up
    pub async fn start(&mut self) -> Result<StartupReport, BridgeError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BridgeError::Stopped);
        }
        if self.started {
            return Err(BridgeError::AlreadyStarted);
        }
        self.started = true;
        self.running.store(true, Ordering::SeqCst);

        self.upstream.set_message_handler(forward::forwarder(
            Arc::clone(&self.downstream),
            self.events.clone(),
            Arc::clone(&self.stats),
        ));

        for leg in Leg::ALL {
            self.connection(leg).connect()?;
        }

        let deadline = tokio::time::sleep(self.settings.startup_timeout);
        tokio::pin!(deadline);

        while !(self.is_up(Leg::Upstream) && self.is_up(Leg::Downstream)) {
            tokio::select! {
                biased;

                Some(event) = self.upstream_events.recv() => {
                    self.on_connection_event(Leg::Upstream, event);
                }

                Some(event) = self.downstream_events.recv() => {
                    self.on_connection_event(Leg::Downstream, event);
                }

                _ = &mut deadline => break,
            }
        }

        let report = StartupReport {
            upstream_up: self.is_up(Leg::Upstream),
            downstream_up: self.is_up(Leg::Downstream),
        };
        let _ = self.events.send(RelayEvent::Started {
            upstream_up: report.upstream_up,
            downstream_up: report.downstream_up,
        });
        Ok(report)
    }

    /// Stop supervising and disconnect both legs
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        for leg in Leg::ALL {
            let conn = self.connection(leg);
            let was = conn.state();
            conn.disconnect();
            if was != ConnectionState::Disconnected {
                let _ = self.events.send(RelayEvent::LegDown {
                    leg,
                    address: conn.address(),
                    error: None,
                });
            }
        }

        let stats = self.stats.snapshot();
        info!("Bridge stopped ({})", stats);
        let _ = self.events.send(RelayEvent::Stopped(stats));
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("settings", &self.settings)
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .field("running", &self.is_running())
            .finish()
    }
}
