//! Relay events
//!
//! Every state transition and forwarding decision is published as a
//! structured [`RelayEvent`]. Rendering them is left to subscribers;
//! [`log_events`] is the stock renderer used by the binary.

use std::fmt;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::stats::StatsSnapshot;
use crate::protocol::QoS;

/// One of the two broker connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    Upstream,
    Downstream,
}

impl Leg {
    pub const ALL: [Leg; 2] = [Leg::Upstream, Leg::Downstream];

    pub(crate) fn index(self) -> usize {
        match self {
            Leg::Upstream => 0,
            Leg::Downstream => 1,
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Upstream => write!(f, "upstream"),
            Leg::Downstream => write!(f, "downstream"),
        }
    }
}

/// Why a message was not forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    DownstreamUnavailable,
    PublishFailed(String),
    HandlerPanicked,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::DownstreamUnavailable => write!(f, "downstream broker not connected"),
            DropReason::PublishFailed(e) => write!(f, "publish failed: {}", e),
            DropReason::HandlerPanicked => write!(f, "forwarding handler panicked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    LegConnecting {
        leg: Leg,
        address: String,
    },
    LegUp {
        leg: Leg,
        address: String,
        session_present: bool,
    },
    LegDown {
        leg: Leg,
        address: String,
        error: Option<String>,
    },
    Subscribed {
        filter: String,
        qos: QoS,
    },
    SubscribeFailed {
        filter: String,
        error: String,
    },
    Reconnecting {
        leg: Leg,
        attempt: u64,
    },
    /// Startup wait finished, with the legs that made it up in time
    Started {
        upstream_up: bool,
        downstream_up: bool,
    },
    Forwarded {
        topic: String,
        qos: QoS,
        retain: bool,
    },
    Dropped {
        topic: String,
        reason: DropReason,
    },
    Stopped(StatsSnapshot),
}

/// Render relay events through `tracing` until the bridge goes away
pub async fn log_events(mut events: broadcast::Receiver<RelayEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Event log lagging, {} events skipped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::LegConnecting { leg, address } => {
            info!("Connecting to {} broker {}...", leg, address);
        }
        RelayEvent::LegUp {
            leg,
            address,
            session_present,
        } => {
            info!(
                "Connected to {} broker {} (session_present={})",
                leg, address, session_present
            );
        }
        RelayEvent::LegDown {
            leg,
            address,
            error: Some(error),
        } => {
            warn!("{} broker {} disconnected: {}", leg, address, error);
        }
        RelayEvent::LegDown {
            leg,
            address,
            error: None,
        } => {
            info!("Disconnected from {} broker {}", leg, address);
        }
        RelayEvent::Subscribed { filter, qos } => {
            info!("Subscribed to {} (QoS {})", filter, qos);
        }
        RelayEvent::SubscribeFailed { filter, error } => {
            warn!("Subscribe to {} failed: {}", filter, error);
        }
        RelayEvent::Reconnecting { leg, attempt } => {
            info!("Reconnecting to {} broker (attempt {})", leg, attempt);
        }
        RelayEvent::Started {
            upstream_up: true,
            downstream_up: true,
        } => {
            info!("Relay is running, forwarding messages");
        }
        RelayEvent::Started {
            upstream_up,
            downstream_up,
        } => {
            warn!(
                "Startup incomplete (upstream up: {}, downstream up: {}), retrying in the background",
                upstream_up, downstream_up
            );
        }
        RelayEvent::Forwarded { topic, qos, retain } => {
            debug!("Forwarded: {} (QoS {}, retain={})", topic, qos, retain);
        }
        RelayEvent::Dropped { topic, reason } => {
            warn!("Dropping message on {}: {}", topic, reason);
        }
        RelayEvent::Stopped(stats) => {
            info!("Relay stopped ({})", stats);
        }
    }
}
