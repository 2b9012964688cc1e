//! Upstream to downstream forwarding path

use std::sync::Arc;

use tokio::sync::broadcast;

use super::events::{DropReason, RelayEvent};
use super::stats::RelayStats;
use crate::connection::{BrokerConnection, ConnectionError, ConnectionState, MessageHandler};
use crate::message::Message;

/// Build the upstream message handler that republishes onto `downstream`
pub(crate) fn forwarder(
    downstream: Arc<BrokerConnection>,
    events: broadcast::Sender<RelayEvent>,
    stats: Arc<RelayStats>,
) -> MessageHandler {
    Arc::new(move |message| forward(&downstream, &events, &stats, message))
}

/// Republish one message unchanged, or drop it
///
/// Never retries and never buffers: a message that cannot be handed to the
/// downstream session right now is gone.
pub(crate) fn forward(
    downstream: &BrokerConnection,
    events: &broadcast::Sender<RelayEvent>,
    stats: &RelayStats,
    message: Message,
) {
    if downstream.state() != ConnectionState::Connected {
        drop_message(events, stats, message.topic, DropReason::DownstreamUnavailable);
        return;
    }

    match downstream.publish(&message) {
        Ok(()) => {
            stats.record_forwarded();
            let _ = events.send(RelayEvent::Forwarded {
                topic: message.topic,
                qos: message.qos,
                retain: message.retain,
            });
        }
        // Lost the race with a disconnect
        Err(ConnectionError::NotConnected) => {
            drop_message(events, stats, message.topic, DropReason::DownstreamUnavailable);
        }
        Err(e) => {
            drop_message(
                events,
                stats,
                message.topic,
                DropReason::PublishFailed(e.to_string()),
            );
        }
    }
}

pub(crate) fn drop_message(
    events: &broadcast::Sender<RelayEvent>,
    stats: &RelayStats,
    topic: String,
    reason: DropReason,
) {
    match reason {
        DropReason::DownstreamUnavailable => stats.record_dropped(),
        _ => stats.record_failed(),
    }
    let _ = events.send(RelayEvent::Dropped { topic, reason });
}
