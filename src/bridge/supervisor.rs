//! Supervisor: per-leg Up/Down tracking and the reconnect loop

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::events::{DropReason, Leg, RelayEvent};
use super::forward::drop_message;
use super::{Bridge, BridgeError};
use crate::connection::{ConnectionEvent, ConnectionEventKind, ConnectionState};

/// How often a downed leg is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Every poll tick
    #[default]
    Fixed,
    /// Doubling wait after each failed attempt, capped at `max`
    Backoff { max: Duration },
}

/// Supervisor view of one leg
#[derive(Debug, Clone)]
pub(crate) struct LegSupervision {
    pub(crate) up: bool,
    delay: Duration,
    next_attempt: Instant,
}

impl LegSupervision {
    pub(crate) fn new(poll_interval: Duration) -> Self {
        Self {
            up: false,
            delay: poll_interval,
            next_attempt: Instant::now(),
        }
    }

    fn mark_up(&mut self, poll_interval: Duration) {
        self.up = true;
        self.delay = poll_interval;
        self.next_attempt = Instant::now();
    }

    fn mark_down(&mut self) {
        self.up = false;
    }

    fn due(&self, now: Instant) -> bool {
        now >= self.next_attempt
    }

    fn schedule(&mut self, policy: ReconnectPolicy, now: Instant) {
        match policy {
            ReconnectPolicy::Fixed => self.next_attempt = now,
            ReconnectPolicy::Backoff { max } => {
                self.next_attempt = now + self.delay;
                self.delay = (self.delay * 2).min(max);
            }
        }
    }
}

impl Bridge {
    /// Apply one connectivity event from `leg`
    pub(crate) fn on_connection_event(&mut self, leg: Leg, event: ConnectionEvent) {
        let conn = self.connection(leg).clone();
        let current = event.generation == conn.generation();
        let address = conn.address();

        match event.kind {
            ConnectionEventKind::HandlerPanicked { topic } => {
                drop_message(&self.events, &self.stats, topic, DropReason::HandlerPanicked);
            }
            _ if !current => {
                debug!(
                    "Ignoring stale {} event from generation {}",
                    leg, event.generation
                );
            }
            ConnectionEventKind::Connecting => {
                let _ = self.events.send(RelayEvent::LegConnecting { leg, address });
            }
            ConnectionEventKind::Connected { session_present } => {
                self.legs[leg.index()].mark_up(self.settings.poll_interval);
                let _ = self.events.send(RelayEvent::LegUp {
                    leg,
                    address,
                    session_present,
                });
                if leg == Leg::Upstream {
                    self.subscribe_upstream();
                }
            }
            ConnectionEventKind::Disconnected { error } => {
                self.legs[leg.index()].mark_down();
                let _ = self.events.send(RelayEvent::LegDown {
                    leg,
                    address,
                    error,
                });
            }
        }
    }

    fn subscribe_upstream(&self) {
        let filter = self.settings.subscription_filter();
        let qos = self.settings.subscribe_qos;

        let event = match self.upstream.subscribe(&filter, qos) {
            Ok(true) => RelayEvent::Subscribed { filter, qos },
            Ok(false) => RelayEvent::SubscribeFailed {
                filter,
                error: "upstream not connected".to_string(),
            },
            Err(e) => RelayEvent::SubscribeFailed {
                filter,
                error: e.to_string(),
            },
        };
        let _ = self.events.send(event);
    }

    /// One supervisor tick: retry every leg that is down and due
    pub(crate) fn supervise(&mut self, now: Instant) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        for leg in Leg::ALL {
            let conn = self.connection(leg).clone();
            if conn.state() != ConnectionState::Disconnected {
                continue;
            }

            let supervision = &mut self.legs[leg.index()];
            if !supervision.due(now) {
                continue;
            }
            supervision.schedule(self.settings.reconnect, now);

            let attempt = self.stats.record_reconnect();
            let _ = self.events.send(RelayEvent::Reconnecting { leg, attempt });
            if let Err(e) = conn.connect() {
                warn!("{} reconnect failed: {}", leg, e);
            }
        }
    }

    /// Supervise both legs until `shutdown` fires, then shut down
    ///
    /// Connectivity events are applied as they arrive; reconnects happen on
    /// the poll interval. A closed shutdown channel counts as a shutdown.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), BridgeError> {
        if !self.started {
            return Err(BridgeError::NotStarted);
        }

        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                Some(event) = self.upstream_events.recv() => {
                    self.on_connection_event(Leg::Upstream, event);
                }

                Some(event) = self.downstream_events.recv() => {
                    self.on_connection_event(Leg::Downstream, event);
                }

                _ = ticker.tick() => self.supervise(Instant::now()),
            }
        }

        self.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_policy_is_always_due() {
        let poll = Duration::from_secs(5);
        let mut leg = LegSupervision::new(poll);
        let now = Instant::now();

        leg.schedule(ReconnectPolicy::Fixed, now);
        assert!(leg.due(now));
        assert!(leg.due(now + poll));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let poll = Duration::from_secs(5);
        let policy = ReconnectPolicy::Backoff {
            max: Duration::from_secs(15),
        };
        let mut leg = LegSupervision::new(poll);
        let start = Instant::now();

        leg.schedule(policy, start);
        assert!(!leg.due(start + Duration::from_secs(4)));
        assert!(leg.due(start + Duration::from_secs(5)));

        let second = start + Duration::from_secs(5);
        leg.schedule(policy, second);
        assert!(!leg.due(second + Duration::from_secs(9)));
        assert!(leg.due(second + Duration::from_secs(10)));

        let third = second + Duration::from_secs(10);
        leg.schedule(policy, third);
        assert!(leg.due(third + Duration::from_secs(15)));
        leg.schedule(policy, third + Duration::from_secs(15));
        assert!(leg.due(third + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_when_up() {
        let poll = Duration::from_secs(5);
        let policy = ReconnectPolicy::Backoff {
            max: Duration::from_secs(60),
        };
        let mut leg = LegSupervision::new(poll);
        let now = Instant::now();
        leg.schedule(policy, now);
        leg.schedule(policy, now);
        leg.schedule(policy, now);

        leg.mark_up(poll);
        leg.mark_down();
        assert!(leg.due(Instant::now()));
        leg.schedule(policy, Instant::now());
        assert!(leg.due(Instant::now() + poll));
    }
}
