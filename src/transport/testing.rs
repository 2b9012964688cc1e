//! In-memory transport whose connect outcomes are scripted by the test

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ConnectOptions, Session, SessionDriver, Transport, TransportError};
use crate::protocol::ConnectReturnCode;

/// How the next `connect` call resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Accept { session_present: bool },
    Refuse(ConnectReturnCode),
    Unreachable,
    /// Never completes
    Hang,
}

pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    attempts: AtomicUsize,
    sessions: mpsc::UnboundedSender<SessionDriver>,
}

impl ScriptedTransport {
    /// Accepts every connect unless scripted otherwise; accepted sessions
    /// are handed to the test through the returned receiver
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SessionDriver>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Outcome::Accept {
                session_present: false,
            }),
            attempts: AtomicUsize::new(0),
            sessions: tx,
        });
        (transport, rx)
    }

    pub(crate) fn push(&self, outcome: Outcome) {
        self.script.lock().push_back(outcome);
    }

    /// Outcome used once the script runs out
    pub(crate) fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock() = outcome;
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _options: &ConnectOptions) -> Result<Session, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| *self.fallback.lock());

        match outcome {
            Outcome::Accept { session_present } => {
                let (session, driver) = Session::pair(session_present);
                let _ = self.sessions.send(driver);
                Ok(session)
            }
            Outcome::Refuse(code) => Err(TransportError::Rejected(code)),
            Outcome::Unreachable => Err(TransportError::ConnectionLost(
                "connection refused".to_string(),
            )),
            Outcome::Hang => std::future::pending().await,
        }
    }
}
