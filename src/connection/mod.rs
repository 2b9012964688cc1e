//! Broker Connection
//!
//! One client connection to one broker. The connection owns its state
//! machine (`Disconnected -> Connecting -> Connected -> Disconnected`),
//! runs connect attempts and message delivery on its own task, and reports
//! every transition on a connectivity event channel.
//!
//! Each attempt is tagged with a generation number. `connect` and
//! `disconnect` bump the generation under the control lock, and a task only
//! applies a transition if its generation is still current, so a stale
//! attempt can never overwrite the state of a newer one.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::message::Message;
use crate::protocol::QoS;
use crate::transport::{
    ConnectOptions, Session, SessionEvent, SessionHandle, Transport, TransportError,
};


/// Handler invoked once per inbound message
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Connectivity state of a broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// What a `connect` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    /// A new attempt was started
    Started,
    /// An attempt is already in flight, nothing was started
    InProgress,
    /// Already connected, nothing was started
    AlreadyConnected,
}

/// Error type for connection operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Malformed connection settings
    InvalidConfig(String),
    /// Operation requires a connected session
    NotConnected,
    /// The session refused the operation
    Transport(TransportError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            ConnectionError::NotConnected => write!(f, "Not connected"),
            ConnectionError::Transport(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InvalidConfig(msg) => ConnectionError::InvalidConfig(msg),
            other => ConnectionError::Transport(other),
        }
    }
}

/// Connectivity signal emitted by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Generation of the attempt the event belongs to
    pub generation: u64,
    pub kind: ConnectionEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Connecting,
    Connected { session_present: bool },
    /// `error` is `None` for a local disconnect
    Disconnected { error: Option<String> },
    /// The message handler panicked while processing a message
    HandlerPanicked { topic: String },
}

/// Mutable bookkeeping guarded by one lock
struct Control {
    generation: u64,
    session: Option<SessionHandle>,
    task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

struct Inner {
    name: String,
    options: ConnectOptions,
    transport: Arc<dyn Transport>,
    /// Read lock-free; written only while holding `control`
    state: AtomicU8,
    control: Mutex<Control>,
    handler: RwLock<Option<MessageHandler>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Client connection to a single broker
pub struct BrokerConnection {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl BrokerConnection {
    pub fn new(
        name: impl Into<String>,
        options: ConnectOptions,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                transport,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                control: Mutex::new(Control {
                    generation: 0,
                    session: None,
                    task: None,
                    last_error: None,
                }),
                handler: RwLock::new(None),
                events,
            }),
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// Broker address in `host:port` form
    pub fn address(&self) -> String {
        self.inner.options.address()
    }

    /// Current connectivity state
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Generation of the most recent connect or disconnect
    pub fn generation(&self) -> u64 {
        self.inner.control.lock().generation
    }

    /// Most recent connect or session error
    pub fn last_error(&self) -> Option<String> {
        self.inner.control.lock().last_error.clone()
    }

    /// Take the connectivity event receiver (only the first call gets it)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.lock().take()
    }

    /// Register the message handler, replacing any previous one
    pub fn set_message_handler(&self, handler: MessageHandler) {
        *self.inner.handler.write() = Some(handler);
    }

    /// Start a connection attempt in the background
    ///
    /// Only malformed settings fail here. Transport failures are reported
    /// later as a `Disconnected` event carrying the error. Must be called
    /// from within a tokio runtime.
    pub fn connect(&self) -> Result<ConnectAttempt, ConnectionError> {
        self.inner.options.validate()?;

        let mut control = self.inner.control.lock();
        match self.inner.state() {
            ConnectionState::Connecting => return Ok(ConnectAttempt::InProgress),
            ConnectionState::Connected => return Ok(ConnectAttempt::AlreadyConnected),
            ConnectionState::Disconnected => {}
        }

        control.generation += 1;
        let generation = control.generation;
        self.inner.set_state(ConnectionState::Connecting);
        self.inner.emit(generation, ConnectionEventKind::Connecting);
        debug!(
            "{}: connecting to {} (generation {})",
            self.inner.name,
            self.inner.options.address(),
            generation
        );

        let inner = Arc::clone(&self.inner);
        control.task = Some(tokio::spawn(inner.run(generation)));
        Ok(ConnectAttempt::Started)
    }

    /// Subscribe on the live session
    ///
    /// Returns `Ok(false)` without doing anything when not connected; the
    /// caller re-issues the subscription after the next `Connected` event.
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<bool, ConnectionError> {
        if !self.is_connected() {
            return Ok(false);
        }
        match self.session() {
            Some(session) => {
                session.subscribe(filter, qos)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Publish a message, failing fast when not connected
    pub fn publish(&self, message: &Message) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        let session = self.session().ok_or(ConnectionError::NotConnected)?;
        session.publish(message.clone())?;
        Ok(())
    }

    /// Tear the connection down
    ///
    /// Abandons any attempt in flight, stops message delivery and leaves the
    /// connection `Disconnected`. Calling it on a disconnected connection
    /// changes nothing and emits nothing.
    pub fn disconnect(&self) {
        let mut control = self.inner.control.lock();
        control.generation += 1;
        let generation = control.generation;

        if let Some(task) = control.task.take() {
            task.abort();
        }
        if let Some(session) = control.session.take() {
            session.close();
        }

        let previous = self.inner.swap_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!("{}: disconnected from {}", self.inner.name, self.inner.options.address());
            self.inner
                .emit(generation, ConnectionEventKind::Disconnected { error: None });
        }
    }

    fn session(&self) -> Option<SessionHandle> {
        self.inner.control.lock().session.clone()
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("name", &self.inner.name)
            .field("address", &self.inner.options.address())
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn swap_state(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    fn emit(&self, generation: u64, kind: ConnectionEventKind) {
        let _ = self.events.send(ConnectionEvent { generation, kind });
    }

    /// One connect attempt followed by the delivery loop of its session
    async fn run(self: Arc<Self>, generation: u64) {
        let session = match self.transport.connect(&self.options).await {
            Ok(session) => session,
            Err(e) => {
                warn!("{}: connect to {} failed: {}", self.name, self.options.address(), e);
                self.finish(generation, Some(e.to_string()));
                return;
            }
        };

        let Session {
            handle,
            mut events,
            session_present,
        } = session;

        {
            let mut control = self.control.lock();
            if control.generation != generation {
                handle.close();
                return;
            }
            control.session = Some(handle);
            self.set_state(ConnectionState::Connected);
            self.emit(generation, ConnectionEventKind::Connected { session_present });
        }
        info!(
            "{}: connected to {} (session_present={})",
            self.name,
            self.options.address(),
            session_present
        );

        let reason = loop {
            match events.recv().await {
                Some(SessionEvent::Message(message)) => self.deliver(generation, message),
                Some(SessionEvent::Closed(reason)) => break reason,
                None => break Some("session ended".to_string()),
            }
        };

        self.finish(generation, reason);
    }

    /// Hand one message to the handler; a panic is contained to this message
    fn deliver(&self, generation: u64, message: Message) {
        let handler = self.handler.read().clone();
        let Some(handler) = handler else {
            debug!("{}: no handler, ignoring message on {}", self.name, message.topic);
            return;
        };

        let topic = message.topic.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            error!("{}: message handler panicked on {}", self.name, topic);
            self.emit(generation, ConnectionEventKind::HandlerPanicked { topic });
        }
    }

    /// Move to `Disconnected` if `generation` is still current
    fn finish(&self, generation: u64, error: Option<String>) {
        let mut control = self.control.lock();
        if control.generation != generation {
            return;
        }
        control.session = None;
        control.task = None;
        if error.is_some() {
            control.last_error = error.clone();
        }

        let previous = self.swap_state(ConnectionState::Disconnected);
        if previous == ConnectionState::Connected {
            match &error {
                Some(e) => warn!("{}: connection to {} lost: {}", self.name, self.options.address(), e),
                None => info!("{}: connection to {} closed", self.name, self.options.address()),
            }
        }
        self.emit(generation, ConnectionEventKind::Disconnected { error });
    }
}
