use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{PeerDescriptor, ScreenGeometry, WindowFeatures};
use crate::envelope::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Blocked,
    Timeout { after: Duration },
    Closed,
    Cancelled,
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked => f.write_str("popup blocked"),
            Self::Timeout { after } => {
                write!(f, "peer did not respond within {}ms", after.as_millis())
            }
            Self::Closed => f.write_str("channel closed"),
            Self::Cancelled => f.write_str("connection cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(ConnectionFailure),
    #[error("message failed: {0}")]
    MessageFailed(String),
    #[error("origin validation failed: claimed {claimed}, actual {actual}")]
    OriginValidationFailed { claimed: String, actual: String },
    #[error("peer returned error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl BridgeError {
    pub fn closed() -> Self {
        Self::ConnectionFailed(ConnectionFailure::Closed)
    }

    pub fn failure(&self) -> Option<ConnectionFailure> {
        match self {
            Self::ConnectionFailed(failure) => Some(*failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// A message as delivered by the host's message event, before any validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub source: Option<WindowId>,
    pub origin: String,
    pub data: Value,
}

pub type MessageListener = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Handle to another browsing context (the popup we opened, or our opener).
pub trait PeerWindow: Send + Sync {
    fn id(&self) -> WindowId;
    fn is_closed(&self) -> bool;
    fn post_message(&self, message: &Value, target_origin: &str) -> Result<(), BridgeError>;
    fn close(&self);
}

/// The window environment a transport runs in.
pub trait HostPort: Send + Sync {
    /// Returns `None` when the popup blocker refused the window.
    fn open_window(
        &self,
        url: &str,
        target: &str,
        features: &WindowFeatures,
    ) -> Option<Arc<dyn PeerWindow>>;
    fn opener(&self) -> Option<Arc<dyn PeerWindow>>;
    fn screen(&self) -> ScreenGeometry;
    fn add_message_listener(&self, listener: MessageListener) -> ListenerId;
    fn remove_message_listener(&self, id: ListenerId) -> bool;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { url: String },
    Message(Envelope),
    Error(BridgeError),
    Disconnected { reason: String },
}

pub trait Transport: Send + Sync + 'static {
    fn descriptor(&self) -> &PeerDescriptor;
    fn is_connected(&self) -> bool;
    /// Idempotent; resolves once the handshake completed.
    fn connect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send;
    /// Fire-and-forget delivery. Fails fast once the channel is not connected.
    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError>;
    fn disconnect(&self);
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
    fn last_validated_origin(&self) -> Option<String>;

    fn destroy(&self) {
        self.disconnect();
    }
}

pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    fn create(&self, descriptor: PeerDescriptor) -> Result<Arc<Self::Transport>, BridgeError>;
}

/// Fan-out of transport events to every live subscriber.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventHub {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut g) = self.subscribers.lock() {
            g.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Ok(mut g) = self.subscribers.lock() {
            g.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
