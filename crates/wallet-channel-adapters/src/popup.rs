//! Cross-window transport for wallets that live in a popup.
//!
//! One implementation serves both sides of the channel; the descriptor's
//! role decides whether `connect` opens a window or answers an opener.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use wallet_channel_core::{
    classify, validate_inbound, BridgeError, ConnectionFailure, DescriptorDefaults, Envelope,
    EventHub, ExpectedOrigin, HostPort, Inbound, InboundMessage, InboundRejection, ListenerId,
    PeerDescriptor, PeerWindow, Role, Transport, TransportEvent, TransportFactory, WindowFeatures,
    WindowId, ANY_ORIGIN,
};

use crate::config::BridgeConfig;

pub const PEER_CLOSED_REASON: &str = "Popup window closed";
pub const DISCONNECT_REASON: &str = "disconnected";

type HandshakeSender = oneshot::Sender<Result<(), BridgeError>>;

#[derive(Default)]
struct PopupState {
    connected: bool,
    handshake_done: bool,
    peer: Option<Arc<dyn PeerWindow>>,
    owns_peer: bool,
    listener: Option<ListenerId>,
    last_origin: Option<String>,
    handshake: Option<HandshakeSender>,
    poll: Option<JoinHandle<()>>,
}

struct PopupShared {
    descriptor: PeerDescriptor,
    host: Arc<dyn HostPort>,
    state: Mutex<PopupState>,
    events: EventHub,
}

pub struct PopupTransport {
    shared: Arc<PopupShared>,
}

impl std::fmt::Debug for PopupTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopupTransport")
            .field("url", &self.shared.descriptor.url())
            .field("role", &self.shared.descriptor.role())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl PopupTransport {
    pub fn new(descriptor: PeerDescriptor, host: Arc<dyn HostPort>) -> Self {
        Self {
            shared: Arc::new(PopupShared {
                descriptor,
                host,
                state: Mutex::new(PopupState::default()),
                events: EventHub::default(),
            }),
        }
    }

    /// Picks the role from the host: a context with an opener answers it.
    pub fn for_host(url: &str, host: Arc<dyn HostPort>, defaults: &DescriptorDefaults) -> Self {
        let role = Role::detect(host.as_ref());
        Self::new(PeerDescriptor::with_defaults(url, role, defaults), host)
    }
}

impl Drop for PopupTransport {
    fn drop(&mut self) {
        self.shared.teardown(DISCONNECT_REASON);
    }
}

/// Tears the half-open channel down unless the handshake completed, including
/// when the `connect` future is dropped before it resolves.
struct PendingHandshake {
    shared: Option<Arc<PopupShared>>,
}

impl PendingHandshake {
    fn complete(mut self) {
        self.shared = None;
    }
}

impl Drop for PendingHandshake {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.teardown(DISCONNECT_REASON);
        }
    }
}

impl PopupShared {
    fn lock(&self) -> Result<MutexGuard<'_, PopupState>, BridgeError> {
        self.state
            .lock()
            .map_err(|e| BridgeError::Transport(format!("popup lock poisoned: {e}")))
    }

    async fn connect(self: Arc<Self>) -> Result<(), BridgeError> {
        match self.descriptor.role() {
            Role::Opener => self.connect_opener().await,
            Role::Peer => self.connect_peer(),
        }
    }

    async fn connect_opener(self: Arc<Self>) -> Result<(), BridgeError> {
        let handshake = {
            let mut g = self.lock()?;
            if g.connected {
                return Ok(());
            }
            if g.handshake.is_some() {
                return Err(BridgeError::Transport(
                    "handshake already in progress".to_owned(),
                ));
            }
            self.release_listener(&mut g);

            let features = WindowFeatures::centered(
                self.host.screen(),
                self.descriptor.width(),
                self.descriptor.height(),
            );
            let Some(window) =
                self.host
                    .open_window(self.descriptor.url(), self.descriptor.target(), &features)
            else {
                tracing::warn!(url = %self.descriptor.url(), "popup blocked");
                return Err(BridgeError::ConnectionFailed(ConnectionFailure::Blocked));
            };

            let (tx, rx) = oneshot::channel();
            g.listener = Some(self.listen(window.id()));
            g.poll = Some(self.spawn_close_poll(Arc::clone(&window)));
            g.peer = Some(window);
            g.owns_peer = true;
            g.handshake_done = false;
            g.handshake = Some(tx);
            rx
        };

        let pending = PendingHandshake {
            shared: Some(Arc::clone(&self)),
        };
        let timeout = self.descriptor.handshake_timeout();
        tracing::debug!(url = %self.descriptor.url(), ?timeout, "awaiting handshake");
        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(Ok(()))) => {
                pending.complete();
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(BridgeError::ConnectionFailed(ConnectionFailure::Cancelled)),
            Err(_) => {
                tracing::warn!(url = %self.descriptor.url(), "handshake timed out");
                Err(BridgeError::ConnectionFailed(ConnectionFailure::Timeout {
                    after: timeout,
                }))
            }
        }
    }

    fn connect_peer(self: Arc<Self>) -> Result<(), BridgeError> {
        let opener = {
            let mut g = self.lock()?;
            if g.connected {
                return Ok(());
            }
            let opener = self.host.opener().ok_or_else(|| {
                BridgeError::Configuration("peer role requires an opener window".to_owned())
            })?;
            self.release_listener(&mut g);
            g.listener = Some(self.listen(opener.id()));
            g.peer = Some(Arc::clone(&opener));
            g.owns_peer = false;
            g.connected = true;
            g.handshake_done = true;
            opener
        };

        let ready = serde_json::to_value(Envelope::ready())
            .map_err(|e| BridgeError::MessageFailed(format!("encode ready failed: {e}")))?;
        if let Err(e) = opener.post_message(&ready, self.descriptor.origin().as_target()) {
            tracing::warn!(error = %e, "failed to notify opener");
        }
        self.events.emit(TransportEvent::Connected {
            url: self.descriptor.url().to_owned(),
        });
        Ok(())
    }

    fn listen(self: &Arc<Self>, source: WindowId) -> ListenerId {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.host.add_message_listener(Arc::new(move |msg: InboundMessage| {
            if let Some(shared) = weak.upgrade() {
                shared.on_message(&msg, source);
            }
        }))
    }

    fn release_listener(&self, g: &mut PopupState) {
        if let Some(id) = g.listener.take() {
            self.host.remove_message_listener(id);
        }
    }

    fn spawn_close_poll(self: &Arc<Self>, window: Arc<dyn PeerWindow>) -> JoinHandle<()> {
        let period = self.descriptor.close_poll_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                if window.is_closed() {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_peer_closed();
                    }
                    break;
                }
                if weak.strong_count() == 0 {
                    break;
                }
            }
        })
    }

    fn on_message(&self, msg: &InboundMessage, source: WindowId) {
        let validated = match validate_inbound(msg, source, self.descriptor.origin()) {
            Ok(validated) => validated,
            Err(rejection) => {
                self.on_rejected(rejection);
                return;
            }
        };

        let Ok(mut g) = self.state.lock() else {
            return;
        };
        if g.listener.is_none() {
            return;
        }
        g.last_origin = Some(validated.origin);
        match classify(validated.envelope, g.handshake_done) {
            Inbound::HandshakeComplete => {
                g.handshake_done = true;
                g.connected = true;
                let waiting = g.handshake.take();
                drop(g);
                tracing::info!(url = %self.descriptor.url(), "handshake complete");
                if let Some(tx) = waiting {
                    let _ = tx.send(Ok(()));
                }
                self.events.emit(TransportEvent::Connected {
                    url: self.descriptor.url().to_owned(),
                });
            }
            Inbound::DuplicateReady => {
                tracing::debug!("ignoring repeated ready message");
            }
            Inbound::Message(envelope) => {
                drop(g);
                self.events.emit(TransportEvent::Message(envelope));
            }
        }
    }

    fn on_rejected(&self, rejection: InboundRejection) {
        let handshake_done = self.state.lock().map(|g| g.handshake_done).unwrap_or(false);
        match &rejection {
            InboundRejection::ForeignSource { .. } | InboundRejection::OriginMismatch { .. } => {
                tracing::debug!(?rejection, "dropping message from unexpected sender");
                return;
            }
            InboundRejection::OriginValidationFailed { claimed, actual } => {
                tracing::warn!(%claimed, %actual, "origin validation failed");
            }
            InboundRejection::Malformed(reason) => {
                tracing::debug!(%reason, "dropping malformed message");
            }
        }
        if handshake_done {
            self.events.emit(TransportEvent::Error(rejection.into()));
        }
    }

    fn on_peer_closed(&self) {
        let waiting = match self.state.lock() {
            Ok(mut g) if !g.connected => g.handshake.take(),
            Ok(_) => None,
            Err(_) => return,
        };
        match waiting {
            Some(tx) => {
                tracing::info!("popup closed before handshake");
                let _ = tx.send(Err(BridgeError::ConnectionFailed(
                    ConnectionFailure::Cancelled,
                )));
            }
            None => self.teardown(PEER_CLOSED_REASON),
        }
    }

    /// Safe to call repeatedly; only a live channel reports a disconnect.
    fn teardown(&self, reason: &str) {
        let Ok(mut g) = self.state.lock() else {
            return;
        };
        let was_connected = g.connected;
        g.connected = false;
        g.handshake_done = false;
        self.release_listener(&mut g);
        let poll = g.poll.take();
        let peer = g.peer.take();
        let owned = std::mem::take(&mut g.owns_peer);
        let waiting = g.handshake.take();
        drop(g);

        if let Some(poll) = poll {
            poll.abort();
        }
        if let Some(window) = peer.filter(|_| owned) {
            if !window.is_closed() {
                window.close();
            }
        }
        drop(waiting);
        if was_connected {
            tracing::info!(url = %self.descriptor.url(), reason, "channel closed");
            self.events.emit(TransportEvent::Disconnected {
                reason: reason.to_owned(),
            });
        }
    }

    fn target_origin(&self, g: &PopupState) -> String {
        match self.descriptor.origin() {
            ExpectedOrigin::Exact(origin) => origin.clone(),
            ExpectedOrigin::Any => g
                .last_origin
                .clone()
                .unwrap_or_else(|| ANY_ORIGIN.to_owned()),
        }
    }
}

impl Transport for PopupTransport {
    fn descriptor(&self) -> &PeerDescriptor {
        &self.shared.descriptor
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().map(|g| g.connected).unwrap_or(false)
    }

    fn connect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        let shared = Arc::clone(&self.shared);
        async move { shared.connect().await }
    }

    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let (peer, target) = {
            let g = self.shared.lock()?;
            if !g.connected {
                return Err(BridgeError::closed());
            }
            let peer = g.peer.clone().ok_or_else(BridgeError::closed)?;
            (peer, self.shared.target_origin(&g))
        };
        if peer.is_closed() {
            return Err(BridgeError::closed());
        }
        let value = serde_json::to_value(envelope)
            .map_err(|e| BridgeError::MessageFailed(format!("encode envelope failed: {e}")))?;
        peer.post_message(&value, &target)
    }

    fn disconnect(&self) {
        self.shared.teardown(DISCONNECT_REASON);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn last_validated_origin(&self) -> Option<String> {
        self.shared.state.lock().ok().and_then(|g| g.last_origin.clone())
    }
}

/// Builds popup transports against one host, enforcing the runtime profile.
pub struct PopupTransportFactory {
    host: Arc<dyn HostPort>,
    config: BridgeConfig,
}

impl PopupTransportFactory {
    pub fn new(host: Arc<dyn HostPort>, config: BridgeConfig) -> Self {
        Self { host, config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

impl TransportFactory for PopupTransportFactory {
    type Transport = PopupTransport;

    fn create(&self, descriptor: PeerDescriptor) -> Result<Arc<PopupTransport>, BridgeError> {
        if self.config.strict_runtime_required() && descriptor.origin().is_wildcard() {
            return Err(BridgeError::Configuration(format!(
                "production profile refuses wildcard origin for {}",
                descriptor.url()
            )));
        }
        Ok(Arc::new(PopupTransport::new(
            descriptor,
            Arc::clone(&self.host),
        )))
    }
}
