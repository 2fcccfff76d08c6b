//! Deterministic stand-ins for the window environment and for a whole transport.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use wallet_channel_core::{
    classify, validate_inbound, BridgeError, Envelope, EventHub, HostPort, Inbound,
    InboundMessage, ListenerId, MessageListener, PeerDescriptor, PeerWindow, RpcErrorObject,
    RpcRequest, RpcResponse, ScreenGeometry, Transport, TransportEvent, TransportFactory,
    WindowFeatures, WindowId, KIND_EVENT, KIND_REQUEST, KIND_RESPONSE,
};

use crate::popup::{DISCONNECT_REASON, PEER_CLOSED_REASON};

#[derive(Debug)]
pub struct MockWindow {
    id: WindowId,
    closed: AtomicBool,
    close_calls: AtomicUsize,
    posted: Mutex<Vec<(Value, String)>>,
}

impl MockWindow {
    pub fn new(id: WindowId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            posted: Mutex::new(Vec::new()),
        }
    }

    /// What the user closing the window looks like from the outside.
    pub fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::SeqCst);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Every `(message, target_origin)` posted to this window.
    pub fn posted(&self) -> Vec<(Value, String)> {
        self.posted.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl PeerWindow for MockWindow {
    fn id(&self) -> WindowId {
        self.id
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn post_message(&self, message: &Value, target_origin: &str) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::closed());
        }
        self.posted
            .lock()
            .map_err(|e| BridgeError::Transport(format!("mock window lock poisoned: {e}")))?
            .push((message.clone(), target_origin.to_owned()));
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_closed(true);
    }
}

#[derive(Debug, Clone)]
pub struct OpenedWindow {
    pub url: String,
    pub target: String,
    pub features: WindowFeatures,
    pub window: Arc<MockWindow>,
}

#[derive(Default)]
struct MockHostState {
    listeners: Vec<(ListenerId, MessageListener)>,
    opened: Vec<OpenedWindow>,
    opener: Option<Arc<MockWindow>>,
    block_popups: bool,
    screen: ScreenGeometry,
}

/// In-memory window environment. Delivery is synchronous.
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockHostState>,
    next_id: AtomicU64,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host running inside a window that something else opened.
    pub fn with_opener() -> Self {
        let host = Self::default();
        let opener = Arc::new(MockWindow::new(host.allocate_id()));
        host.lock().opener = Some(opener);
        host
    }

    fn allocate_id(&self) -> WindowId {
        WindowId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn lock(&self) -> MutexGuard<'_, MockHostState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn block_popups(&self, blocked: bool) {
        self.lock().block_popups = blocked;
    }

    pub fn set_screen(&self, screen: ScreenGeometry) {
        self.lock().screen = screen;
    }

    pub fn opened(&self) -> Vec<OpenedWindow> {
        self.lock().opened.clone()
    }

    pub fn last_opened(&self) -> Option<Arc<MockWindow>> {
        self.lock().opened.last().map(|w| Arc::clone(&w.window))
    }

    pub fn opener_window(&self) -> Option<Arc<MockWindow>> {
        self.lock().opener.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Delivers as if sent by the most recently opened popup, or by the opener.
    pub fn deliver(&self, origin: &str, data: Value) {
        let source = {
            let g = self.lock();
            g.opened
                .last()
                .map(|w| w.window.id)
                .or_else(|| g.opener.as_ref().map(|w| w.id))
        };
        self.deliver_from(source, origin, data);
    }

    pub fn deliver_from(&self, source: Option<WindowId>, origin: &str, data: Value) {
        let listeners: Vec<MessageListener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        let message = InboundMessage {
            source,
            origin: origin.to_owned(),
            data,
        };
        for listener in listeners {
            listener(message.clone());
        }
    }
}

impl HostPort for MockHost {
    fn open_window(
        &self,
        url: &str,
        target: &str,
        features: &WindowFeatures,
    ) -> Option<Arc<dyn PeerWindow>> {
        if self.lock().block_popups {
            return None;
        }
        let window = Arc::new(MockWindow::new(self.allocate_id()));
        self.lock().opened.push(OpenedWindow {
            url: url.to_owned(),
            target: target.to_owned(),
            features: *features,
            window: Arc::clone(&window),
        });
        Some(window as Arc<dyn PeerWindow>)
    }

    fn opener(&self) -> Option<Arc<dyn PeerWindow>> {
        self.lock()
            .opener
            .clone()
            .map(|w| w as Arc<dyn PeerWindow>)
    }

    fn screen(&self) -> ScreenGeometry {
        self.lock().screen
    }

    fn add_message_listener(&self, listener: MessageListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().listeners.push((id, listener));
        id
    }

    fn remove_message_listener(&self, id: ListenerId) -> bool {
        let mut g = self.lock();
        let before = g.listeners.len();
        g.listeners.retain(|(lid, _)| *lid != id);
        g.listeners.len() != before
    }
}

pub const MOCK_PEER: WindowId = WindowId(u64::MAX);

#[derive(Debug, Clone)]
enum Responder {
    Result(Value),
    Error(RpcErrorObject),
}

#[derive(Debug, Default)]
struct MockTransportState {
    connected: bool,
    connect_calls: usize,
    disconnect_calls: usize,
    fail_connect: Option<BridgeError>,
    responders: HashMap<String, Responder>,
    sent: Vec<Envelope>,
    last_origin: Option<String>,
}

/// Whole-transport stand-in: scripted RPC replies, no windows, same envelope rules.
#[derive(Debug)]
pub struct MockTransport {
    descriptor: PeerDescriptor,
    state: Mutex<MockTransportState>,
    events: EventHub,
}

impl MockTransport {
    pub fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            state: Mutex::new(MockTransportState::default()),
            events: EventHub::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn respond_to(&self, method: &str, result: Value) {
        self.lock()
            .responders
            .insert(method.to_owned(), Responder::Result(result));
    }

    pub fn respond_error(&self, method: &str, code: i64, message: &str) {
        self.lock().responders.insert(
            method.to_owned(),
            Responder::Error(RpcErrorObject {
                code,
                message: message.to_owned(),
            }),
        );
    }

    pub fn fail_connect(&self, err: BridgeError) {
        self.lock().fail_connect = Some(err);
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.lock().sent.clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|e| serde_json::from_value::<RpcRequest>(e.data?).ok())
            .map(|r| r.method)
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    /// Runs raw peer data through inbound validation as if it came from the peer window.
    pub fn deliver(&self, origin: &str, data: Value) {
        let message = InboundMessage {
            source: Some(MOCK_PEER),
            origin: origin.to_owned(),
            data,
        };
        let validated = match validate_inbound(&message, MOCK_PEER, self.descriptor.origin()) {
            Ok(validated) => validated,
            Err(rejection) => {
                if self.is_connected() {
                    self.events.emit(TransportEvent::Error(rejection.into()));
                }
                return;
            }
        };
        let mut g = self.lock();
        g.last_origin = Some(validated.origin);
        match classify(validated.envelope, g.connected) {
            Inbound::HandshakeComplete => {
                g.connected = true;
                drop(g);
                self.events.emit(TransportEvent::Connected {
                    url: self.descriptor.url().to_owned(),
                });
            }
            Inbound::DuplicateReady => {}
            Inbound::Message(envelope) => {
                drop(g);
                self.events.emit(TransportEvent::Message(envelope));
            }
        }
    }

    pub fn push_event(&self, event: &str, data: Value) {
        self.push(Envelope::new(KIND_EVENT).with_data(json!({ "event": event, "data": data })));
    }

    pub fn push_family_event(&self, family: &str, event: &str, data: Value) {
        self.push(
            Envelope::new(KIND_EVENT)
                .with_data(json!({ "event": event, "data": data, "family": family })),
        );
    }

    pub fn push(&self, envelope: Envelope) {
        self.events.emit(TransportEvent::Message(envelope));
    }

    pub fn simulate_peer_closed(&self) {
        self.close_with(PEER_CLOSED_REASON);
    }

    fn close_with(&self, reason: &str) {
        let was_connected = std::mem::take(&mut self.lock().connected);
        if was_connected {
            self.events.emit(TransportEvent::Disconnected {
                reason: reason.to_owned(),
            });
        }
    }

    fn reply(&self, request: RpcRequest, responder: Responder) {
        let response = match responder {
            Responder::Result(result) => RpcResponse {
                id: request.id,
                result: Some(result),
                error: None,
            },
            Responder::Error(error) => RpcResponse {
                id: request.id,
                result: None,
                error: Some(error),
            },
        };
        match serde_json::to_value(response) {
            Ok(data) => self.push(Envelope::new(KIND_RESPONSE).with_data(data)),
            Err(e) => tracing::error!(error = %e, "mock failed to encode response"),
        }
    }
}

impl Transport for MockTransport {
    fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn connect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send {
        let outcome = {
            let mut g = self.lock();
            g.connect_calls += 1;
            match g.fail_connect.clone() {
                Some(err) => Err(err),
                None if g.connected => Ok(false),
                None => {
                    g.connected = true;
                    Ok(true)
                }
            }
        };
        if let Ok(true) = outcome {
            self.events.emit(TransportEvent::Connected {
                url: self.descriptor.url().to_owned(),
            });
        }
        async move { outcome.map(|_| ()) }
    }

    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let responder = {
            let mut g = self.lock();
            if !g.connected {
                return Err(BridgeError::closed());
            }
            g.sent.push(envelope.clone());
            let request = (envelope.kind == KIND_REQUEST)
                .then(|| envelope.data.clone())
                .flatten()
                .and_then(|data| serde_json::from_value::<RpcRequest>(data).ok());
            request.and_then(|r| g.responders.get(&r.method).cloned().map(|resp| (r, resp)))
        };
        if let Some((request, responder)) = responder {
            self.reply(request, responder);
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.lock().disconnect_calls += 1;
        self.close_with(DISCONNECT_REASON);
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.subscribe()
    }

    fn last_validated_origin(&self) -> Option<String> {
        self.lock().last_origin.clone()
    }
}

type Script = Arc<dyn Fn(&MockTransport) + Send + Sync>;

/// Hands out mock transports, each prepared by the same script, and keeps them for inspection.
#[derive(Default)]
pub struct MockTransportFactory {
    script: Option<Script>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted<S>(script: S) -> Self
    where
        S: Fn(&MockTransport) + Send + Sync + 'static,
    {
        Self {
            script: Some(Arc::new(script)),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<Arc<MockTransport>> {
        self.created.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created().pop()
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn create(&self, descriptor: PeerDescriptor) -> Result<Arc<MockTransport>, BridgeError> {
        let transport = Arc::new(MockTransport::new(descriptor));
        if let Some(script) = &self.script {
            script(&transport);
        }
        self.created
            .lock()
            .map_err(|e| BridgeError::Transport(format!("mock factory lock poisoned: {e}")))?
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}
