//! Chain-family providers layered on a transport.
//!
//! Requests are correlated by id on top of the fire-and-forget transport;
//! peer-pushed events are renamed into the canonical vocabulary whatever
//! dialect the wallet speaks.

mod aleo;
mod evm;
mod starknet;

pub use aleo::AleoProvider;
pub use evm::EvmProvider;
pub use starknet::{DeployedContract, StarknetProvider};

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::domain::{ChainFamily, ChainId};
use crate::envelope::{Envelope, PeerEvent, RpcRequest, RpcResponse, KIND_EVENT, KIND_RESPONSE};
use crate::ports::{BridgeError, ListenerId, Transport, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderEventKind {
    AccountsChanged,
    ChainChanged,
    Disconnected,
}

impl ProviderEventKind {
    pub fn canonical_name(self) -> &'static str {
        match self {
            Self::AccountsChanged => "accountsChanged",
            Self::ChainChanged => "chainChanged",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn from_native(name: &str) -> Option<Self> {
        match name {
            "accountsChanged" | "accounts_changed" | "accountChanged" => {
                Some(Self::AccountsChanged)
            }
            "chainChanged" | "chain_changed" | "networkChanged" => Some(Self::ChainChanged),
            "disconnect" | "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub sequence: u64,
    pub kind: ProviderEventKind,
    pub value: String,
}

type Listener = Arc<dyn Fn(&ProviderEvent) + Send + Sync>;

// Providers sharing one transport all see every response, so ids are process-wide.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

struct Registration {
    id: ListenerId,
    kind: ProviderEventKind,
    listener: Listener,
}

#[derive(Debug, Default)]
struct ProviderState {
    accounts: Vec<String>,
    chain_id: Option<ChainId>,
    event_seq: u64,
    events: Vec<ProviderEvent>,
}

struct Methods {
    accounts: &'static str,
    chain_id: &'static str,
}

fn methods(family: ChainFamily) -> Methods {
    match family {
        ChainFamily::Evm => Methods {
            accounts: "eth_requestAccounts",
            chain_id: "eth_chainId",
        },
        ChainFamily::Starknet => Methods {
            accounts: "wallet_requestAccounts",
            chain_id: "wallet_requestChainId",
        },
        ChainFamily::Aleo => Methods {
            accounts: "aleo_requestAccounts",
            chain_id: "aleo_getNetwork",
        },
    }
}

type PendingReplies = HashMap<u64, oneshot::Sender<Result<Value, BridgeError>>>;

struct ProviderInner<T: Transport> {
    transport: Arc<T>,
    family: ChainFamily,
    request_timeout: Duration,
    next_listener: AtomicU64,
    pending: Mutex<PendingReplies>,
    state: Mutex<ProviderState>,
    listeners: Mutex<Vec<Registration>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Drop for ProviderInner<T> {
    fn drop(&mut self) {
        if let Ok(slot) = self.pump.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

/// Generic request/event surface shared by every chain family.
pub struct Provider<T: Transport> {
    inner: Arc<ProviderInner<T>>,
}

impl<T: Transport> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("family", &self.inner.family)
            .field("peer", &self.inner.transport.descriptor().url())
            .finish()
    }
}

impl<T: Transport> Provider<T> {
    /// Must be called inside a tokio runtime; spawns the event pump.
    pub fn new(transport: Arc<T>, family: ChainFamily, request_timeout: Duration) -> Self {
        let events = transport.subscribe();
        let inner = Arc::new(ProviderInner {
            transport,
            family,
            request_timeout,
            next_listener: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            state: Mutex::new(ProviderState::default()),
            listeners: Mutex::new(Vec::new()),
            pump: Mutex::new(None),
        });
        let handle = tokio::spawn(pump(Arc::downgrade(&inner), events));
        if let Ok(mut slot) = inner.pump.lock() {
            *slot = Some(handle);
        }
        Self { inner }
    }

    pub fn family(&self) -> ChainFamily {
        self.inner.family
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope::request(&RpcRequest {
            id,
            method: method.to_owned(),
            params,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending()?.insert(id, tx);
        if let Err(e) = self.inner.transport.send(&envelope) {
            self.inner.pending()?.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::closed()),
            Err(_) => {
                self.inner.pending()?.remove(&id);
                Err(BridgeError::MessageFailed(format!(
                    "{method} got no response within {}ms",
                    self.inner.request_timeout.as_millis()
                )))
            }
        }
    }

    pub async fn get_accounts(&self) -> Result<Vec<String>, BridgeError> {
        let result = self
            .request(methods(self.inner.family).accounts, Value::Array(Vec::new()))
            .await?;
        let accounts = parse_accounts(&result)?;
        let changed = {
            let mut g = self.inner.state()?;
            let changed = g.accounts != accounts;
            g.accounts = accounts.clone();
            changed
        };
        if changed {
            self.inner
                .record_event(ProviderEventKind::AccountsChanged, accounts_value(&accounts))?;
        }
        Ok(accounts)
    }

    pub async fn get_chain_id(&self) -> Result<ChainId, BridgeError> {
        let result = self
            .request(methods(self.inner.family).chain_id, Value::Array(Vec::new()))
            .await?;
        let chain_id = parse_chain(self.inner.family, &result)?;
        let changed = {
            let mut g = self.inner.state()?;
            let changed = g.chain_id.as_ref() != Some(&chain_id);
            g.chain_id = Some(chain_id.clone());
            changed
        };
        if changed {
            self.inner
                .record_event(ProviderEventKind::ChainChanged, chain_id.to_string())?;
        }
        Ok(chain_id)
    }

    pub fn on<F>(&self, kind: ProviderEventKind, listener: F) -> ListenerId
    where
        F: Fn(&ProviderEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::SeqCst) + 1);
        if let Ok(mut g) = self.inner.listeners.lock() {
            g.push(Registration {
                id,
                kind,
                listener: Arc::new(listener),
            });
        }
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        match self.inner.listeners.lock() {
            Ok(mut g) => {
                let before = g.len();
                g.retain(|r| r.id != id);
                g.len() != before
            }
            Err(_) => false,
        }
    }

    /// Last known accounts, without a round trip.
    pub fn accounts(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .map(|g| g.accounts.clone())
            .unwrap_or_default()
    }

    pub fn chain_id(&self) -> Option<ChainId> {
        self.inner
            .state
            .lock()
            .ok()
            .and_then(|g| g.chain_id.clone())
    }

    pub fn drain_events(&self) -> Result<Vec<ProviderEvent>, BridgeError> {
        let mut g = self.inner.state()?;
        Ok(std::mem::take(&mut g.events))
    }
}

impl<T: Transport> ProviderInner<T> {
    fn pending(&self) -> Result<MutexGuard<'_, PendingReplies>, BridgeError> {
        self.pending
            .lock()
            .map_err(|e| BridgeError::Transport(format!("provider lock poisoned: {e}")))
    }

    fn state(&self) -> Result<MutexGuard<'_, ProviderState>, BridgeError> {
        self.state
            .lock()
            .map_err(|e| BridgeError::Transport(format!("provider lock poisoned: {e}")))
    }

    fn record_event(&self, kind: ProviderEventKind, value: String) -> Result<(), BridgeError> {
        let event = {
            let mut g = self.state()?;
            g.event_seq = g.event_seq.saturating_add(1);
            let event = ProviderEvent {
                sequence: g.event_seq,
                kind,
                value,
            };
            g.events.push(event.clone());
            event
        };
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .map(|g| {
                g.iter()
                    .filter(|r| r.kind == kind)
                    .map(|r| Arc::clone(&r.listener))
                    .collect()
            })
            .unwrap_or_default();
        for listener in listeners {
            listener(&event);
        }
        Ok(())
    }

    fn handle_transport_event(&self, event: TransportEvent) -> Result<(), BridgeError> {
        match event {
            TransportEvent::Message(envelope) => match envelope.kind.as_str() {
                KIND_RESPONSE => self.resolve_response(envelope),
                KIND_EVENT => self.dispatch_peer_event(envelope),
                other => {
                    tracing::debug!(kind = other, "provider ignoring message");
                    Ok(())
                }
            },
            TransportEvent::Disconnected { reason } => {
                let waiting: Vec<_> = self.pending()?.drain().map(|(_, tx)| tx).collect();
                for tx in waiting {
                    let _ = tx.send(Err(BridgeError::closed()));
                }
                self.record_event(ProviderEventKind::Disconnected, reason)
            }
            TransportEvent::Error(err) => {
                tracing::debug!(error = %err, "transport reported error");
                Ok(())
            }
            TransportEvent::Connected { .. } => Ok(()),
        }
    }

    fn resolve_response(&self, envelope: Envelope) -> Result<(), BridgeError> {
        let response: RpcResponse = serde_json::from_value(envelope.data.unwrap_or(Value::Null))
            .map_err(|e| BridgeError::MessageFailed(format!("invalid response: {e}")))?;
        let waiting = self.pending()?.remove(&response.id);
        match waiting {
            Some(tx) => {
                let _ = tx.send(response.into_result());
            }
            None => tracing::debug!(id = response.id, "response for unknown request"),
        }
        Ok(())
    }

    fn dispatch_peer_event(&self, envelope: Envelope) -> Result<(), BridgeError> {
        let event: PeerEvent = serde_json::from_value(envelope.data.unwrap_or(Value::Null))
            .map_err(|e| BridgeError::MessageFailed(format!("invalid peer event: {e}")))?;
        if let Some(family) = event.family.as_deref().and_then(ChainFamily::parse) {
            if family != self.family {
                return Ok(());
            }
        }
        let Some(kind) = ProviderEventKind::from_native(&event.event) else {
            tracing::debug!(event = %event.event, "unknown peer event");
            return Ok(());
        };

        let value = match kind {
            ProviderEventKind::AccountsChanged => {
                let accounts = parse_accounts(&event.data)?;
                let value = accounts_value(&accounts);
                self.state()?.accounts = accounts;
                value
            }
            ProviderEventKind::ChainChanged => {
                let chain_id = parse_chain(self.family, &event.data)?;
                let value = chain_id.to_string();
                self.state()?.chain_id = Some(chain_id);
                value
            }
            ProviderEventKind::Disconnected => event
                .data
                .as_str()
                .unwrap_or("peer disconnected")
                .to_owned(),
        };
        self.record_event(kind, value)
    }
}

async fn pump<T: Transport>(
    inner: Weak<ProviderInner<T>>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let Err(e) = inner.handle_transport_event(event) {
            tracing::warn!(error = %e, family = %inner.family, "provider dropped peer message");
        }
    }
}

fn accounts_value(accounts: &[String]) -> String {
    serde_json::to_string(accounts).unwrap_or_else(|_| "[]".to_owned())
}

fn parse_accounts(value: &Value) -> Result<Vec<String>, BridgeError> {
    match value {
        Value::String(single) => Ok(vec![single.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_owned).ok_or_else(|| {
                    BridgeError::MessageFailed("account entries must be strings".to_owned())
                })
            })
            .collect(),
        other => Err(BridgeError::MessageFailed(format!(
            "accounts must be an array, got {other}"
        ))),
    }
}

fn parse_chain(family: ChainFamily, value: &Value) -> Result<ChainId, BridgeError> {
    let parsed = match family {
        ChainFamily::Evm => evm::json_chain_id_to_u64(value).map(ChainId::evm),
        ChainFamily::Starknet => {
            let raw = value.as_str().ok_or_else(|| {
                BridgeError::MessageFailed("starknet chain id must be a string".to_owned())
            })?;
            ChainId::qualify(family, &starknet::decode_short_string(raw))
        }
        ChainFamily::Aleo => {
            let raw = value.as_str().ok_or_else(|| {
                BridgeError::MessageFailed("aleo network must be a string".to_owned())
            })?;
            ChainId::qualify(family, raw)
        }
    };
    parsed.map_err(|e| match e {
        BridgeError::Configuration(msg) => BridgeError::MessageFailed(msg),
        other => other,
    })
}

/// A provider typed for the family it was negotiated for.
pub enum ChainProvider<T: Transport> {
    Evm(EvmProvider<T>),
    Starknet(StarknetProvider<T>),
    Aleo(AleoProvider<T>),
}

impl<T: Transport> Clone for ChainProvider<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Evm(p) => Self::Evm(p.clone()),
            Self::Starknet(p) => Self::Starknet(p.clone()),
            Self::Aleo(p) => Self::Aleo(p.clone()),
        }
    }
}

impl<T: Transport> fmt::Debug for ChainProvider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Transport> ChainProvider<T> {
    pub fn new(transport: Arc<T>, family: ChainFamily, request_timeout: Duration) -> Self {
        let base = Provider::new(transport, family, request_timeout);
        match family {
            ChainFamily::Evm => Self::Evm(EvmProvider::new(base)),
            ChainFamily::Starknet => Self::Starknet(StarknetProvider::new(base)),
            ChainFamily::Aleo => Self::Aleo(AleoProvider::new(base)),
        }
    }

    pub fn as_evm(&self) -> Option<&EvmProvider<T>> {
        match self {
            Self::Evm(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_starknet(&self) -> Option<&StarknetProvider<T>> {
        match self {
            Self::Starknet(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_aleo(&self) -> Option<&AleoProvider<T>> {
        match self {
            Self::Aleo(p) => Some(p),
            _ => None,
        }
    }
}

impl<T: Transport> Deref for ChainProvider<T> {
    type Target = Provider<T>;

    fn deref(&self) -> &Provider<T> {
        match self {
            Self::Evm(p) => &**p,
            Self::Starknet(p) => &**p,
            Self::Aleo(p) => &**p,
        }
    }
}

/// Reads a string result that wallets return either bare or under `key`.
fn string_result(value: &Value, key: &str) -> Result<String, BridgeError> {
    value
        .as_str()
        .or_else(|| value.get(key).and_then(Value::as_str))
        .map(str::to_owned)
        .ok_or_else(|| BridgeError::MessageFailed(format!("expected string or {{{key}}} result")))
}
