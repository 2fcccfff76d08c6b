//! Per-wallet connection lifecycle.
//!
//! Owns at most one live transport. A failed attempt always disposes the
//! transport it created before the state settles on `Error`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::domain::{
    ChainFamily, ChainId, DescriptorDefaults, DiscoveryRecord, NegotiatedCapabilities,
    PeerDescriptor, Role, WalletMetadata,
};
use crate::negotiator::Negotiator;
use crate::ports::{BridgeError, ConnectionFailure, Transport, TransportEvent, TransportFactory};
use crate::provider::ChainProvider;
use crate::state_machine::{connection_transition, ConnectionAction, ConnectionState};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Families to connect; empty means every negotiated family. The first is primary.
    pub chains: Vec<ChainFamily>,
}

/// A live session handed to the session store and UI.
pub struct Connection<T: Transport> {
    pub address: String,
    pub accounts: Vec<String>,
    pub chain: ChainId,
    pub provider: ChainProvider<T>,
    pub providers: Vec<ChainProvider<T>>,
    pub wallet: WalletMetadata,
    pub capabilities: Arc<NegotiatedCapabilities>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            accounts: self.accounts.clone(),
            chain: self.chain.clone(),
            provider: self.provider.clone(),
            providers: self.providers.clone(),
            wallet: self.wallet.clone(),
            capabilities: Arc::clone(&self.capabilities),
        }
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("accounts", &self.accounts)
            .field("chain", &self.chain)
            .field("wallet", &self.wallet.id)
            .finish()
    }
}

impl<T: Transport> Connection<T> {
    pub fn provider_for(&self, family: ChainFamily) -> Option<&ChainProvider<T>> {
        self.providers.iter().find(|p| p.family() == family)
    }
}

struct ControllerInner<T: Transport> {
    state: ConnectionState,
    generation: u64,
    transport: Option<Arc<T>>,
    connection: Option<Connection<T>>,
    watcher: Option<JoinHandle<()>>,
    last_error: Option<BridgeError>,
}

struct Released<T: Transport> {
    transport: Option<Arc<T>>,
    connection: Option<Connection<T>>,
    watcher: Option<JoinHandle<()>>,
}

impl<T: Transport> Released<T> {
    /// Transport goes first so providers never outlive it.
    fn dispose(self) {
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
        if let Some(transport) = self.transport {
            transport.disconnect();
        }
        drop(self.connection);
    }
}

impl<T: Transport> ControllerInner<T> {
    fn release(&mut self) -> Released<T> {
        Released {
            transport: self.transport.take(),
            connection: self.connection.take(),
            watcher: self.watcher.take(),
        }
    }
}

/// Settles an in-flight attempt as cancelled if its future is dropped
/// before `connect` returns.
struct PendingAttempt<'a, T: Transport> {
    shared: Option<&'a Shared<T>>,
    generation: u64,
}

impl<T: Transport> PendingAttempt<'_, T> {
    fn settle(mut self) {
        self.shared = None;
    }
}

impl<T: Transport> Drop for PendingAttempt<'_, T> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let cancelled = BridgeError::ConnectionFailed(ConnectionFailure::Cancelled);
        if let Err(e) = shared.fail(self.generation, &cancelled) {
            tracing::error!(error = %e, "failed to settle abandoned connection attempt");
        }
    }
}

struct Shared<T: Transport> {
    inner: Mutex<ControllerInner<T>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl<T: Transport> Shared<T> {
    fn lock(&self) -> Result<MutexGuard<'_, ControllerInner<T>>, BridgeError> {
        self.inner
            .lock()
            .map_err(|e| BridgeError::Transport(format!("controller lock poisoned: {e}")))
    }

    fn apply(
        &self,
        g: &mut ControllerInner<T>,
        action: ConnectionAction,
    ) -> Result<(), BridgeError> {
        let transition = connection_transition(g.state, action)?;
        if transition.from != transition.to {
            tracing::info!(
                from = ?transition.from,
                to = ?transition.to,
                reason = transition.reason,
                "connection state changed"
            );
        }
        g.state = transition.to;
        self.state_tx.send_replace(transition.to);
        Ok(())
    }

    fn begin(&self) -> Result<u64, BridgeError> {
        let mut g = self.lock()?;
        self.apply(&mut g, ConnectionAction::Connect)?;
        g.generation = g.generation.wrapping_add(1);
        g.last_error = None;
        Ok(g.generation)
    }

    fn attach(&self, generation: u64, transport: &Arc<T>) -> Result<(), BridgeError> {
        let mut g = self.lock()?;
        if g.generation != generation {
            drop(g);
            transport.disconnect();
            return Err(BridgeError::ConnectionFailed(ConnectionFailure::Cancelled));
        }
        let prior = g.release();
        g.transport = Some(Arc::clone(transport));
        drop(g);
        prior.dispose();
        Ok(())
    }

    fn fail(&self, generation: u64, err: &BridgeError) -> Result<(), BridgeError> {
        let released = {
            let mut g = self.lock()?;
            if g.generation != generation {
                return Ok(());
            }
            let released = g.release();
            self.apply(&mut g, ConnectionAction::Fail)?;
            g.last_error = Some(err.clone());
            released
        };
        tracing::warn!(error = %err, "connection attempt failed");
        released.dispose();
        Ok(())
    }

    fn on_transport_closed(&self, generation: u64, reason: &str) -> Result<(), BridgeError> {
        let released = {
            let mut g = self.lock()?;
            if g.generation != generation || g.state != ConnectionState::Connected {
                return Ok(());
            }
            let released = g.release();
            self.apply(&mut g, ConnectionAction::Disconnect)?;
            released
        };
        tracing::info!(reason, "peer closed the channel");
        released.dispose();
        Ok(())
    }
}

async fn watch_transport<T: Transport>(
    shared: Weak<Shared<T>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        if let TransportEvent::Disconnected { reason } = event {
            if let Some(shared) = shared.upgrade() {
                if let Err(e) = shared.on_transport_closed(generation, &reason) {
                    tracing::error!(error = %e, "failed to settle closed connection");
                }
            }
            break;
        }
    }
}

pub struct ConnectionController<F: TransportFactory> {
    factory: F,
    defaults: DescriptorDefaults,
    negotiator: Mutex<Negotiator>,
    shared: Arc<Shared<F::Transport>>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl<F: TransportFactory> ConnectionController<F> {
    pub fn new(factory: F, defaults: DescriptorDefaults) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            factory,
            defaults,
            negotiator: Mutex::new(Negotiator::new()),
            shared: Arc::new(Shared {
                inner: Mutex::new(ControllerInner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    transport: None,
                    connection: None,
                    watcher: None,
                    last_error: None,
                }),
                state_tx,
            }),
            connect_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn connection(&self) -> Option<Connection<F::Transport>> {
        self.shared
            .lock()
            .ok()
            .and_then(|g| g.connection.clone())
    }

    pub fn last_error(&self) -> Option<BridgeError> {
        self.shared.lock().ok().and_then(|g| g.last_error.clone())
    }

    /// Returns the live connection unchanged when already connected.
    pub async fn connect(
        &self,
        record: &DiscoveryRecord,
        options: ConnectOptions,
    ) -> Result<Connection<F::Transport>, BridgeError> {
        let _gate = self.connect_gate.lock().await;
        if let Some(existing) = self.connection() {
            tracing::debug!(wallet = %existing.wallet.id, "reusing live connection");
            return Ok(existing);
        }

        let generation = self.shared.begin()?;
        let attempt = PendingAttempt {
            shared: Some(self.shared.as_ref()),
            generation,
        };
        let result = self.establish(record, &options, generation).await;
        attempt.settle();
        match result {
            Ok(connection) => Ok(connection),
            Err(e) => {
                self.shared.fail(generation, &e)?;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        record: &DiscoveryRecord,
        options: &ConnectOptions,
        generation: u64,
    ) -> Result<Connection<F::Transport>, BridgeError> {
        record.validate()?;
        let capabilities = self
            .negotiator
            .lock()
            .map_err(|e| BridgeError::Transport(format!("negotiator lock poisoned: {e}")))?
            .negotiate(record)?;
        let families = requested_families(&capabilities, options)?;

        let transport_record = record.transport.as_ref().ok_or_else(|| {
            BridgeError::Configuration(format!(
                "wallet {} exposes no transport metadata",
                record.id
            ))
        })?;
        let descriptor =
            PeerDescriptor::from_transport_record(transport_record, Role::Opener, &self.defaults)?;

        let transport = self.factory.create(descriptor)?;
        let events = transport.subscribe();
        self.shared.attach(generation, &transport)?;

        tracing::info!(wallet = %record.id, url = %transport.descriptor().url(), "connecting");
        transport.connect().await?;

        let providers: Vec<_> = families
            .iter()
            .map(|family| {
                ChainProvider::new(Arc::clone(&transport), *family, self.defaults.request_timeout)
            })
            .collect();
        let provider = providers[0].clone();

        let accounts = provider.get_accounts().await?;
        let address = accounts.first().cloned().ok_or_else(|| BridgeError::Rpc {
            code: 4100,
            message: "wallet returned no accounts".to_owned(),
        })?;
        let chain = provider.get_chain_id().await?;

        let connection = Connection {
            address,
            accounts,
            chain,
            provider,
            providers,
            wallet: record.metadata(),
            capabilities,
        };

        let mut g = self.shared.lock()?;
        if g.generation != generation {
            return Err(BridgeError::ConnectionFailed(ConnectionFailure::Cancelled));
        }
        self.shared.apply(&mut g, ConnectionAction::HandshakeSucceeded)?;
        g.connection = Some(connection.clone());
        g.watcher = Some(tokio::spawn(watch_transport(
            Arc::downgrade(&self.shared),
            generation,
            events,
        )));
        drop(g);

        tracing::info!(
            wallet = %connection.wallet.id,
            chain = %connection.chain,
            accounts = connection.accounts.len(),
            "connected"
        );
        Ok(connection)
    }

    /// Idempotent. Tears the transport down before dropping provider handles.
    pub fn disconnect(&self) -> Result<(), BridgeError> {
        let released = {
            let mut g = self.shared.lock()?;
            g.generation = g.generation.wrapping_add(1);
            let released = g.release();
            self.shared.apply(&mut g, ConnectionAction::Disconnect)?;
            released
        };
        released.dispose();
        Ok(())
    }
}

fn requested_families(
    capabilities: &NegotiatedCapabilities,
    options: &ConnectOptions,
) -> Result<Vec<ChainFamily>, BridgeError> {
    let negotiated = Negotiator::default_chains(capabilities);
    let families = if options.chains.is_empty() {
        negotiated
    } else {
        if let Some(missing) = options.chains.iter().find(|f| !negotiated.contains(f)) {
            return Err(BridgeError::Configuration(format!(
                "wallet does not support chain family {missing}"
            )));
        }
        options.chains.clone()
    };
    if families.is_empty() {
        return Err(BridgeError::Configuration(
            "no chain families to connect".to_owned(),
        ));
    }
    Ok(families)
}
