pub mod controller;
pub mod domain;
pub mod envelope;
pub mod negotiator;
pub mod ports;
pub mod provider;
pub mod state_machine;

pub use controller::{ConnectOptions, Connection, ConnectionController};
pub use domain::{
    ChainFamily, ChainId, DescriptorDefaults, DiscoveryRecord, ExpectedOrigin, Feature,
    NegotiatedCapabilities, NegotiatedChain, NetworkSource, PeerDescriptor, Role, ScreenGeometry,
    TechnologyRecord, TransportKind, TransportRecord, WalletMetadata, WindowFeatures, ANY_ORIGIN,
};
pub use domain::parse_evm_chain_id;
pub use envelope::{
    classify, validate_inbound, Envelope, Inbound, InboundRejection, OriginContext, PeerEvent,
    RpcErrorObject, RpcRequest, RpcResponse, ValidatedMessage, KIND_EVENT, KIND_REQUEST,
    KIND_RESPONSE, LEGACY_WRAPPER_KIND, READY_KINDS,
};
pub use negotiator::Negotiator;
pub use ports::{
    BridgeError, ConnectionFailure, EventHub, HostPort, InboundMessage, ListenerId,
    MessageListener, PeerWindow, Transport, TransportEvent, TransportFactory, WindowId,
};
pub use provider::{
    AleoProvider, ChainProvider, DeployedContract, EvmProvider, Provider, ProviderEvent,
    ProviderEventKind, StarknetProvider,
};
pub use state_machine::{
    connection_transition, ConnectionAction, ConnectionState, StateTransition,
};
