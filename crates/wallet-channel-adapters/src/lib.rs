pub mod config;
pub mod logging;
pub mod mock;
pub mod popup;

pub use config::{BridgeConfig, ConfigError, RuntimeProfile};
pub use logging::{init_logging, init_test_logging};
pub use mock::{MockHost, MockTransport, MockTransportFactory, MockWindow, OpenedWindow, MOCK_PEER};
pub use popup::{PopupTransport, PopupTransportFactory, DISCONNECT_REASON, PEER_CLOSED_REASON};
