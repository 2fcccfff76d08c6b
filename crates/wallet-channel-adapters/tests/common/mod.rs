#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use wallet_channel_adapters::{init_test_logging, MockHost, MockTransport, PopupTransport};
use wallet_channel_core::{DiscoveryRecord, PeerDescriptor, Role};

pub const WALLET_URL: &str = "https://wallet.example/connect";
pub const WALLET_ORIGIN: &str = "https://wallet.example";
pub const EVIL_ORIGIN: &str = "https://evil.example";
pub const ACCOUNT: &str = "0x1000000000000000000000000000000000000001";
pub const ACCOUNT_B: &str = "0x2000000000000000000000000000000000000002";

pub fn descriptor() -> PeerDescriptor {
    PeerDescriptor::new(WALLET_URL, Role::Opener).with_size(400, 600)
}

pub fn popup(host: &Arc<MockHost>) -> PopupTransport {
    init_test_logging();
    PopupTransport::new(descriptor(), host.clone())
}

pub fn ready() -> Value {
    json!({ "type": "connected" })
}

/// Lets spawned tasks and joined futures make progress without moving the clock.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub fn connected_mock() -> Arc<MockTransport> {
    init_test_logging();
    let transport = Arc::new(MockTransport::new(PeerDescriptor::new(WALLET_URL, Role::Opener)));
    transport.respond_to("eth_requestAccounts", json!([ACCOUNT, ACCOUNT_B]));
    transport.respond_to("eth_chainId", json!("0x2105"));
    transport
}

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn wallet_record(technologies: Value) -> DiscoveryRecord {
    DiscoveryRecord::from_json(&json!({
        "id": "io.example.wallet",
        "name": "Example Wallet",
        "rdns": "io.example.wallet",
        "transport": {
            "kind": "popup",
            "url": WALLET_URL,
            "width": 420,
            "height": 640
        },
        "technologies": technologies
    }))
    .expect("valid discovery record")
}

pub fn evm_record() -> DiscoveryRecord {
    wallet_record(json!([{ "type": "evm", "interfaces": ["eip-1193"] }]))
}
